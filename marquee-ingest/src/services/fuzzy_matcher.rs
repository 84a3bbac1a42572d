//! Fuzzy title fallback for references without an external id
//!
//! Best effort only. A reference is matched to an entity that already exists,
//! never to a new one, and only when the best Jaro-Winkler score clears the
//! configured threshold with no runner-up within [`AMBIGUITY_MARGIN`].

use strsim::jaro_winkler;
use uuid::Uuid;

/// Two candidates closer than this are treated as indistinguishable
pub const AMBIGUITY_MARGIN: f64 = 0.02;

#[derive(Debug, Clone, PartialEq)]
pub enum FuzzyOutcome {
    /// No threshold configured
    Disabled,
    Matched { guid: Uuid, score: f64 },
    /// Best score cleared the threshold but another candidate was too close
    Ambiguous { best: f64, runner_up: f64 },
    NoMatch { best: Option<f64> },
}

impl FuzzyOutcome {
    /// Reason recorded on a manifest entry that could not be matched
    pub fn failure_reason(&self, title: &str) -> Option<String> {
        match self {
            FuzzyOutcome::Matched { .. } => None,
            FuzzyOutcome::Disabled => Some(format!(
                "'{}' has no external id and fuzzy matching is disabled",
                title
            )),
            FuzzyOutcome::Ambiguous { best, runner_up } => Some(format!(
                "'{}' matches several entities (best {:.3}, runner-up {:.3})",
                title, best, runner_up
            )),
            FuzzyOutcome::NoMatch { best: Some(best) } => Some(format!(
                "'{}' has no close enough match (best {:.3})",
                title, best
            )),
            FuzzyOutcome::NoMatch { best: None } => {
                Some(format!("'{}' has no candidate entities", title))
            }
        }
    }
}

/// Lowercase, drop punctuation, collapse whitespace, strip a leading article
pub fn normalize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>()
        .to_lowercase();

    let words: Vec<&str> = cleaned.split_whitespace().collect();
    let words = match words.split_first() {
        Some((first, rest)) if !rest.is_empty() && matches!(*first, "the" | "a" | "an") => rest,
        _ => &words[..],
    };
    words.join(" ")
}

/// Pick the unique best candidate for `title`
pub fn best_candidate(
    title: &str,
    candidates: &[(Uuid, String)],
    threshold: Option<f64>,
) -> FuzzyOutcome {
    let Some(threshold) = threshold else {
        return FuzzyOutcome::Disabled;
    };

    let wanted = normalize_title(title);
    let mut scored: Vec<(Uuid, f64)> = candidates
        .iter()
        .map(|(guid, candidate)| (*guid, jaro_winkler(&wanted, &normalize_title(candidate))))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    let Some(&(guid, best)) = scored.first() else {
        return FuzzyOutcome::NoMatch { best: None };
    };

    if best < threshold {
        return FuzzyOutcome::NoMatch { best: Some(best) };
    }

    match scored.get(1) {
        Some(&(_, runner_up)) if best - runner_up < AMBIGUITY_MARGIN => {
            FuzzyOutcome::Ambiguous { best, runner_up }
        }
        _ => FuzzyOutcome::Matched { guid, score: best },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(titles: &[&str]) -> Vec<(Uuid, String)> {
        titles.iter().map(|t| (Uuid::new_v4(), t.to_string())).collect()
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("The Lord of the Rings: The Return of the King"),
            "lord of the rings the return of the king");
        assert_eq!(normalize_title("  Amélie!  "), "amélie");
        assert_eq!(normalize_title("The"), "the");
        assert_eq!(normalize_title("A Beautiful Mind"), "beautiful mind");
    }

    #[test]
    fn test_disabled_without_threshold() {
        let pool = candidates(&["Gladiator"]);
        assert_eq!(best_candidate("Gladiator", &pool, None), FuzzyOutcome::Disabled);
    }

    #[test]
    fn test_exact_title_matches() {
        let pool = candidates(&["Gladiator", "Chocolat", "Traffic"]);
        match best_candidate("gladiator", &pool, Some(0.9)) {
            FuzzyOutcome::Matched { guid, score } => {
                assert_eq!(guid, pool[0].0);
                assert!((score - 1.0).abs() < f64::EPSILON);
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_close_runner_up_is_ambiguous() {
        let pool = candidates(&["Traffic", "Traffic"]);
        assert!(matches!(
            best_candidate("Traffic", &pool, Some(0.9)),
            FuzzyOutcome::Ambiguous { .. }
        ));
    }

    #[test]
    fn test_below_threshold_is_no_match() {
        let pool = candidates(&["Erin Brockovich"]);
        let outcome = best_candidate("Gladiator", &pool, Some(0.9));
        assert!(matches!(outcome, FuzzyOutcome::NoMatch { best: Some(_) }));
        assert!(outcome.failure_reason("Gladiator").is_some());
    }

    #[test]
    fn test_empty_candidates() {
        assert_eq!(
            best_candidate("Gladiator", &[], Some(0.9)),
            FuzzyOutcome::NoMatch { best: None }
        );
    }
}
