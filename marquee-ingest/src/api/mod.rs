//! Operator HTTP API
//!
//! JSON only. Read views over manifests, cursors and admission decisions,
//! plus the resume and abandon actions.

pub mod admissions;
pub mod cursors;
pub mod health;
pub mod manifests;

pub use admissions::admission_routes;
pub use cursors::cursor_routes;
pub use health::health_routes;
pub use manifests::manifest_routes;
