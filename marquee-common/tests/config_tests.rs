//! Configuration loading and root folder resolution
//!
//! Tests that touch MARQUEE_ROOT are #[serial] so they never race on the
//! process environment.

use marquee_common::config::{
    load_toml_config, write_toml_config, RootFolderInitializer, RootFolderResolver, TomlConfig,
    ROOT_FOLDER_ENV,
};
use serial_test::serial;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
#[serial]
fn test_env_var_beats_toml() {
    env::set_var(ROOT_FOLDER_ENV, "/from/env");

    let toml = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        ..Default::default()
    };
    let resolved = RootFolderResolver::new(None, Some(&toml)).resolve();

    env::remove_var(ROOT_FOLDER_ENV);
    assert_eq!(resolved, PathBuf::from("/from/env"));
}

#[test]
#[serial]
fn test_toml_used_when_env_missing() {
    env::remove_var(ROOT_FOLDER_ENV);

    let toml = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        ..Default::default()
    };
    let resolved = RootFolderResolver::new(None, Some(&toml)).resolve();
    assert_eq!(resolved, PathBuf::from("/from/toml"));
}

#[test]
#[serial]
fn test_default_when_nothing_configured() {
    env::remove_var(ROOT_FOLDER_ENV);

    let resolved = RootFolderResolver::new(None, None).resolve();
    assert!(resolved.to_string_lossy().contains("marquee"));
}

#[test]
fn test_missing_file_yields_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config = load_toml_config(Some(&temp_dir.path().join("absent.toml"))).unwrap();
    assert!(config.root_folder.is_none());
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_invalid_file_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("marquee.toml");
    std::fs::write(&path, "root_folder = [not toml").unwrap();

    let result = load_toml_config(Some(&path));
    assert!(matches!(result, Err(marquee_common::Error::Config(_))));
}

#[test]
fn test_write_then_load_preserves_sections() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("marquee.toml");

    let mut config = TomlConfig {
        root_folder: Some(PathBuf::from("/srv/marquee")),
        ..Default::default()
    };
    config.catalog.base_url = Some("https://catalog.example".to_string());
    config.catalog.requests_per_second = 10;
    config
        .admission
        .insert("full_min_votes".to_string(), toml::Value::Integer(25));

    write_toml_config(&config, &path).unwrap();
    let loaded = load_toml_config(Some(&path)).unwrap();

    assert_eq!(loaded.root_folder, Some(PathBuf::from("/srv/marquee")));
    assert_eq!(loaded.catalog.base_url.as_deref(), Some("https://catalog.example"));
    assert_eq!(loaded.catalog.requests_per_second, 10);
    assert_eq!(loaded.admission.get("full_min_votes"), Some(&toml::Value::Integer(25)));
}

#[test]
fn test_initializer_creates_directory() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("a").join("b");

    let init = RootFolderInitializer::new(root.clone());
    init.ensure_directory_exists().unwrap();

    assert!(root.is_dir());
    assert_eq!(init.database_path(), root.join("marquee.db"));
}
