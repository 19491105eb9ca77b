//! Loading configuration and definition files from disk

mod common;

use common::builders::{definitions, RecordBuilder};
use common::TestEngine;
use serial_test::serial;
use std::io::Write;
use telemon::config::{self, EngineConfig};

#[test]
fn test_definitions_file_named_by_config() {
    let dir = tempfile::tempdir().unwrap();
    let defs = dir.path().join("points.txt");
    std::fs::write(
        &defs,
        definitions([
            RecordBuilder::new("temp").alias("t").units("C").build(),
            RecordBuilder::new("broken").stage(r#"NoSuchStage-"1""#).build(),
        ]),
    )
    .unwrap();

    let cfg_path = dir.path().join("telemon.toml");
    let mut config = EngineConfig::default();
    config.buffer.max_count = 5;
    config.points.definitions = Some(defs.clone());
    config.save(&cfg_path).unwrap();

    let loaded = EngineConfig::load(&cfg_path).unwrap();
    assert_eq!(loaded.points.definitions.as_deref(), Some(defs.as_path()));

    let t = TestEngine::with_config(loaded.clone());
    let report = t.engine.load_file(loaded.points.definitions.unwrap()).unwrap();
    assert_eq!(report.loaded, vec!["site.temp"]);
    assert_eq!(report.errors.len(), 1);
    assert!(t.engine.point("site.t").is_some());
    assert_eq!(t.engine.config().buffer.max_count, 5);
}

#[test]
fn test_missing_definitions_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let t = TestEngine::new();
    assert!(t.engine.load_file(dir.path().join("absent.txt")).is_err());
}

#[test]
fn test_json_config_overrides_scheduler() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(
        file,
        r#"{{"scheduler": {{"resolution_interval_ms": 250}}, "logging": {{"filter": "warn"}}}}"#
    )
    .unwrap();

    let config = EngineConfig::load(file.path()).unwrap();
    assert_eq!(config.scheduler.resolution_interval_ms, 250);
    assert_eq!(config.logging.filter, "warn");
    assert_eq!(config.archive, EngineConfig::default().archive);
}

#[test]
#[serial]
fn test_app_data_dir_follows_xdg() {
    if !cfg!(target_os = "linux") {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let previous = std::env::var_os("XDG_DATA_HOME");
    std::env::set_var("XDG_DATA_HOME", dir.path());

    let data_dir = config::ensure_app_data_dir().unwrap();
    assert!(data_dir.starts_with(dir.path()));
    assert!(data_dir.is_dir());
    assert_eq!(
        config::default_config_path().unwrap(),
        data_dir.join(config::CONFIG_FILE)
    );

    match previous {
        Some(v) => std::env::set_var("XDG_DATA_HOME", v),
        None => std::env::remove_var("XDG_DATA_HOME"),
    }
}
