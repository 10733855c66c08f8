use rayos_ischain::SchedulerConfig;
use std::io::Write;

#[test]
fn test_load_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "queue_depth = 12").unwrap();
    writeln!(file, "fast_readout = true").unwrap();
    writeln!(file, "internal_log_every = 0").unwrap();

    let config = SchedulerConfig::load(file.path()).unwrap();
    assert_eq!(config.queue_depth, 12);
    assert!(config.fast_readout);
    assert_eq!(config.internal_log_every, 0);
    assert_eq!(config.configured_flush_limit, 5);
    assert!(config.log_internal(20));
    assert!(!config.log_internal(100));
}

#[test]
fn test_load_rejects_bad_types() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "queue_depth = \"deep\"").unwrap();
    assert!(SchedulerConfig::load(file.path()).is_err());
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(SchedulerConfig::load(&dir.path().join("absent.toml")).is_err());
}
