use codecache_core::units::M;
use codecache_core::{initialize_heaps, CodeCacheConfig, CodeCacheError, CodeHeapKind};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_load_file_then_environment() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("codecache.toml");
    fs::write(
        &path,
        "reserved_size = 67108864\nprofiled_size = 16777216\nsweep_activity = 2\n",
    )
    .unwrap();

    let config = CodeCacheConfig::load(Some(&path)).unwrap();
    assert_eq!(config.reserved_size, Some(64 * M));
    assert_eq!(config.profiled_size, Some(16 * M));
    assert_eq!(config.sweep_activity, 2);
    assert!(config.segmented);

    // Environment wins over the file. Only this test touches the process environment.
    std::env::set_var("CODECACHE__SWEEP_ACTIVITY", "8");
    let config = CodeCacheConfig::load(Some(&path)).unwrap();
    std::env::remove_var("CODECACHE__SWEEP_ACTIVITY");
    assert_eq!(config.sweep_activity, 8);

    let layout = initialize_heaps(&config).unwrap();
    assert_eq!(layout.size_of(CodeHeapKind::MethodProfiled), Some(16 * M));
    assert_eq!(layout.size_of(CodeHeapKind::MethodNonProfiled), Some(46 * M));
}

#[test]
fn test_invalid_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "segment_size = 100\n").unwrap();

    let err = CodeCacheConfig::load(Some(&path)).unwrap_err();
    assert!(matches!(err, CodeCacheError::InvalidConfig(_)));
    assert!(err.is_fatal());
}

#[test]
fn test_missing_file_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let err = CodeCacheConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
    assert!(matches!(err, CodeCacheError::Config(_)));
}

#[test]
fn test_config_serializes_to_json() {
    let json = CodeCacheConfig::default().to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["segment_size"], 128);
    assert_eq!(value["flushing"], true);
}
