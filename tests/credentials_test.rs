use make_best::credentials::load_api_key;
use make_best::PipelineError;
use std::fs;
use tempfile::TempDir;

#[test]
fn key_is_read_from_env_file() {
    let temp_dir = TempDir::new().unwrap();
    let env_path = temp_dir.path().join("api_key.env");
    fs::write(&env_path, "# local secrets\nOTHER=1\napi_key=\"abc123\"\n").unwrap();

    assert_eq!(load_api_key(Some(&env_path), "api_key").unwrap(), "abc123");
}

#[test]
fn blank_value_counts_as_missing() {
    let temp_dir = TempDir::new().unwrap();
    let env_path = temp_dir.path().join("api_key.env");
    fs::write(&env_path, "MAKE_BEST_BLANK_TEST_KEY=\n").unwrap();

    let err = load_api_key(Some(&env_path), "MAKE_BEST_BLANK_TEST_KEY").unwrap_err();
    assert!(matches!(err, PipelineError::CredentialMissing { .. }));
    assert!(err.to_string().contains("MAKE_BEST_BLANK_TEST_KEY"));
}
