use std::io::Write;

use casebook_core::config::AppConfig;
use casebook_core::CasebookError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[api]
url = "https://cases.example.com/api"
key = "ck_live_key"

[sandbox]
workdir = "/work"
memory_mb = 256
timeout_secs = 120
network = "casebook-sandbox"
log_grace_ms = 1000

[bus]
capacity = 1024

[database]
path = "/var/lib/casebook/casebook.db"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.api.url, "https://cases.example.com/api");
    assert_eq!(config.api.key, "ck_live_key");
    assert_eq!(config.sandbox.workdir, "/work");
    assert_eq!(config.sandbox.memory_mb, 256);
    assert_eq!(config.sandbox.timeout_secs, 120);
    assert_eq!(config.sandbox.network.as_deref(), Some("casebook-sandbox"));
    assert_eq!(config.sandbox.log_grace_ms, 1000);
    assert_eq!(config.bus.capacity, 1024);
    assert_eq!(
        config.database_path(),
        std::path::PathBuf::from("/var/lib/casebook/casebook.db")
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("CASEBOOK_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[api]
key = "${CASEBOOK_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.api.key, "expanded-key-value");

    std::env::remove_var("CASEBOOK_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[api]
key = "k"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.api.url, "http://localhost:8000/api");
    assert_eq!(config.sandbox.workdir, "/home");
    assert_eq!(config.sandbox.memory_mb, 512);
    assert_eq!(config.sandbox.timeout_secs, 600);
    assert!(config.sandbox.network.is_none());
    assert_eq!(config.bus.capacity, 256);
    assert_eq!(config.database.path, "~/.casebook/casebook.db");
}

#[test]
fn test_missing_config_file() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/casebook.toml")).unwrap_err();
    assert!(matches!(err, CasebookError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_toml_is_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[sandbox]\ntimeout_secs = \"soon\"\n")
        .expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, CasebookError::Config(_)));
}
