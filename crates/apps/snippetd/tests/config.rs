use snippet_daemon::config::{generate_secret, DaemonConfig, DEFAULT_LISTEN};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn parses_full_config() {
    let input = r#"
listen = "0.0.0.0:9000"
secret = "abc"
capability_level = 30

[events]
capacity = 16
default_timeout_ms = 250
"#;
    let config = DaemonConfig::from_toml(input).expect("parse config");
    assert_eq!(config.listen_addr(), "0.0.0.0:9000");
    assert_eq!(config.capability_level, Some(30));
    assert_eq!(config.handshake_secret().as_deref(), Some("abc"));
    let cache = config.event_cache();
    assert_eq!(cache.capacity(), 16);
    assert_eq!(cache.default_timeout(), Duration::from_millis(250));
}

#[test]
fn empty_config_uses_defaults() {
    let config = DaemonConfig::from_toml("").expect("parse empty config");
    assert_eq!(config.listen_addr(), DEFAULT_LISTEN);
    assert!(config.handshake_secret().is_none());
    assert_eq!(config.event_cache().capacity(), 1024);
    assert_eq!(config.event_cache().default_timeout(), Duration::from_secs(60));
}

#[test]
fn required_handshake_without_secret_generates_one() {
    let config = DaemonConfig::from_toml("require_handshake = true").expect("parse config");
    let secret = config.handshake_secret().expect("generated secret");
    assert_eq!(secret.len(), 32);
    assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(generate_secret(), generate_secret());
}

#[test]
fn loads_config_from_path() {
    let mut file = NamedTempFile::new().expect("temp file");
    writeln!(file, "listen = \"127.0.0.1:4321\"").expect("write config");
    let config = DaemonConfig::from_path(file.path()).expect("load config");
    assert_eq!(config.listen_addr(), "127.0.0.1:4321");
}

#[test]
fn invalid_toml_is_invalid_data() {
    let mut file = NamedTempFile::new().expect("temp file");
    writeln!(file, "listen = [").expect("write config");
    let err = DaemonConfig::from_path(file.path()).expect_err("bad config");
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}
