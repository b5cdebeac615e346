use agentphone::config::Config;
use agentphone::error::ConfigError;
use std::io::Write;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_full_config() {
    let file = write_config(
        r#"
log_level = "debug"
log_file = "/tmp/agentphone.log"

[agent]
extension = "1001"
credential = "secret"
signaling_domain = "pbx.example.com"
transport_endpoint = "udp://pbx.example.com:5060"

[sip]
addr = "127.0.0.1"
udp_port = 25070
register_expires = 120

[ice]
stun = "stun:stun.example.com:3478"

[registration]
retry_initial_secs = 1
retry_max_secs = 30

[backend]
url = "https://backend.example.com"
token = "abc"

[lock]
poll_interval_secs = 10
"#,
    );
    let config = Config::load(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.sip.register_expires, 120);
    assert_eq!(config.sip.local_addr().unwrap().port(), 25070);
    assert_eq!(config.registration.retry_max_secs, 30);
    assert_eq!(config.lock.poll_interval_secs, 10);
    assert_eq!(config.backend.as_ref().unwrap().token.as_deref(), Some("abc"));

    let identity = config.validate_agent_fields().unwrap();
    assert_eq!(identity.aor(), "1001@pbx.example.com");
    assert_eq!(identity.server_uri(), "sip:pbx.example.com:5060;transport=udp");
    assert_eq!(identity.target_uri("5551234"), "sip:5551234@pbx.example.com");
}

#[test]
fn test_missing_identity_field_is_named() {
    let file = write_config(
        r#"
[agent]
extension = "1001"
signaling_domain = "pbx.example.com"
transport_endpoint = "pbx.example.com:5060"
"#,
    );
    let config = Config::load(file.path().to_str().unwrap()).unwrap();
    assert_eq!(
        config.validate_agent_fields(),
        Err(ConfigError::MissingField("credential"))
    );
}

#[test]
fn test_load_errors() {
    assert!(Config::load("/nonexistent/agentphone.toml").is_err());
    let file = write_config("[sip\nudp_port = ");
    assert!(Config::load(file.path().to_str().unwrap()).is_err());
}
