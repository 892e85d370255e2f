use std::fs;
use std::io::ErrorKind;
use std::time::Duration;

use remora_rpc::RpcConfig;
use tempfile::NamedTempFile;

#[test]
fn empty_input_yields_the_defaults() {
    let cfg = RpcConfig::from_toml("").expect("parse");
    assert_eq!(cfg.server.listen, "127.0.0.1:5561");
    assert_eq!(cfg.server.session_timeout_secs, 300);
    assert_eq!(cfg.client.receive_timeout_ms, 30_000);
    assert!(!cfg.client.retry_handshake);
    assert_eq!(cfg.wire.id_ceiling, 125);

    let client = cfg.client_options();
    assert_eq!(client.operation_timeout, Duration::from_secs(10));
    assert_eq!(client.stream_timeout, Duration::from_secs(20));
    assert_eq!(client.handshake_attempts, 3);
}

#[test]
fn sections_override_only_what_they_name() {
    let input = r#"
[server]
listen = "0.0.0.0:7000"
session_timeout_secs = 5

[client]
retry_handshake = true
retry_delay_ms = 50

[wire]
id_ceiling = 16
"#;
    let cfg = RpcConfig::from_toml(input).expect("parse");
    let server = cfg.server_options();
    assert_eq!(cfg.server.listen, "0.0.0.0:7000");
    assert_eq!(server.session_timeout, Duration::from_secs(5));
    assert_eq!(server.sweep_interval, Duration::from_secs(30));
    assert_eq!(server.id_ceiling, 16);

    let client = cfg.client_options();
    assert!(client.retry_handshake);
    assert_eq!(client.retry_delay, Duration::from_millis(50));
    assert_eq!(client.receive_timeout, Duration::from_secs(30));
}

#[test]
fn loads_config_from_file() {
    let file = NamedTempFile::new().expect("temp file");
    fs::write(file.path(), "[client]\nreceive_timeout_ms = 1500\n").expect("write");

    let cfg = RpcConfig::from_path(file.path()).expect("load");
    assert_eq!(cfg.client_options().receive_timeout, Duration::from_millis(1500));
}

#[test]
fn malformed_files_are_invalid_data() {
    let file = NamedTempFile::new().expect("temp file");
    fs::write(file.path(), "[server\nlisten = 1").expect("write");

    let err = RpcConfig::from_path(file.path()).expect_err("malformed");
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}
