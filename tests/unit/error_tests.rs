//! Unit tests for `AppError` display and conversions.

use worker_dispatch::AppError;

#[test]
fn display_prefixes_identify_the_failure_class() {
    let cases = [
        (AppError::Config("x".into()), "config: x"),
        (AppError::Rpc("x".into()), "rpc: x"),
        (AppError::Spawn("x".into()), "spawn: x"),
        (AppError::Timeout("x".into()), "timeout: x"),
        (AppError::WorkerExited("x".into()), "worker exited: x"),
        (AppError::Directory("x".into()), "directory: x"),
        (AppError::NotFound("x".into()), "not found: x"),
        (AppError::Unauthorized("x".into()), "unauthorized: x"),
        (AppError::Io("x".into()), "io: x"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn only_timeouts_report_is_timeout() {
    assert!(AppError::Timeout("slow".into()).is_timeout());
    assert!(!AppError::WorkerExited("gone".into()).is_timeout());
}

#[test]
fn toml_errors_become_config_errors() {
    let err: AppError = toml::from_str::<toml::Value>("= broken").unwrap_err().into();
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn io_errors_convert() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
    assert!(matches!(err, AppError::Io(ref msg) if msg.contains("pipe")));
}
