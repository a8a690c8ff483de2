//! Tests for logging configuration and format parsing

use safewatch::observability::logging::{parse_level, LogFormat};
use safewatch::observability::init_logging;
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    assert_eq!(LogFormat::parse("invalid"), LogFormat::Json);
    assert_eq!(LogFormat::parse(""), LogFormat::Json);
    assert_eq!(LogFormat::parse("yaml"), LogFormat::Json);
}

#[test]
fn test_parse_level() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level("WARN"), Level::WARN);
    assert_eq!(parse_level("debug"), Level::DEBUG);
    assert_eq!(parse_level("trace"), Level::TRACE);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_second_global_subscriber_is_refused() {
    // the first call may lose to another test in this binary; either way the
    // second one must fail instead of panicking
    let _ = init_logging(Level::INFO, LogFormat::Compact, false);
    assert!(init_logging(Level::DEBUG, LogFormat::Json, true).is_err());

    // events and spans still work through the installed subscriber
    let span = safewatch::mqtt_span!(client_id = "logging-test", operation = "connect");
    let _entered = span.enter();
    tracing::info!("logging initialised");
}
