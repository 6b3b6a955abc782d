use abc_core::errors::{AbcError, ErrorInfo};

fn sample_info(code: &str, message: &str) -> ErrorInfo {
    ErrorInfo::new(code, message)
        .with_context("t", 3)
        .with_context("reason", "example")
}

#[test]
fn config_error_surface() {
    let err = AbcError::Config(sample_info("model-prior-mismatch", "counts differ"));
    assert_eq!(err.info().code, "model-prior-mismatch");
    assert_eq!(err.info().context.get("t").map(String::as_str), Some("3"));
    assert!(!err.is_lookup());
}

#[test]
fn lookup_error_is_distinguishable() {
    let err = AbcError::missing_generation("epsilon", 7);
    assert!(err.is_lookup());
    assert_eq!(err.info().code, "missing-generation");
    assert_eq!(err.info().context.get("t").map(String::as_str), Some("7"));
}

#[test]
fn display_includes_context_and_hint() {
    let err = AbcError::Storage(
        ErrorInfo::new("population-write", "disk full")
            .with_context("path", "/tmp/run")
            .with_hint("free some space"),
    );
    let rendered = err.to_string();
    assert!(rendered.starts_with("storage error: disk full (code: population-write)"));
    assert!(rendered.contains("path=/tmp/run"));
    assert!(rendered.contains("hint: free some space"));
}

#[test]
fn errors_round_trip_through_json() {
    let err = AbcError::Sampler(sample_info("max-evaluations", "budget exhausted"));
    let json = serde_json::to_string(&err).unwrap();
    assert!(json.contains("\"family\":\"Sampler\""));
    let decoded: AbcError = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, err);
}
