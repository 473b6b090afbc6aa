// ABOUTME: Tests for ToolOutput - constructors, metadata, defaults.
// ABOUTME: Verifies the backend output structure works correctly.

use super::*;

#[test]
fn test_text_output() {
    let output = ToolOutput::text("Hello, world!");
    assert_eq!(output.output, "Hello, world!");
    assert!(output.success());
    assert!(output.error.is_none());
    assert!(output.metadata.is_empty());
}

#[test]
fn test_error_output() {
    let output = ToolOutput::error("Something went wrong");
    assert!(!output.success());
    assert_eq!(output.error.as_deref(), Some("Something went wrong"));
    assert!(output.output.is_null());
}

#[test]
fn test_value_output() {
    let output = ToolOutput::value(serde_json::json!({"lines": 42}));
    assert_eq!(output.output["lines"], 42);
    assert!(output.success());
}

#[test]
fn test_with_metadata() {
    let output = ToolOutput::text("output")
        .with_metadata("bytes_read", 1024)
        .with_metadata("cached", true);

    assert_eq!(output.metadata["bytes_read"], 1024);
    assert_eq!(output.metadata["cached"], true);
}

#[test]
fn test_default() {
    let output = ToolOutput::default();
    assert!(output.output.is_null());
    assert!(output.success());
}
