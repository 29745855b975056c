//! Dummy test whose only purpose is forcing `cargo test` to build the
//! mock-detector binary for the orchestrator's integration tests.

#[test]
fn binary_builds() {}
