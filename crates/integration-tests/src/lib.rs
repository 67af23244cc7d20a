//! End-to-end tests for the conduit runtime against an in-process mock upstream
//!
//! All tests live under `tests/`.
