//! End-to-end smoke tests for the transit gateway live in `tests/`.
