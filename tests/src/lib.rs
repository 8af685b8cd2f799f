//! Integration tests for `segmount` live under `tests/`.
