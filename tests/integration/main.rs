//! Integration tests for the session lifecycle manager.


mod lifecycle_test;
