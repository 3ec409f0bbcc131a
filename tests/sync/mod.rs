// Test module entry point for sync tests

mod common;
mod container_tests;
mod engine_tests;
mod socket_tests;
