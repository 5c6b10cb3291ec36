//! Shared fixtures for the Postern integration tests

pub mod fixtures;
