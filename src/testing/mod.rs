//! Testing utilities and mock implementations
//!
//! Provides an in-process mock broker and session factory so client behavior
//! can be tested end to end without a real MQTT broker.

pub mod mocks;

pub use mocks::*;
