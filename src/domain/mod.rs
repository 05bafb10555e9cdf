//! Domain layer - port definitions
//!
//! Traits that adapters implement so the inventory, admission and plan
//! engine can be driven against fakes in tests.

pub mod ports;

pub use ports::*;
