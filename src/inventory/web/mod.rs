//! Inventory Web Module
//!
//! REST surface over the collector container.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
