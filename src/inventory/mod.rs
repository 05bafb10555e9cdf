//! Inventory mirror
//!
//! A per-provider, eventually consistent local model of source platform
//! objects: the object model, the embedded store, the vSphere collector,
//! the collector container and the REST surface over it.

pub mod container;
pub mod model;
pub mod store;
pub mod vsphere;
pub mod web;

pub use container::{Container, Ensured, Reconciler, ReconcilerBuilder, ReconcilerStats};
pub use store::{ListOptions, Page, Store};
