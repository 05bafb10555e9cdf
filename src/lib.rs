//! Forklift Controller - VM migration into KubeVirt
//!
//! A Kubernetes controller plane that migrates virtual machines from
//! external virtualization platforms into KubeVirt.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Controllers                                 │
//! │   Provider (connection, collector)  Plan (readiness)  Migration      │
//! ├──────────────────────────────┬───────────────────────────────────────┤
//! │     Plan Execution Engine    │        Admission Webhooks             │
//! │  itinerary, pipeline,        │  Secret/Provider/Plan/Migration       │
//! │  scheduler, migrator         │  validators and mutators              │
//! ├──────────────────────────────┴───────────────────────────────────────┤
//! │                       Inventory Mirror                               │
//! │   vSphere collector ─▶ Store (revisioned, snapshots) ─▶ REST API     │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │   Source connectors (vSphere, oVirt, OpenStack, OpenShift)           │
//! │   Destination clients (local or remote cluster)                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`inventory`]: Inventory model, store, collectors and REST surface
//! - [`admission`]: Admission webhooks
//! - [`plan`]: Plan execution engine
//! - [`controller`]: kube-runtime controllers
//! - [`crd`]: Custom Resource Definitions
//! - [`connector`]: Source platform connection tests
//! - [`destination`]: Destination cluster clients
//! - [`domain`]: Ports between the engine and the outside world
//! - [`error`]: Error types and handling

pub mod admission;
pub mod connector;
pub mod controller;
pub mod crd;
pub mod destination;
pub mod domain;
pub mod error;
pub mod inventory;
pub mod metrics;
pub mod plan;
pub mod retry;
pub mod settings;

// Re-export commonly used types
pub use crd::{
    Category, Condition, Conditions, Migration, MigrationSpec, MigrationStatus, NetworkMap, ObjectRef,
    Plan, PlanSpec, PlanStatus, Provider, ProviderSpec, ProviderStatus, ProviderType, StorageMap,
};

pub use domain::ports::{
    AccessReviewer, ClusterLookup, Connector, ConnectorFactory, DestinationClient, DestinationFactory,
    SourceControl, SourceControlFactory,
};

pub use error::{Error, ErrorAction, Result};

pub use inventory::{Container, ListOptions, Store};

pub use plan::{Engine, EngineConfig};

pub use settings::Settings;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
