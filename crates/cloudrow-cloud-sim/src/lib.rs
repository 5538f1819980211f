//! Simulated cloud provider for cloudrow
//!
//! A multi-region, in-process provider together with the declared-state
//! table store and two sample modules that reconcile against it:
//!
//! - `networking`: networks, subnets and firewall rules
//! - `compute`: load balancers, instances and load-balancer registrations
//!
//! # Example
//!
//! ```ignore
//! use cloudrow_cloud_sim::{SimCloud, TableStore, registry};
//! use cloudrow_engine::{Engine, EngineConfig, RunRequest, WaitConfig};
//! use std::sync::Arc;
//!
//! let sim = SimCloud::with_regions(["us-east-1"]);
//! let store = Arc::new(TableStore::in_memory());
//! let engine = Engine::new(registry(&sim, &store, WaitConfig::default())?, EngineConfig::default());
//! let report = engine.run(ctx, &RunRequest::new("acme")).await?;
//! ```

pub mod cloud;
pub mod compute;
pub mod error;
mod lookup;
pub mod networking;
pub mod store;

pub use cloud::{DEFAULT_RULE, InstanceState, SimCloud, SimSession};
pub use compute::{Compute, Instance, LoadBalancer, Registration};
pub use error::{Result, SimError};
pub use networking::{FirewallRule, Network, Networking, Subnet};
pub use store::{Regional, StoreLock, TableBackend, TableStore, Tables};

use cloudrow_engine::{Module, Registry, WaitConfig};
use std::sync::Arc;

/// Every module this crate provides, in registration order
pub fn modules(sim: &SimCloud, store: &Arc<TableStore>, wait: WaitConfig) -> Vec<Box<dyn Module>> {
    vec![
        Box::new(Networking::new(sim.clone(), store.clone())),
        Box::new(Compute::new(sim.clone(), store.clone()).with_wait(wait)),
    ]
}

/// Registry over [`modules`]
pub fn registry(
    sim: &SimCloud,
    store: &Arc<TableStore>,
    wait: WaitConfig,
) -> cloudrow_engine::Result<Registry> {
    Registry::new(modules(sim, store, wait))
}
