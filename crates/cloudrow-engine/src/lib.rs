//! cloudrow reconciliation engine
//!
//! Keeps a declared-state store and a cloud provider in agreement. Each
//! resource kind is described by a [`Mapper`]: an entity type, a backend for
//! each reality, an identity codec and the rules for what counts as a
//! difference and how to resolve it. Mappers are grouped into [`Module`]s,
//! and the [`Engine`] drives every module to a fixpoint in dependency order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  cloudrow CLI                    │
//! │           (reconcile / plan / modules)           │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                cloudrow-engine                   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  Engine: leases, module order, passes    │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐            │
//! │  │ diff / apply │  │ Context+cache│            │
//! │  └──────────────┘  └──────────────┘            │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │  db backend   │ │ cloud backend │
//! │ (table store) │ │  (provider)   │
//! └───────────────┘ └───────────────┘
//! ```

pub mod action;
pub mod backend;
pub mod cache;
pub mod context;
pub mod diff;
pub mod engine;
pub mod entity;
pub mod error;
pub mod identity;
pub mod lease;
pub mod mapper;
pub mod module;
pub mod reconcile;
pub mod report;
pub mod retry;

// Re-exports
pub use action::{Action, ActionType, Plan, PlanSummary};
pub use backend::Backend;
pub use cache::{CacheStats, MemoCache};
pub use context::{Context, ContextBuilder, Credentials, Provider, Scope};
pub use diff::{Diff, DiffCounts, find_diff};
pub use engine::{Engine, EngineConfig, Mode, RunRequest};
pub use entity::{Entity, Reality, Relation, RowId};
pub use error::{EngineError, ErrorClass, Result, TransientKind};
pub use identity::{IdFields, IdentityCodec, fields_from};
pub use lease::{AccountLease, LeaseManager, LeasePolicy};
pub use mapper::{Mapper, OrphanPolicy, UpdateOrReplace};
pub use module::{Module, Registry, RegisteredModule};
pub use reconcile::{AnyMapper, PassEnv, PassOutcome, Phase, erase};
pub use report::{ChangeCounts, MapperFailure, MapperReport, ModuleReport, RunReport};
pub use retry::{Backoff, RetryPolicy, WaitConfig, WaitOutcome, retry, wait_until};
