//! Entities, relations and realities

use crate::identity::IdFields;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Row identifier in the declared-state store
pub type RowId = u64;

/// One instance of a resource kind.
///
/// Entities are transient values: they are materialized fresh on every read
/// from either reality and carry no identity beyond one pass.
pub trait Entity: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Values of the kind's declared identity fields.
    ///
    /// Returns `None` while any of them is still unassigned, e.g. a
    /// provider-generated ID on a row that has not been created yet.
    fn identity(&self) -> Option<IdFields>;

    /// Declared-state row this entity was read from, if any
    fn row_id(&self) -> Option<RowId>;

    fn set_row_id(&mut self, row: Option<RowId>);
}

/// A reference from one entity to another, by identity.
///
/// Never a row pointer: the referenced resource may have a different row in
/// the declared state, or no row at all yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relation {
    pub kind: String,
    pub id: String,
}

impl Relation {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn points_to(&self, kind: &str, id: &str) -> bool {
        self.kind == kind && self.id == id
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// The two sides a mapper reconciles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reality {
    /// The declared-state store
    Db,
    /// The cloud provider
    Cloud,
}

impl std::fmt::Display for Reality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reality::Db => write!(f, "db"),
            Reality::Cloud => write!(f, "cloud"),
        }
    }
}
