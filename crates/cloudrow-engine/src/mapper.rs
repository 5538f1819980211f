//! Resource mapper contract

use crate::backend::Backend;
use crate::entity::{Entity, Relation};
use crate::error::Result;
use crate::identity::IdentityCodec;

/// How a changed entity reaches its declared shape in the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrReplace {
    /// Mutate the existing resource in place
    Update,
    /// Create a new resource variant, then delete the old one
    Replace,
}

/// What to do with a resource observed in the provider but not declared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Import it into the declared state
    Import,
    /// Delete it from the provider; the declared state owns this kind
    Prune,
}

/// Binds one entity type to its two backends and its diff policy.
pub trait Mapper: Send + Sync + 'static {
    type Entity: Entity;

    fn codec(&self) -> &IdentityCodec;

    fn kind(&self) -> &'static str {
        self.codec().kind()
    }

    /// The declared-state store
    fn db(&self) -> &dyn Backend<Self::Entity>;

    /// The provider
    fn cloud(&self) -> &dyn Backend<Self::Entity>;

    /// Structural equality over the fields a caller can declare.
    ///
    /// Must be reflexive and must ignore provider-generated fields, or the
    /// first pass after a create never converges.
    fn equals(&self, a: &Self::Entity, b: &Self::Entity) -> bool;

    fn update_or_replace(&self, _prev: &Self::Entity, _next: &Self::Entity) -> UpdateOrReplace {
        UpdateOrReplace::Update
    }

    fn orphan_policy(&self) -> OrphanPolicy {
        OrphanPolicy::Import
    }

    /// Entities that must never be deleted or replaced in the provider,
    /// such as an account's implicit default resource. The engine restores
    /// the declared row from the observed state instead.
    fn is_protected(&self, _entity: &Self::Entity) -> bool {
        false
    }

    /// Kinds this mapper references. A mapper is not diffed in a pass where
    /// one of these still had differences.
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }

    fn relations(&self, _entity: &Self::Entity) -> Vec<Relation> {
        Vec::new()
    }

    /// Point `from` at `to_id` instead. Returns whether anything changed.
    fn repoint(&self, _entity: &mut Self::Entity, _from: &Relation, _to_id: &str) -> bool {
        false
    }

    fn entity_id(&self, entity: &Self::Entity) -> Result<String> {
        self.codec().entity_id(entity)
    }
}
