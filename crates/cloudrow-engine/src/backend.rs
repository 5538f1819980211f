//! Backend trait: CRUD against one reality

use crate::context::Context;
use crate::entity::Entity;
use crate::error::Result;
use async_trait::async_trait;

/// Create, read, update and delete entities of one kind in one reality.
///
/// Implementations against the provider may take several round trips per
/// call (issue an asynchronous operation, then poll with
/// [`wait_until`](crate::retry::wait_until)). A resource that disappeared
/// between enumeration and the call should be reported as
/// [`EngineError::NotFound`](crate::EngineError::NotFound).
#[async_trait]
pub trait Backend<E: Entity>: Send + Sync {
    /// Create entities, returning them with any generated fields filled in.
    ///
    /// Return as soon as the provider has accepted the request and assigned
    /// an identity. Waiting for the resource to become usable belongs in
    /// [`settle`](Backend::settle).
    async fn create(&self, ctx: &Context, entities: Vec<E>) -> Result<Vec<E>>;

    /// Wait for a freshly created entity to become usable.
    ///
    /// Runs after the created entity has been written to the declared state,
    /// so a failure here leaves the identity recorded and the next pass
    /// picks the resource up instead of creating it again.
    async fn settle(&self, _ctx: &Context, entity: E) -> Result<E> {
        Ok(entity)
    }

    /// Read one entity by identity, or the whole inventory when `id` is `None`.
    /// A missing identity yields an empty vector.
    async fn read(&self, ctx: &Context, id: Option<&str>) -> Result<Vec<E>>;

    /// Update entities in place, returning the stored values
    async fn update(&self, ctx: &Context, entities: Vec<E>) -> Result<Vec<E>>;

    async fn delete(&self, ctx: &Context, entities: Vec<E>) -> Result<()>;
}
