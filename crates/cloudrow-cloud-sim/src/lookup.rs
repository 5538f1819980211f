//! Region fan-out and relation lookups shared by the provider backends

use crate::cloud::{SimCloud, SimSession};
use cloudrow_engine::{Backend, Context, EngineError, Entity, IdentityCodec, Reality, Relation, Result};
use std::future::Future;
use std::sync::Arc;

/// Run `describe` in every region `id` could live in and keep what matches.
///
/// With an identity that is the identity's own region (nothing when the
/// region is not enabled); without one, every enabled region concurrently.
pub(crate) async fn scan<E, F, Fut>(
    ctx: &Context,
    sim: &SimCloud,
    codec: &IdentityCodec,
    id: Option<&str>,
    describe: F,
) -> Result<Vec<E>>
where
    E: Entity,
    F: Fn(Arc<SimSession>) -> Fut,
    Fut: Future<Output = Result<Vec<E>>>,
{
    let describe = &describe;
    let Some(id) = id else {
        return ctx
            .fan_out(|scope| async move { describe(ctx.session(sim, &scope.name).await?).await })
            .await;
    };

    let fields = codec.id_fields(id)?;
    let region = fields
        .get("region")
        .ok_or_else(|| EngineError::invalid_identity(codec.kind(), "identity has no region"))?;
    if !ctx.is_enabled(region) {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entity in describe(ctx.session(sim, region).await?).await? {
        if codec.entity_id(&entity)? == id {
            found.push(entity);
        }
    }
    Ok(found)
}

/// The observed entity `relation` points at, read through the run cache.
pub(crate) async fn resolve<E: Entity>(
    ctx: &Context,
    backend: &dyn Backend<E>,
    codec: &IdentityCodec,
    relation: &Relation,
) -> Result<E> {
    let missing = || EngineError::missing_relation(codec.kind(), relation.id.clone());
    if IdentityCodec::is_pending(&relation.id) {
        return Err(missing());
    }

    ctx.read_through(Reality::Cloud, codec.kind(), &relation.id, || async {
        backend
            .read(ctx, Some(&relation.id))
            .await
            .map(|found| found.into_iter().next())
    })
    .await?
    .ok_or_else(missing)
}

/// A provider-generated field the declared entity must already carry
pub(crate) fn assigned<'a>(codec: &IdentityCodec, field: &str, value: &'a Option<String>) -> Result<&'a str> {
    value.as_deref().ok_or_else(|| {
        EngineError::Validation(format!("{} has no {} assigned yet", codec.kind(), field))
    })
}
