//! One mapper's pass of the diff-and-apply loop
//!
//! A pass loads both realities, partitions them by identity and turns every
//! difference into one operation. Operations for distinct identities run
//! concurrently; each operation is a strictly sequential chain of backend
//! calls. Errors are classified per operation: vanished entities are
//! ignored, transient failures are left for the next pass, policy refusals
//! become restores and anything else stops the mapper's pass.

use crate::action::{Action, ActionType};
use crate::context::Context;
use crate::diff::{Changed, Diff, DiffCounts, Keyed, find_diff};
use crate::engine::Mode;
use crate::entity::{Entity, Reality, Relation, RowId};
use crate::error::{EngineError, ErrorClass, Result};
use crate::identity::IdentityCodec;
use crate::mapper::{Mapper, OrphanPolicy, UpdateOrReplace};
use crate::report::{ChangeCounts, MapperFailure};
use crate::retry::{RetryPolicy, retry};
use async_trait::async_trait;
use futures_util::future::try_join;
use futures_util::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Which operations a pass applies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    /// Everything except removing undeclared resources from the provider
    #[default]
    Converge,
    /// Only removals of undeclared resources. Runs after every module has
    /// converged, dependents before their dependencies.
    Teardown,
}

/// Everything a pass needs besides the context
pub struct PassEnv<'a> {
    pub mode: Mode,
    pub phase: Phase,
    /// Restrict the pass to one identity
    pub identity: Option<&'a str>,
    pub pass: u32,
    pub retry: &'a RetryPolicy,
    pub concurrency: usize,
    /// Every registered mapper, for relation migration on replace
    pub mappers: &'a [Arc<dyn AnyMapper>],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassOutcome {
    /// Differences found when the pass started
    pub diff: DiffCounts,
    pub counts: ChangeCounts,
    /// Operations that completed
    pub applied: usize,
    /// Operations left for the next pass
    pub pending: usize,
    /// Pending operations that would have brought an identity into existence
    pub unresolved: usize,
    /// Differences belonging to the other phase
    pub deferred: usize,
    pub failure: Option<MapperFailure>,
}

impl PassOutcome {
    /// Whether the pass found anything to do in its phase or left anything undone
    pub fn is_dirty(&self) -> bool {
        self.diff.total() > self.deferred || self.pending > 0
    }
}

/// Object-safe view of a [`Mapper`], so modules can list mappers of
/// different entity types side by side.
#[async_trait]
pub trait AnyMapper: Send + Sync {
    fn kind(&self) -> &'static str;

    fn depends_on(&self) -> &'static [&'static str];

    /// Operations the pass would apply, without applying them
    async fn plan(&self, ctx: &Context, env: &PassEnv<'_>) -> Result<Vec<Action>>;

    async fn pass(&self, ctx: &Context, env: &PassEnv<'_>) -> PassOutcome;

    /// Repoint declared relations from `from` to `to_id`. Returns the number
    /// of rows rewritten.
    async fn migrate_relation(&self, ctx: &Context, from: &Relation, to_id: &str) -> Result<usize>;
}

impl std::fmt::Debug for dyn AnyMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

pub fn erase<M: Mapper>(mapper: M) -> Arc<dyn AnyMapper> {
    Arc::new(Erased(mapper))
}

struct Erased<M>(M);

enum Op<E> {
    Create { id: String, declared: E },
    Import { id: String, observed: E },
    Prune { id: String, observed: E },
    Delete { id: String, observed: E },
    Update { id: String, declared: E, observed: E },
    Replace { id: String, declared: E, observed: E },
    Restore { id: String, declared: Option<E>, observed: E },
    Refresh { id: String, declared: E, observed: E },
    Forget { id: String, declared: E },
}

impl<E: Entity> Op<E> {
    fn action_type(&self) -> ActionType {
        match self {
            Op::Create { .. } => ActionType::Create,
            Op::Import { .. } => ActionType::Import,
            Op::Prune { .. } => ActionType::Prune,
            Op::Delete { .. } => ActionType::Delete,
            Op::Update { .. } => ActionType::Update,
            Op::Replace { .. } => ActionType::Replace,
            Op::Restore { .. } => ActionType::Restore,
            Op::Refresh { .. } => ActionType::Refresh,
            Op::Forget { .. } => ActionType::Forget,
        }
    }

    fn id(&self) -> &str {
        match self {
            Op::Create { id, .. }
            | Op::Import { id, .. }
            | Op::Prune { id, .. }
            | Op::Delete { id, .. }
            | Op::Update { id, .. }
            | Op::Replace { id, .. }
            | Op::Restore { id, .. }
            | Op::Refresh { id, .. }
            | Op::Forget { id, .. } => id,
        }
    }

    fn declared(&self) -> Option<&E> {
        match self {
            Op::Create { declared, .. }
            | Op::Update { declared, .. }
            | Op::Replace { declared, .. }
            | Op::Refresh { declared, .. }
            | Op::Forget { declared, .. } => Some(declared),
            Op::Restore { declared, .. } => declared.as_ref(),
            Op::Import { .. } | Op::Prune { .. } | Op::Delete { .. } => None,
        }
    }

    /// Removals of undeclared resources from the provider
    fn is_teardown(&self) -> bool {
        matches!(self, Op::Prune { .. } | Op::Delete { .. })
    }

    fn belongs_to(&self, phase: Phase) -> bool {
        self.is_teardown() == (phase == Phase::Teardown)
    }

    /// Operations that make an identity exist where it did not before
    fn creates_identity(&self) -> bool {
        matches!(
            self,
            Op::Create { .. } | Op::Import { .. } | Op::Replace { .. } | Op::Restore { .. }
        )
    }

    /// The restore-from-observed operation replacing a refused provider write
    fn into_restore(self) -> Option<Op<E>> {
        match self {
            Op::Prune { id, observed } | Op::Delete { id, observed } => Some(Op::Restore {
                id,
                declared: None,
                observed,
            }),
            Op::Update {
                id,
                declared,
                observed,
            }
            | Op::Replace {
                id,
                declared,
                observed,
            } => Some(Op::Restore {
                id,
                declared: Some(declared),
                observed,
            }),
            _ => None,
        }
    }
}

enum OpResult {
    Applied(ActionType),
    /// Created in the provider and recorded, but not usable yet
    Unsettled(ActionType),
    Vanished,
    Pending { creates_identity: bool },
    Skipped,
    Failed { id: String, error: EngineError },
}

fn single<E>(kind: &str, verb: &str, entities: Vec<E>) -> Result<E> {
    entities
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Provider(format!("{} {} returned no entity", verb, kind)))
}

impl<M: Mapper> Erased<M> {
    /// Invalidate the kind's cache, read both realities and partition them.
    async fn load(
        &self,
        ctx: &Context,
        identity: Option<&str>,
        policy: &RetryPolicy,
    ) -> Result<Diff<M::Entity>> {
        let m = &self.0;
        let kind = m.kind();
        ctx.cache().invalidate_kind(Reality::Db, kind);
        ctx.cache().invalidate_kind(Reality::Cloud, kind);

        let read_declared = format!("read declared {}", kind);
        let read_observed = format!("read observed {}", kind);
        let declared = retry(ctx, policy, &read_declared, || m.db().read(ctx, identity));
        let observed = async {
            // Pending identities exist only in the declared state
            if identity.is_some_and(IdentityCodec::is_pending) {
                return Ok(Vec::new());
            }
            retry(ctx, policy, &read_observed, || m.cloud().read(ctx, identity)).await
        };
        let (declared, observed) = try_join(declared, observed).await?;

        let declared = self.key(ctx, Reality::Db, declared)?;
        let observed = self.key(ctx, Reality::Cloud, observed)?;
        Ok(find_diff(declared, observed, |a, b| m.equals(a, b)))
    }

    fn key(
        &self,
        ctx: &Context,
        reality: Reality,
        entities: Vec<M::Entity>,
    ) -> Result<BTreeMap<String, M::Entity>> {
        let kind = self.0.kind();
        let mut keyed = BTreeMap::new();
        for entity in entities {
            let id = self.0.entity_id(&entity)?;
            ctx.cache().put(reality, kind, id.clone(), entity.clone());
            if keyed.insert(id.clone(), entity).is_some() {
                return Err(EngineError::invalid_identity(
                    kind,
                    format!("duplicate identity '{}' in {}", id, reality),
                ));
            }
        }
        Ok(keyed)
    }

    fn build_ops(&self, mode: Mode, diff: Diff<M::Entity>) -> Vec<Op<M::Entity>> {
        let m = &self.0;
        let mut ops = Vec::with_capacity(diff.counts().total());

        for Keyed { id, entity } in diff.db_only {
            ops.push(match mode {
                Mode::Sync => Op::Forget {
                    id,
                    declared: entity,
                },
                Mode::Reconcile | Mode::Apply => Op::Create {
                    id,
                    declared: entity,
                },
            });
        }

        for Keyed { id, entity } in diff.cloud_only {
            ops.push(match (mode, m.orphan_policy()) {
                (Mode::Sync, _) | (Mode::Reconcile, OrphanPolicy::Import) => Op::Import {
                    id,
                    observed: entity,
                },
                _ if m.is_protected(&entity) => Op::Restore {
                    id,
                    declared: None,
                    observed: entity,
                },
                (Mode::Apply, _) => Op::Delete {
                    id,
                    observed: entity,
                },
                (Mode::Reconcile, OrphanPolicy::Prune) => Op::Prune {
                    id,
                    observed: entity,
                },
            });
        }

        for Changed { id, db, cloud } in diff.changed {
            let op = if mode == Mode::Sync {
                Op::Refresh {
                    id,
                    declared: db,
                    observed: cloud,
                }
            } else {
                match m.update_or_replace(&cloud, &db) {
                    UpdateOrReplace::Update => Op::Update {
                        id,
                        declared: db,
                        observed: cloud,
                    },
                    UpdateOrReplace::Replace if m.is_protected(&cloud) => Op::Restore {
                        id,
                        declared: Some(db),
                        observed: cloud,
                    },
                    UpdateOrReplace::Replace => Op::Replace {
                        id,
                        declared: db,
                        observed: cloud,
                    },
                }
            };
            ops.push(op);
        }

        ops
    }

    /// Write `entity` to its declared row, creating the row if it has none.
    async fn persist(&self, ctx: &Context, policy: &RetryPolicy, entity: M::Entity) -> Result<()> {
        let m = &self.0;
        let what = format!("persist {}", m.kind());
        if entity.row_id().is_some() {
            retry(ctx, policy, &what, || m.db().update(ctx, vec![entity.clone()])).await?;
        } else {
            retry(ctx, policy, &what, || m.db().create(ctx, vec![entity.clone()])).await?;
        }
        Ok(())
    }

    /// Overwrite (or recreate) a declared row with the observed entity.
    async fn restore_row(
        &self,
        ctx: &Context,
        policy: &RetryPolicy,
        observed: &M::Entity,
        row: Option<RowId>,
    ) -> Result<()> {
        let mut entity = observed.clone();
        entity.set_row_id(row);
        self.persist(ctx, policy, entity).await
    }

    /// Repoint every declared relation to `old_id` at `new_id`.
    async fn migrate(&self, ctx: &Context, env: &PassEnv<'_>, old_id: &str, new_id: &str) -> Result<()> {
        if old_id == new_id {
            return Ok(());
        }
        let from = Relation::new(self.0.kind(), old_id);
        for other in env.mappers {
            let moved = other.migrate_relation(ctx, &from, new_id).await?;
            if moved > 0 {
                tracing::debug!(
                    "Repointed {} {} row(s) from {} to {}",
                    moved,
                    other.kind(),
                    from,
                    new_id
                );
            }
        }
        Ok(())
    }

    /// Create `declared` in the provider and record the generated identity
    /// on its row before anything else can fail, then repoint relations
    /// from the old identity.
    async fn accept(
        &self,
        ctx: &Context,
        env: &PassEnv<'_>,
        what: &str,
        old_id: &str,
        declared: &M::Entity,
    ) -> Result<M::Entity> {
        let m = &self.0;
        let policy = env.retry;
        let created = retry(ctx, policy, what, || m.cloud().create(ctx, vec![declared.clone()])).await?;
        let mut created = single(m.kind(), "create", created)?;
        created.set_row_id(declared.row_id());
        let new_id = m.entity_id(&created)?;
        self.persist(ctx, policy, created.clone()).await?;
        self.invalidate(ctx, &[old_id, &new_id]);
        self.migrate(ctx, env, old_id, &new_id).await?;
        Ok(created)
    }

    /// Wait for a created entity to become usable and record its final
    /// state. Returns `false` when it is still settling.
    async fn settle(&self, ctx: &Context, policy: &RetryPolicy, created: M::Entity) -> Result<bool> {
        let m = &self.0;
        let mut settled = match m.cloud().settle(ctx, created.clone()).await {
            Ok(settled) => settled,
            Err(err) if err.class() == ErrorClass::Transient => {
                tracing::warn!(
                    "{} '{}' was created but has not settled: {}",
                    m.kind(),
                    m.entity_id(&created)?,
                    err
                );
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        settled.set_row_id(created.row_id());
        if settled != created {
            let id = m.entity_id(&settled)?;
            self.persist(ctx, policy, settled).await?;
            self.invalidate(ctx, &[&id]);
        }
        Ok(true)
    }

    fn invalidate(&self, ctx: &Context, ids: &[&str]) {
        for id in ids {
            ctx.cache().invalidate(Reality::Db, self.0.kind(), id);
            ctx.cache().invalidate(Reality::Cloud, self.0.kind(), id);
        }
    }

    async fn execute(&self, ctx: &Context, env: &PassEnv<'_>, op: &Op<M::Entity>) -> Result<OpResult> {
        let m = &self.0;
        let kind = m.kind();
        let policy = env.retry;
        let what = format!("{} {} {}", op.action_type(), kind, op.id());
        tracing::debug!("Applying {} (pass {})", what, env.pass);

        match op {
            Op::Create { id, declared } => {
                let created = self.accept(ctx, env, &what, id, declared).await?;
                if !self.settle(ctx, policy, created).await? {
                    return Ok(OpResult::Unsettled(ActionType::Create));
                }
            }
            Op::Import { id, observed } => {
                let mut row = observed.clone();
                row.set_row_id(None);
                self.persist(ctx, policy, row).await?;
                self.invalidate(ctx, &[id]);
            }
            Op::Prune { id, observed } | Op::Delete { id, observed } => {
                retry(ctx, policy, &what, || m.cloud().delete(ctx, vec![observed.clone()])).await?;
                self.invalidate(ctx, &[id]);
            }
            Op::Update { id, declared, .. } => {
                let updated =
                    retry(ctx, policy, &what, || m.cloud().update(ctx, vec![declared.clone()])).await?;
                let mut updated = single(kind, "update", updated)?;
                updated.set_row_id(declared.row_id());
                if updated != *declared {
                    self.persist(ctx, policy, updated).await?;
                }
                self.invalidate(ctx, &[id]);
            }
            Op::Replace {
                id,
                declared,
                observed,
            } => {
                let created = self.accept(ctx, env, &what, id, declared).await?;

                let retire = format!("delete replaced {} {}", kind, id);
                match retry(ctx, policy, &retire, || m.cloud().delete(ctx, vec![observed.clone()])).await {
                    Ok(()) => {}
                    Err(err) if err.class() == ErrorClass::Vanished => {}
                    Err(err) => return Err(err),
                }
                self.invalidate(ctx, &[id]);
                if !self.settle(ctx, policy, created).await? {
                    return Ok(OpResult::Unsettled(ActionType::Replace));
                }
            }
            Op::Restore {
                id,
                declared,
                observed,
            } => {
                self.restore_row(ctx, policy, observed, declared.as_ref().and_then(Entity::row_id))
                    .await?;
                self.invalidate(ctx, &[id]);
            }
            Op::Refresh {
                id,
                declared,
                observed,
            } => {
                self.restore_row(ctx, policy, observed, declared.row_id()).await?;
                self.invalidate(ctx, &[id]);
            }
            Op::Forget { id, declared } => {
                retry(ctx, policy, &what, || m.db().delete(ctx, vec![declared.clone()])).await?;
                self.invalidate(ctx, &[id]);
            }
        }

        Ok(OpResult::Applied(op.action_type()))
    }

    async fn run_op(&self, ctx: &Context, env: &PassEnv<'_>, op: Op<M::Entity>) -> OpResult {
        let kind = self.0.kind();
        let err = match self.execute(ctx, env, &op).await {
            Ok(result) => return result,
            Err(err) => err,
        };

        if err.class() != ErrorClass::PolicyViolation {
            return self.classify(&op, err, env.pass);
        }
        let refused = op.action_type();
        let id = op.id().to_string();
        let Some(restore) = op.into_restore() else {
            return OpResult::Failed { id, error: err };
        };
        tracing::warn!(
            "{} of {} '{}' refused ({}), restoring declared state from the provider",
            refused,
            kind,
            restore.id(),
            err
        );
        match self.execute(ctx, env, &restore).await {
            Ok(result) => result,
            Err(err) => self.classify(&restore, err, env.pass),
        }
    }

    fn classify(&self, op: &Op<M::Entity>, err: EngineError, pass: u32) -> OpResult {
        let kind = self.0.kind();
        match err.class() {
            ErrorClass::Vanished => {
                tracing::debug!("{} '{}' vanished before {}: {}", kind, op.id(), op.action_type(), err);
                OpResult::Vanished
            }
            ErrorClass::Transient => {
                tracing::warn!(
                    "{} of {} '{}' left for the next pass (pass {}): {}",
                    op.action_type(),
                    kind,
                    op.id(),
                    pass,
                    err
                );
                OpResult::Pending {
                    creates_identity: op.creates_identity(),
                }
            }
            ErrorClass::PolicyViolation | ErrorClass::Fatal => OpResult::Failed {
                id: op.id().to_string(),
                error: err,
            },
        }
    }
}

#[async_trait]
impl<M: Mapper> AnyMapper for Erased<M> {
    fn kind(&self) -> &'static str {
        self.0.kind()
    }

    fn depends_on(&self) -> &'static [&'static str] {
        self.0.depends_on()
    }

    async fn plan(&self, ctx: &Context, env: &PassEnv<'_>) -> Result<Vec<Action>> {
        let kind = self.0.kind();
        let diff = self.load(ctx, env.identity, env.retry).await?;
        Ok(self
            .build_ops(env.mode, diff)
            .iter()
            .filter(|op| op.belongs_to(env.phase))
            .map(|op| {
                let action_type = op.action_type();
                Action {
                    action_type,
                    target: action_type.target(),
                    kind: kind.to_string(),
                    identity: op.id().to_string(),
                    row_id: op.declared().and_then(Entity::row_id),
                    description: format!("{} {} {}", action_type, kind, op.id()),
                }
            })
            .collect())
    }

    async fn pass(&self, ctx: &Context, env: &PassEnv<'_>) -> PassOutcome {
        let kind = self.0.kind();
        let diff = match self.load(ctx, env.identity, env.retry).await {
            Ok(diff) => diff,
            Err(err) => return load_failure(kind, env, err),
        };

        let mut outcome = PassOutcome {
            diff: diff.counts(),
            ..PassOutcome::default()
        };
        if diff.is_empty() {
            tracing::debug!("{}: no differences ({} unchanged)", kind, diff.unchanged);
            return outcome;
        }

        let (ops, deferred): (Vec<_>, Vec<_>) = self
            .build_ops(env.mode, diff)
            .into_iter()
            .partition(|op| op.belongs_to(env.phase));
        outcome.deferred = deferred.len();
        if ops.is_empty() {
            tracing::debug!("{}: {} difference(s) deferred to the other phase", kind, outcome.deferred);
            return outcome;
        }
        tracing::info!(
            "{}: {} declared only, {} observed only, {} changed (pass {})",
            kind,
            outcome.diff.db_only,
            outcome.diff.cloud_only,
            outcome.diff.changed,
            env.pass
        );

        let halted = AtomicBool::new(false);
        let results: Vec<OpResult> = stream::iter(ops)
            .map(|op| {
                let halted = &halted;
                async move {
                    if halted.load(Ordering::SeqCst) {
                        return OpResult::Skipped;
                    }
                    let result = self.run_op(ctx, env, op).await;
                    if matches!(result, OpResult::Failed { .. }) {
                        halted.store(true, Ordering::SeqCst);
                    }
                    result
                }
            })
            .buffer_unordered(env.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                OpResult::Applied(action) => {
                    outcome.counts.record(action);
                    outcome.applied += 1;
                }
                OpResult::Unsettled(action) => {
                    outcome.counts.record(action);
                    outcome.applied += 1;
                    outcome.pending += 1;
                    outcome.unresolved += 1;
                }
                OpResult::Vanished => {}
                OpResult::Pending { creates_identity } => {
                    outcome.pending += 1;
                    if creates_identity {
                        outcome.unresolved += 1;
                    }
                }
                OpResult::Skipped => outcome.pending += 1,
                OpResult::Failed { id, error } => {
                    tracing::error!("{} '{}' failed in pass {}: {}", kind, id, env.pass, error);
                    if outcome.failure.is_none() {
                        outcome.failure = Some(MapperFailure {
                            kind: kind.to_string(),
                            identity: Some(id),
                            pass: env.pass,
                            message: error.to_string(),
                        });
                    }
                }
            }
        }
        outcome
    }

    async fn migrate_relation(&self, ctx: &Context, from: &Relation, to_id: &str) -> Result<usize> {
        let m = &self.0;
        if !m.depends_on().contains(&from.kind.as_str()) {
            return Ok(0);
        }

        let mut moved = Vec::new();
        for mut entity in m.db().read(ctx, None).await? {
            if m.relations(&entity).contains(from) && m.repoint(&mut entity, from, to_id) {
                moved.push(entity);
            }
        }
        if moved.is_empty() {
            return Ok(0);
        }

        let count = moved.len();
        m.db().update(ctx, moved).await?;
        ctx.cache().invalidate_kind(Reality::Db, m.kind());
        Ok(count)
    }
}

fn load_failure(kind: &str, env: &PassEnv<'_>, err: EngineError) -> PassOutcome {
    match err.class() {
        ErrorClass::Transient | ErrorClass::Vanished => {
            tracing::warn!("{}: inventory unavailable in pass {}: {}", kind, env.pass, err);
            PassOutcome {
                pending: 1,
                unresolved: 1,
                ..PassOutcome::default()
            }
        }
        ErrorClass::PolicyViolation | ErrorClass::Fatal => {
            tracing::error!("{}: failed to load inventory in pass {}: {}", kind, env.pass, err);
            PassOutcome {
                failure: Some(MapperFailure {
                    kind: kind.to_string(),
                    identity: env.identity.map(str::to_string),
                    pass: env.pass,
                    message: err.to_string(),
                }),
                ..PassOutcome::default()
            }
        }
    }
}
