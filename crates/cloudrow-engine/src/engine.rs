//! Reconciliation engine
//!
//! A run takes the account lease, selects modules in dependency order and
//! drives each one to a fixpoint: passes over the module's mappers repeat
//! until one shows no differences for any live mapper. Within a pass a
//! mapper is not diffed while a kind it depends on still has identities
//! waiting to come into existence, and a mapper whose dependency failed is
//! skipped for the rest of the run.
//!
//! Removing undeclared resources from the provider is held back until every
//! selected module has converged. A teardown phase then walks the modules
//! and their mappers in reverse, so dependents are gone before the
//! resources they reference.

use crate::action::{Action, Plan};
use crate::context::Context;
use crate::diff::DiffCounts;
use crate::error::{EngineError, Result};
use crate::lease::{LeaseManager, LeasePolicy};
use crate::module::{Registry, Selection};
use crate::reconcile::{AnyMapper, PassEnv, Phase};
use crate::report::{MapperFailure, ModuleReport, RunReport};
use crate::retry::RetryPolicy;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Which reality is authoritative
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Declared state drives the provider; undeclared resources follow each
    /// mapper's orphan policy
    #[default]
    Reconcile,
    /// Declared state drives the provider; undeclared resources are deleted
    Apply,
    /// The provider drives the declared state
    Sync,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Reconcile => write!(f, "reconcile"),
            Mode::Apply => write!(f, "apply"),
            Mode::Sync => write!(f, "sync"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reconcile" => Ok(Mode::Reconcile),
            "apply" => Ok(Mode::Apply),
            "sync" => Ok(Mode::Sync),
            other => Err(EngineError::InvalidRequest(format!("unknown mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Passes per module before giving up
    pub max_passes: u32,
    /// Consecutive identical passes without progress before giving up
    pub stall_passes: u32,
    /// Concurrent operations per mapper pass
    pub concurrency: usize,
    pub run_timeout: Duration,
    pub retry: RetryPolicy,
    pub lease: LeasePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_passes: 16,
            stall_passes: 4,
            concurrency: 8,
            run_timeout: Duration::from_secs(60 * 60),
            retry: RetryPolicy::default(),
            lease: LeasePolicy::Reject,
        }
    }
}

/// Parameters of one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRequest {
    pub account: String,
    pub mode: Mode,
    pub module: Option<String>,
    pub mapper: Option<String>,
    /// Restrict the run to one identity of `mapper`
    pub identity: Option<String>,
    pub dry_run: bool,
    /// Modules installed for the account; `None` means every registered one
    pub installed: Option<BTreeSet<String>>,
}

impl RunRequest {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            ..Self::default()
        }
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn mapper(mut self, mapper: impl Into<String>) -> Self {
        self.mapper = Some(mapper.into());
        self
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn installed(mut self, modules: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.installed = Some(modules.into_iter().map(Into::into).collect());
        self
    }

    /// Drop modules that are not installed. Naming one explicitly is an error.
    fn installed_only<'a>(&self, selection: Vec<Selection<'a>>) -> Result<Vec<Selection<'a>>> {
        let Some(installed) = &self.installed else {
            return Ok(selection);
        };
        let explicit = self.module.is_some() || self.mapper.is_some();
        let mut kept = Vec::with_capacity(selection.len());
        for selected in selection {
            if installed.contains(selected.module.name) {
                kept.push(selected);
            } else if explicit {
                return Err(EngineError::ModuleNotInstalled(selected.module.name.to_string()));
            }
        }
        Ok(kept)
    }

    fn validate(&self) -> Result<()> {
        if self.account.is_empty() {
            return Err(EngineError::InvalidRequest("account is required".to_string()));
        }
        if self.identity.is_some() && self.mapper.is_none() {
            return Err(EngineError::InvalidRequest(
                "an identity can only be reconciled together with its mapper".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct Engine {
    registry: Registry,
    config: EngineConfig,
    leases: LeaseManager,
}

/// Per-mapper fingerprint of one pass, compared across passes
type Signature = Vec<(&'static str, Option<DiffCounts>, usize)>;

impl Engine {
    pub fn new(registry: Registry, config: EngineConfig) -> Self {
        Self {
            registry,
            config,
            leases: LeaseManager::new(),
        }
    }

    /// Share a lease manager with other engines in the process
    pub fn with_leases(mut self, leases: LeaseManager) -> Self {
        self.leases = leases;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Reconcile (or plan) one account.
    ///
    /// Request-level problems (unknown module, lease held, run deadline) fail
    /// the whole call. Mapper and module failures are reported in the
    /// returned [`RunReport`] and leave other modules' results intact.
    pub async fn run(&self, mut ctx: Context, request: &RunRequest) -> Result<RunReport> {
        request.validate()?;
        if ctx.account() != request.account {
            return Err(EngineError::InvalidRequest(format!(
                "context is for account '{}', request is for '{}'",
                ctx.account(),
                request.account
            )));
        }

        let _lease = self.leases.acquire(&request.account, self.config.lease).await?;
        let selection = request.installed_only(
            self.registry
                .select(request.module.as_deref(), request.mapper.as_deref())?,
        )?;

        let started_at = Utc::now();
        let clock = Instant::now();
        tracing::info!(
            "Starting {} run for account {} ({} module(s){})",
            request.mode,
            request.account,
            selection.len(),
            if request.dry_run { ", dry run" } else { "" }
        );

        ctx.cache().clear();
        match clock.checked_add(self.config.run_timeout) {
            Some(deadline) => ctx.set_deadline(deadline),
            None => tracing::warn!(
                "Run timeout {:?} is out of range, running without a deadline",
                self.config.run_timeout
            ),
        }
        let outcome =
            tokio::time::timeout(self.config.run_timeout, self.run_selection(&ctx, request, &selection))
                .await;
        ctx.teardown();

        let (modules, plan) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                tracing::error!(
                    "Run for account {} exceeded its {:?} deadline",
                    request.account,
                    self.config.run_timeout
                );
                return Err(EngineError::DeadlineExceeded);
            }
        };

        let report = RunReport {
            account: request.account.clone(),
            mode: request.mode,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            modules,
            plan,
        };
        if report.is_success() {
            tracing::info!(
                "Run for account {} finished in {}ms: {}",
                report.account,
                report.duration_ms,
                report.counts()
            );
        } else {
            tracing::warn!(
                "Run for account {} finished with failures in {}ms",
                report.account,
                report.duration_ms
            );
        }
        Ok(report)
    }

    async fn run_selection(
        &self,
        ctx: &Context,
        request: &RunRequest,
        selection: &[Selection<'_>],
    ) -> Result<(Vec<ModuleReport>, Option<Plan>)> {
        let teardown = request.mode != Mode::Sync;

        if request.dry_run {
            let mut plan = Plan::empty();
            let mut modules = Vec::with_capacity(selection.len());
            for selected in selection {
                let mut report = module_report(selected);
                plan.extend(self.plan_module(ctx, request, selected, Phase::Converge, &mut report).await);
                modules.push(report);
            }
            if teardown {
                for (selected, report) in selection.iter().zip(modules.iter_mut()).rev() {
                    plan.extend(self.plan_module(ctx, request, selected, Phase::Teardown, report).await);
                }
            }
            return Ok((modules, Some(plan)));
        }

        let mut failed_kinds: HashSet<&'static str> = HashSet::new();
        let mut modules = Vec::with_capacity(selection.len());
        for selected in selection {
            let module = selected.module;
            tracing::info!("Reconciling module {} v{}", module.name, module.version);
            let mut report = module_report(selected);
            self.drive_module(ctx, request, selected, Phase::Converge, &mut report, &mut failed_kinds)
                .await;
            modules.push(report);
        }
        if teardown {
            for (selected, report) in selection.iter().zip(modules.iter_mut()).rev() {
                self.drive_module(ctx, request, selected, Phase::Teardown, report, &mut failed_kinds)
                    .await;
            }
        }
        Ok((modules, None))
    }

    fn pass_env<'a>(&'a self, request: &'a RunRequest, pass: u32, phase: Phase) -> PassEnv<'a> {
        PassEnv {
            mode: request.mode,
            phase,
            identity: request.identity.as_deref(),
            pass,
            retry: &self.config.retry,
            concurrency: self.config.concurrency,
            mappers: self.registry.mappers(),
        }
    }

    /// Registered kinds that reference `kind`
    fn dependents<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'static str> + 'a {
        self.registry
            .mappers()
            .iter()
            .filter(move |m| m.depends_on().iter().any(|d| *d == kind))
            .map(|m| m.kind())
    }

    async fn plan_module(
        &self,
        ctx: &Context,
        request: &RunRequest,
        selected: &Selection<'_>,
        phase: Phase,
        report: &mut ModuleReport,
    ) -> Vec<Action> {
        let env = self.pass_env(request, 1, phase);
        let mut actions = Vec::new();

        for mapper in phase_order(selected, phase) {
            if !report.mapper(mapper.kind()).is_some_and(|m| m.is_live()) {
                continue;
            }
            match mapper.plan(ctx, &env).await {
                Ok(planned) => actions.extend(planned),
                Err(err) => {
                    tracing::error!("{}: planning failed: {}", mapper.kind(), err);
                    if let Some(m) = report.mapper_mut(mapper.kind()) {
                        m.failure = Some(MapperFailure {
                            kind: mapper.kind().to_string(),
                            identity: request.identity.clone(),
                            pass: 1,
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        report.passes = 1;
        report.converged = match phase {
            Phase::Converge => actions.is_empty(),
            Phase::Teardown => report.converged && actions.is_empty(),
        };
        actions
    }

    /// Repeat passes of one phase over a module until no live mapper has
    /// anything left to do in it, the module stalls or the pass ceiling is
    /// reached.
    ///
    /// Every converge pass counts towards the module's passes. A teardown
    /// pass counts only when it found something to remove.
    async fn drive_module(
        &self,
        ctx: &Context,
        request: &RunRequest,
        selected: &Selection<'_>,
        phase: Phase,
        report: &mut ModuleReport,
        failed_kinds: &mut HashSet<&'static str>,
    ) {
        let module = selected.module;
        let first = report.passes;
        let mut previous: Option<Signature> = None;
        let mut streak = 0;

        for attempt in 1..=self.config.max_passes {
            let pass = first + attempt;
            let env = self.pass_env(request, pass, phase);

            let mut dirty: HashSet<&'static str> = HashSet::new();
            let mut blocking: HashSet<&'static str> = HashSet::new();
            let mut signature: Signature = Vec::with_capacity(selected.mappers.len());
            let mut progressed = false;

            for mapper in phase_order(selected, phase) {
                let kind = mapper.kind();
                if !report.mapper(kind).is_some_and(|m| m.is_live()) {
                    continue;
                }

                match phase {
                    Phase::Converge => {
                        if let Some(dep) = mapper.depends_on().iter().find(|d| failed_kinds.contains(*d)) {
                            tracing::warn!("{}: skipped, dependency {} failed", kind, dep);
                            if let Some(m) = report.mapper_mut(kind) {
                                m.skipped = Some(format!("dependency {} failed", dep));
                            }
                            failed_kinds.insert(kind);
                            continue;
                        }

                        if let Some(dep) = mapper.depends_on().iter().find(|d| blocking.contains(*d)) {
                            tracing::debug!("{}: blocked on {} in pass {}", kind, dep, pass);
                            dirty.insert(kind);
                            blocking.insert(kind);
                            signature.push((kind, None, 0));
                            continue;
                        }
                    }
                    Phase::Teardown => {
                        if failed_kinds.contains(kind) {
                            continue;
                        }
                        if let Some(dependent) = self.dependents(kind).find(|d| failed_kinds.contains(d)) {
                            tracing::warn!("{}: teardown skipped, dependent {} failed", kind, dependent);
                            if let Some(m) = report.mapper_mut(kind) {
                                m.skipped = Some(format!("dependent {} failed", dependent));
                            }
                            failed_kinds.insert(kind);
                            continue;
                        }
                    }
                }

                let outcome = mapper.pass(ctx, &env).await;
                if outcome.applied > 0 {
                    progressed = true;
                }
                if outcome.is_dirty() {
                    dirty.insert(kind);
                }
                if phase == Phase::Converge && outcome.unresolved > 0 {
                    blocking.insert(kind);
                }
                signature.push((kind, Some(outcome.diff), outcome.pending));

                if let Some(m) = report.mapper_mut(kind) {
                    m.counts.add(&outcome.counts);
                    if let Some(failure) = outcome.failure {
                        m.failure = Some(failure);
                        failed_kinds.insert(kind);
                    }
                }
            }

            let unsettled: Vec<&'static str> = live_kinds(report, &selected.mappers)
                .filter(|k| dirty.contains(k))
                .collect();
            if phase == Phase::Converge || !unsettled.is_empty() {
                report.passes = pass;
            }
            if unsettled.is_empty() {
                let clean = report.mappers.iter().all(|m| m.is_live());
                report.converged = match phase {
                    Phase::Converge => clean,
                    Phase::Teardown => report.converged && clean,
                };
                if phase == Phase::Converge || report.passes > first {
                    tracing::info!(
                        "Module {} settled after {} pass(es){}",
                        module.name,
                        report.passes,
                        if report.converged { "" } else { " with failures" }
                    );
                }
                return;
            }

            streak = if !progressed && previous.as_ref() == Some(&signature) {
                streak + 1
            } else {
                1
            };
            if streak >= self.config.stall_passes {
                let err = EngineError::ForwardProgressHalted {
                    module: module.name.to_string(),
                    pass,
                };
                tracing::error!("{} ({} still differ)", err, unsettled.join(", "));
                halt(report, err);
                failed_kinds.extend(unsettled);
                return;
            }
            previous = Some(signature);
        }

        let err = EngineError::PassCeilingExceeded {
            module: module.name.to_string(),
            passes: self.config.max_passes,
        };
        tracing::error!("{}", err);
        halt(report, err);
        failed_kinds.extend(live_kinds(report, &selected.mappers).collect::<Vec<_>>());
    }
}

fn module_report(selected: &Selection<'_>) -> ModuleReport {
    ModuleReport::new(selected.module.name, selected.mappers.iter().map(|m| m.kind()))
}

/// Mappers in registration order to converge, reversed to tear down
fn phase_order<'a>(
    selected: &'a Selection<'_>,
    phase: Phase,
) -> Box<dyn Iterator<Item = &'a Arc<dyn AnyMapper>> + 'a> {
    match phase {
        Phase::Converge => Box::new(selected.mappers.iter()),
        Phase::Teardown => Box::new(selected.mappers.iter().rev()),
    }
}

/// Record the first error that stopped a module
fn halt(report: &mut ModuleReport, err: EngineError) {
    report.converged = false;
    if report.error.is_none() {
        report.error = Some(err.to_string());
    }
}

fn live_kinds<'a>(
    report: &'a ModuleReport,
    mappers: &'a [Arc<dyn AnyMapper>],
) -> impl Iterator<Item = &'static str> + 'a {
    mappers
        .iter()
        .map(|m| m.kind())
        .filter(|k| report.mapper(k).is_some_and(|m| m.is_live()))
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("leases", &self.leases)
            .finish()
    }
}
