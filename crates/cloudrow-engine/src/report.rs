//! Run results

use crate::action::{ActionType, Plan};
use crate::engine::Mode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Applied operations per kind of change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub imported: usize,
    pub pruned: usize,
    pub restored: usize,
}

impl ChangeCounts {
    pub fn record(&mut self, action: ActionType) {
        match action {
            ActionType::Create => self.created += 1,
            ActionType::Update | ActionType::Refresh => self.updated += 1,
            ActionType::Replace => self.replaced += 1,
            ActionType::Delete | ActionType::Forget => self.deleted += 1,
            ActionType::Import => self.imported += 1,
            ActionType::Prune => self.pruned += 1,
            ActionType::Restore => self.restored += 1,
        }
    }

    pub fn add(&mut self, other: &ChangeCounts) {
        self.created += other.created;
        self.updated += other.updated;
        self.replaced += other.replaced;
        self.deleted += other.deleted;
        self.imported += other.imported;
        self.pruned += other.pruned;
        self.restored += other.restored;
    }

    pub fn total(&self) -> usize {
        self.created
            + self.updated
            + self.replaced
            + self.deleted
            + self.imported
            + self.pruned
            + self.restored
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl std::fmt::Display for ChangeCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} replaced, {} deleted, {} imported, {} pruned, {} restored",
            self.created,
            self.updated,
            self.replaced,
            self.deleted,
            self.imported,
            self.pruned,
            self.restored
        )
    }
}

/// A mapper's pass that stopped on a fatal error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperFailure {
    pub kind: String,
    /// Identity being processed, or `None` when the inventory could not be loaded
    pub identity: Option<String>,
    pub pass: u32,
    pub message: String,
}

impl std::fmt::Display for MapperFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.identity {
            Some(id) => write!(f, "{} '{}' (pass {}): {}", self.kind, id, self.pass, self.message),
            None => write!(f, "{} (pass {}): {}", self.kind, self.pass, self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapperReport {
    pub kind: String,
    pub counts: ChangeCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<MapperFailure>,
    /// Why the mapper was not run to completion, e.g. a failed dependency
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl MapperReport {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            counts: ChangeCounts::default(),
            failure: None,
            skipped: None,
        }
    }

    /// Neither failed nor skipped
    pub fn is_live(&self) -> bool {
        self.failure.is_none() && self.skipped.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleReport {
    pub name: String,
    pub passes: u32,
    pub converged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub mappers: Vec<MapperReport>,
}

impl ModuleReport {
    pub fn new(name: impl Into<String>, kinds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            passes: 0,
            converged: false,
            error: None,
            mappers: kinds.into_iter().map(MapperReport::new).collect(),
        }
    }

    pub fn mapper(&self, kind: &str) -> Option<&MapperReport> {
        self.mappers.iter().find(|m| m.kind == kind)
    }

    pub(crate) fn mapper_mut(&mut self, kind: &str) -> Option<&mut MapperReport> {
        self.mappers.iter_mut().find(|m| m.kind == kind)
    }

    pub fn counts(&self) -> ChangeCounts {
        let mut total = ChangeCounts::default();
        for m in &self.mappers {
            total.add(&m.counts);
        }
        total
    }

    pub fn failures(&self) -> impl Iterator<Item = &MapperFailure> {
        self.mappers.iter().filter_map(|m| m.failure.as_ref())
    }

    pub fn is_success(&self) -> bool {
        self.converged && self.error.is_none() && self.mappers.iter().all(MapperReport::is_live)
    }
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub account: String,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub modules: Vec<ModuleReport>,
    /// Present for dry runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.modules.iter().all(ModuleReport::is_success)
    }

    pub fn module(&self, name: &str) -> Option<&ModuleReport> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Counts for `kind`, wherever it is registered
    pub fn counts_for(&self, kind: &str) -> ChangeCounts {
        self.modules
            .iter()
            .filter_map(|m| m.mapper(kind))
            .map(|m| m.counts)
            .next()
            .unwrap_or_default()
    }

    pub fn counts(&self) -> ChangeCounts {
        let mut total = ChangeCounts::default();
        for m in &self.modules {
            total.add(&m.counts());
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts() {
        let mut counts = ChangeCounts::default();
        counts.record(ActionType::Create);
        counts.record(ActionType::Refresh);
        counts.record(ActionType::Forget);
        counts.record(ActionType::Prune);

        assert_eq!(counts.created, 1);
        assert_eq!(counts.updated, 1);
        assert_eq!(counts.deleted, 1);
        assert_eq!(counts.pruned, 1);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn test_module_success() {
        let mut module = ModuleReport::new("networking", ["network", "subnet"]);
        module.converged = true;
        assert!(module.is_success());

        module.mapper_mut("subnet").unwrap().failure = Some(MapperFailure {
            kind: "subnet".into(),
            identity: Some("us-east-1|a".into()),
            pass: 2,
            message: "bad cidr".into(),
        });
        assert!(!module.is_success());
        assert_eq!(module.failures().count(), 1);
        assert_eq!(
            module.failures().next().unwrap().to_string(),
            "subnet 'us-east-1|a' (pass 2): bad cidr"
        );
    }
}
