//! Planned operations

use crate::entity::{Reality, RowId};
use serde::{Deserialize, Serialize};

/// One operation the engine would apply for an identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub action_type: ActionType,

    /// Reality the operation writes to
    pub target: Reality,

    /// Resource kind (e.g., "network", "instance")
    pub kind: String,

    /// Encoded identity, or a pending `~<row>` key
    pub identity: String,

    /// Declared-state row, when one exists
    pub row_id: Option<RowId>,

    pub description: String,
}

/// Type of operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Declared only: create it in the provider
    Create,
    /// Both, unequal: mutate the provider resource in place
    Update,
    /// Both, unequal: create a new variant, then delete the old one
    Replace,
    /// Observed only: delete it from the provider (apply mode)
    Delete,
    /// Observed only: add it to the declared state
    Import,
    /// Observed only, prune policy: delete it from the provider
    Prune,
    /// Protected or refused: rewrite the declared row from the observed entity
    Restore,
    /// Both, unequal (sync mode): overwrite the declared row with observed values
    Refresh,
    /// Declared only (sync mode): remove the declared row
    Forget,
}

impl ActionType {
    /// The reality the operation writes to first
    pub fn target(&self) -> Reality {
        match self {
            ActionType::Create
            | ActionType::Update
            | ActionType::Replace
            | ActionType::Delete
            | ActionType::Prune => Reality::Cloud,
            ActionType::Import | ActionType::Restore | ActionType::Refresh | ActionType::Forget => {
                Reality::Db
            }
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Update => write!(f, "update"),
            ActionType::Replace => write!(f, "replace"),
            ActionType::Delete => write!(f, "delete"),
            ActionType::Import => write!(f, "import"),
            ActionType::Prune => write!(f, "prune"),
            ActionType::Restore => write!(f, "restore"),
            ActionType::Refresh => write!(f, "refresh"),
            ActionType::Forget => write!(f, "forget"),
        }
    }
}

/// Operations a dry run would apply in its first pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub actions: Vec<Action>,

    /// Whether the plan has any changes
    pub has_changes: bool,
}

impl Plan {
    pub fn new(actions: Vec<Action>) -> Self {
        let has_changes = !actions.is_empty();
        Self {
            actions,
            has_changes,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, actions: impl IntoIterator<Item = Action>) {
        self.actions.extend(actions);
        self.has_changes = !self.actions.is_empty();
    }

    /// Get actions by type
    pub fn actions_by_type(&self, action_type: ActionType) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .collect()
    }

    pub fn actions_for_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Action> + 'a {
        self.actions.iter().filter(move |a| a.kind == kind)
    }

    pub fn summary(&self) -> PlanSummary {
        let count = |t| self.actions_by_type(t).len();
        PlanSummary {
            create: count(ActionType::Create),
            update: count(ActionType::Update) + count(ActionType::Refresh),
            replace: count(ActionType::Replace),
            delete: count(ActionType::Delete)
                + count(ActionType::Prune)
                + count(ActionType::Forget),
            import: count(ActionType::Import),
            restore: count(ActionType::Restore),
        }
    }
}

/// Summary of planned actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub import: usize,
    pub restore: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} to import, {} to restore",
            self.create, self.update, self.replace, self.delete, self.import, self.restore
        )
    }
}
