//! The closed set of corrective actions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Corrective action the control loop may take.
///
/// The set is fixed; execution parameters (paths, thresholds) come from
/// configuration, never from the action value itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Observe only
    NoOp = 0,
    /// Remove aged files from temporary directories
    DeleteTemporary = 1,
    /// Compress files that have not been touched recently
    CompressInactive = 2,
    /// Rebalance metadata block groups
    RebalanceMetadata = 3,
    /// Delete snapshots beyond the retention count
    PruneSnapshots = 4,
}

impl Action {
    /// Number of actions
    pub const COUNT: usize = 5;

    /// All actions in index order
    pub const ALL: [Action; Self::COUNT] = [
        Action::NoOp,
        Action::DeleteTemporary,
        Action::CompressInactive,
        Action::RebalanceMetadata,
        Action::PruneSnapshots,
    ];

    /// Output index of this action in the value function
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`Action::index`]
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Whether executing this action changes anything on disk
    #[must_use]
    pub fn is_mutating(self) -> bool {
        !matches!(self, Action::NoOp)
    }

    /// Stable snake_case name used in logs and configuration
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Action::NoOp => "no_op",
            Action::DeleteTemporary => "delete_temporary",
            Action::CompressInactive => "compress_inactive",
            Action::RebalanceMetadata => "rebalance_metadata",
            Action::PruneSnapshots => "prune_snapshots",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of actions currently eligible for selection.
///
/// `NoOp` is always eligible so selection can never come up empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMask([bool; Action::COUNT]);

impl ActionMask {
    /// Every action eligible
    #[must_use]
    pub fn all() -> Self {
        Self([true; Action::COUNT])
    }

    /// Only `NoOp` eligible
    #[must_use]
    pub fn observe_only() -> Self {
        let mut mask = [false; Action::COUNT];
        mask[Action::NoOp.index()] = true;
        Self(mask)
    }

    /// Build from a predicate
    pub fn from_fn(mut allowed: impl FnMut(Action) -> bool) -> Self {
        let mut mask = [false; Action::COUNT];
        for action in Action::ALL {
            mask[action.index()] = action == Action::NoOp || allowed(action);
        }
        Self(mask)
    }

    /// Remove an action (ignored for `NoOp`)
    #[must_use]
    pub fn without(mut self, action: Action) -> Self {
        if action != Action::NoOp {
            self.0[action.index()] = false;
        }
        self
    }

    /// Intersection of two masks
    #[must_use]
    pub fn intersect(self, other: Self) -> Self {
        Self::from_fn(|a| self.allows(a) && other.allows(a))
    }

    /// Whether `action` may be selected
    #[must_use]
    pub fn allows(&self, action: Action) -> bool {
        self.0[action.index()]
    }

    /// Eligible actions in index order
    #[must_use]
    pub fn allowed(&self) -> Vec<Action> {
        Action::ALL.into_iter().filter(|a| self.allows(*a)).collect()
    }
}

impl Default for ActionMask {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_indices() {
        for (i, action) in Action::ALL.iter().enumerate() {
            assert_eq!(action.index(), i);
            assert_eq!(Action::from_index(i), Some(*action));
        }
        assert_eq!(Action::from_index(Action::COUNT), None);
    }

    #[test]
    fn test_serde_names_match_display() {
        for action in Action::ALL {
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{action}\""));
        }
    }

    #[test]
    fn test_mask_keeps_noop() {
        let mask = ActionMask::all().without(Action::NoOp);
        assert!(mask.allows(Action::NoOp));

        let mask = ActionMask::from_fn(|_| false);
        assert_eq!(mask.allowed(), vec![Action::NoOp]);
    }

    #[test]
    fn test_mask_intersect() {
        let a = ActionMask::all().without(Action::PruneSnapshots);
        let b = ActionMask::all().without(Action::CompressInactive);
        let both = a.intersect(b);
        assert!(!both.allows(Action::PruneSnapshots));
        assert!(!both.allows(Action::CompressInactive));
        assert!(both.allows(Action::DeleteTemporary));
    }
}
