use std::fmt;

use serde::{Deserialize, Serialize};

/// Approval stage. The directory an entry lives in is its stage.
///
/// Ordering follows the workflow: `Inbox < Approved < Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Inbox,
    Approved,
    Done,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Inbox, Stage::Approved, Stage::Done];

    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Inbox => "inbox",
            Stage::Approved => "approved",
            Stage::Done => "done",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::Done
    }

    /// Forward-only transition table. `Done` is terminal.
    pub fn can_advance_to(self, next: Stage) -> bool {
        matches!(
            (self, next),
            (Stage::Inbox, Stage::Approved) | (Stage::Inbox, Stage::Done) | (Stage::Approved, Stage::Done)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        assert!(Stage::Inbox.can_advance_to(Stage::Approved));
        assert!(Stage::Inbox.can_advance_to(Stage::Done));
        assert!(Stage::Approved.can_advance_to(Stage::Done));

        assert!(!Stage::Approved.can_advance_to(Stage::Inbox));
        assert!(!Stage::Inbox.can_advance_to(Stage::Inbox));
        for next in Stage::ALL {
            assert!(!Stage::Done.can_advance_to(next));
        }
    }

    #[test]
    fn stage_order_matches_workflow() {
        let mut stages = vec![Stage::Done, Stage::Inbox, Stage::Approved];
        stages.sort();
        assert_eq!(stages, Stage::ALL.to_vec());
        assert!(Stage::Done.is_terminal());
        assert_eq!(Stage::Approved.to_string(), "approved");
    }
}
