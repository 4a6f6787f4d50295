use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Queued,
    Processing,
    Delivered,
    Failed,
    Retrying,
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Delivered | NotificationStatus::Failed)
    }

    /// A `retrying` notification stays visible as such while its delayed
    /// message waits on the queue, and goes straight to `processing` when a
    /// worker picks the message up again.
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;

        matches!(
            (self, next),
            (Queued, Processing)
                | (Processing, Delivered)
                | (Processing, Failed)
                | (Processing, Retrying)
                | (Retrying, Processing)
                | (Failed, Queued)
        )
    }
}

impl Display for NotificationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            NotificationStatus::Queued => write!(f, "queued"),
            NotificationStatus::Processing => write!(f, "processing"),
            NotificationStatus::Delivered => write!(f, "delivered"),
            NotificationStatus::Failed => write!(f, "failed"),
            NotificationStatus::Retrying => write!(f, "retrying"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrying_resumes_through_processing() {
        use NotificationStatus::*;

        assert!(Retrying.can_transition_to(Processing));
        assert!(!Retrying.can_transition_to(Queued));
        assert!(!Retrying.can_transition_to(Delivered));
    }

    #[test]
    fn only_failed_terminal_state_can_be_requeued() {
        use NotificationStatus::*;

        assert!(Failed.can_transition_to(Queued));
        assert!(!Delivered.can_transition_to(Queued));
        assert!(Delivered.is_terminal() && Failed.is_terminal());
        assert!(!Retrying.is_terminal());
    }
}
