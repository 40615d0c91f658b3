//! Per-task scheduling decisions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// The outcome of evaluating one task against the decision chain.
///
/// A negative decision is ordinary control flow; the reason string is for
/// operators reading logs, not for machines.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulingDecision {
    pub task_id: Uuid,
    pub can_run: bool,
    pub reason: String,
    pub estimated_start: Option<DateTime<Utc>>,
}

impl SchedulingDecision {
    pub fn yes(task_id: Uuid, estimated_start: DateTime<Utc>) -> Self {
        Self {
            task_id,
            can_run: true,
            reason: "Ready to run".to_string(),
            estimated_start: Some(estimated_start),
        }
    }

    pub fn no(task_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            task_id,
            can_run: false,
            reason: reason.into(),
            estimated_start: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_flags() {
        let id = Uuid::new_v4();

        let yes = SchedulingDecision::yes(id, Utc::now());
        assert!(yes.can_run);
        assert_eq!(yes.reason, "Ready to run");
        assert!(yes.estimated_start.is_some());

        let no = SchedulingDecision::no(id, "Dependencies not satisfied");
        assert!(!no.can_run);
        assert!(no.estimated_start.is_none());
    }
}
