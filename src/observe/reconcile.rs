//! Identity-based merging of step records into a stable ordered sequence.

use crate::api::models::DeploymentLogEntry;

/// Merges step records as they arrive, possibly repeatedly and out of order,
/// into one canonical sequence.
///
/// Records are keyed by their `id`. A record that re-arrives with a known id
/// replaces the previous version in place, keeping its position, so a
/// rendered step list updates a status badge without visually reordering.
/// Unknown ids append at the end. The `step` ordinal is never a key; ordinals
/// repeat when a reconnected stream resends history.
#[derive(Debug, Default)]
pub struct LogReconciler {
    entries: Vec<DeploymentLogEntry>,
}

impl LogReconciler {
    pub fn new() -> Self {
        LogReconciler::default()
    }

    /// Merge one record into the sequence.
    pub fn apply(&mut self, entry: DeploymentLogEntry) {
        match self.entries.iter_mut().find(|known| known.id == entry.id) {
            Some(known) => *known = entry,
            None => self.entries.push(entry),
        }
    }

    /// The merged sequence, in first-seen order.
    pub fn entries(&self) -> &[DeploymentLogEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::StepStatus;

    fn record(id: u64, step: i64, status: StepStatus) -> DeploymentLogEntry {
        DeploymentLogEntry {
            id,
            deployment_id: 1,
            step,
            action: format!("step {}", step),
            status,
            output: String::new(),
            error_msg: String::new(),
            duration: 0,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_distinct_ids_append_in_arrival_order() {
        let mut reconciler = LogReconciler::new();
        reconciler.apply(record(1, 1, StepStatus::Running));
        reconciler.apply(record(2, 2, StepStatus::Running));
        reconciler.apply(record(3, 3, StepStatus::Running));

        let ids: Vec<u64> = reconciler.entries().iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_reemitted_record_replaces_without_duplicating() {
        let mut reconciler = LogReconciler::new();
        reconciler.apply(record(1, 1, StepStatus::Running));
        reconciler.apply(record(1, 1, StepStatus::Success));

        assert_eq!(reconciler.entries().len(), 1);
        assert_eq!(reconciler.entries()[0].status, StepStatus::Success);
    }

    #[test]
    fn test_update_preserves_position() {
        let mut reconciler = LogReconciler::new();
        reconciler.apply(record(1, 1, StepStatus::Success));
        reconciler.apply(record(2, 2, StepStatus::Running));
        reconciler.apply(record(3, 3, StepStatus::Running));

        reconciler.apply(record(2, 2, StepStatus::Failed));

        let ids: Vec<u64> = reconciler.entries().iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(reconciler.entries()[1].status, StepStatus::Failed);
    }

    #[test]
    fn test_ordinal_collision_across_reconnect_keeps_both() {
        let mut reconciler = LogReconciler::new();
        // A resent history can repeat ordinals under fresh identities.
        reconciler.apply(record(1, 1, StepStatus::Success));
        reconciler.apply(record(9, 1, StepStatus::Running));

        assert_eq!(reconciler.entries().len(), 2);
    }

    #[test]
    fn test_merge_converges_to_last_delivered_versions() {
        let mut reconciler = LogReconciler::new();
        let deliveries = [
            record(1, 1, StepStatus::Running),
            record(2, 2, StepStatus::Running),
            record(1, 1, StepStatus::Success),
            record(3, 3, StepStatus::Running),
            record(2, 2, StepStatus::Failed),
            record(1, 1, StepStatus::Success),
        ];
        for delivery in deliveries {
            reconciler.apply(delivery);
        }

        assert_eq!(reconciler.entries().len(), 3);
        assert_eq!(reconciler.entries()[0].status, StepStatus::Success);
        assert_eq!(reconciler.entries()[1].status, StepStatus::Failed);
        assert_eq!(reconciler.entries()[2].status, StepStatus::Running);
    }
}
