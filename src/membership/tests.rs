//! Membership Tracker Tests
//!
//! Validates the per-map live-node bookkeeping.
//!
//! ## Test Scopes
//! - **De-duplication**: Duplicate joins and unknown departures must be
//!   reported as no-ops so repair passes can be skipped.
//! - **Snapshot semantics**: `live_nodes()` excludes the local node and
//!   orders members oldest join first (the backup promotion priority).

#[cfg(test)]
mod tests {
    use crate::channel::types::NodeId;
    use crate::membership::tracker::MembershipTracker;
    use std::time::Duration;

    fn tracker() -> MembershipTracker {
        MembershipTracker::new(NodeId::from("local"))
    }

    #[test]
    fn test_member_added_reports_change() {
        let tracker = tracker();

        assert!(tracker.member_added(&NodeId::from("n1")));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let tracker = tracker();

        assert!(tracker.member_added(&NodeId::from("n1")));
        assert!(
            !tracker.member_added(&NodeId::from("n1")),
            "Second add of the same node should report no change"
        );
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_adding_self_is_noop() {
        let tracker = tracker();

        assert!(!tracker.member_added(&NodeId::from("local")));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let tracker = tracker();

        assert!(
            !tracker.member_removed(&NodeId::from("ghost")),
            "Removing a never-added node should report no change"
        );
    }

    #[test]
    fn test_add_then_remove() {
        let tracker = tracker();

        tracker.member_added(&NodeId::from("n1"));
        assert!(tracker.contains(&NodeId::from("n1")));

        assert!(tracker.member_removed(&NodeId::from("n1")));
        assert!(!tracker.contains(&NodeId::from("n1")));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_live_nodes_excludes_self() {
        let tracker = tracker();

        tracker.member_added(&NodeId::from("n1"));
        tracker.member_added(&NodeId::from("local"));

        let live = tracker.live_nodes();
        assert_eq!(live, vec![NodeId::from("n1")]);
    }

    #[test]
    fn test_live_nodes_ordered_oldest_first() {
        let tracker = tracker();

        tracker.member_added(&NodeId::from("zz-old"));
        std::thread::sleep(Duration::from_millis(5));
        tracker.member_added(&NodeId::from("aa-young"));

        // The later joiner sorts last even though its id sorts first.
        let live = tracker.live_nodes();
        assert_eq!(live, vec![NodeId::from("zz-old"), NodeId::from("aa-young")]);
    }

    #[test]
    fn test_clear_drops_everything() {
        let tracker = tracker();

        tracker.member_added(&NodeId::from("n1"));
        tracker.member_added(&NodeId::from("n2"));
        tracker.clear();

        assert!(tracker.is_empty());
        assert!(tracker.live_nodes().is_empty());
    }
}
