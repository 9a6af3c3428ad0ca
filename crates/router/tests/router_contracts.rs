use std::collections::HashMap;

use router::{DEFAULT_VIRTUAL_NODES, RouterState, StickyRouter};

fn router_with_workers(count: usize) -> StickyRouter {
    let mut router = StickyRouter::default();
    for index in 0..count {
        router.add_worker(format!("worker-{index}"));
    }
    router
}

#[test]
fn a_thousand_users_spread_within_the_balance_contract() {
    let mut router = router_with_workers(4);
    let mut counts: HashMap<String, usize> = HashMap::new();
    for index in 0..1_000 {
        let decision = router
            .route(&format!("user-{index}"))
            .expect("route should succeed");
        *counts.entry(decision.worker_id).or_default() += 1;
    }

    assert_eq!(counts.values().sum::<usize>(), 1_000);
    for index in 0..4 {
        let count = counts
            .get(&format!("worker-{index}"))
            .copied()
            .unwrap_or_default();
        assert!(
            (51..=499).contains(&count),
            "worker-{index} received {count} assignments, outside 51..=499"
        );
    }
}

#[test]
fn assignments_survive_membership_growth() {
    let mut router = router_with_workers(3);
    let mut recorded = HashMap::new();
    for index in 0..300 {
        let user_id = format!("user-{index}");
        let decision = router.route(&user_id).expect("route should succeed");
        recorded.insert(user_id, decision.worker_id);
    }

    router.add_worker("worker-3");
    router.add_worker("worker-4");

    for (user_id, worker_id) in &recorded {
        let decision = router.route(user_id).expect("route should succeed");
        assert_eq!(&decision.worker_id, worker_id, "{user_id} moved on growth");
    }
}

#[test]
fn rerouting_after_removal_avoids_the_removed_worker() {
    let mut router = router_with_workers(2);
    let mut on_zero = Vec::new();
    for index in 0..100 {
        let user_id = format!("user-{index}");
        let decision = router.route(&user_id).expect("route should succeed");
        if decision.worker_id == "worker-0" {
            on_zero.push(user_id);
        }
    }
    assert!(!on_zero.is_empty());

    router.remove_worker("worker-0");
    for user_id in &on_zero {
        let decision = router.route(user_id).expect("route should succeed");
        assert_eq!(decision.worker_id, "worker-1");
    }
}

#[test]
fn peek_agrees_with_route_for_uncached_users_and_stays_pure() {
    let mut router = router_with_workers(4);
    for index in 0..50 {
        let user_id = format!("user-{index}");
        let peeked = router.peek(&user_id).expect("ring should not be empty");
        let routed = router.route(&user_id).expect("route should succeed");
        assert_eq!(peeked, routed.worker_id);
    }

    let cached = router.assignment_count();
    for index in 0..50 {
        router.peek(&format!("other-{index}"));
    }
    assert_eq!(router.assignment_count(), cached);
}

#[test]
fn exported_state_serializes_and_restores_route_outputs() {
    let mut router = router_with_workers(4);
    for index in 0..100 {
        router
            .route(&format!("user-{index}"))
            .expect("route should succeed");
    }

    let state = router.export_state();
    assert_eq!(state.virtual_nodes, DEFAULT_VIRTUAL_NODES);
    assert_eq!(state.workers.len(), 4);

    let encoded = serde_json::to_string(&state).expect("state should serialize");
    let decoded: RouterState = serde_json::from_str(&encoded).expect("state should deserialize");
    let mut restored = StickyRouter::from_state(decoded);

    for index in 0..100 {
        let user_id = format!("user-{index}");
        let original = router.route(&user_id).expect("route should succeed");
        let replayed = restored.route(&user_id).expect("route should succeed");
        assert_eq!(replayed.worker_id, original.worker_id);
    }
}
