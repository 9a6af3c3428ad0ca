use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_VIRTUAL_NODES: usize = 150;

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over the UTF-8 bytes of `key`. Used for both user ids and
/// virtual-node keys so placements are reproducible across processes.
pub fn fnv1a_32(key: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("no workers are registered on the ring")]
    NoWorkersAvailable,
    #[error("worker `{worker_id}` is not registered")]
    UnknownWorker { worker_id: String },
}

/// One virtual node on the ring. A worker contributes `virtual_nodes` of
/// these, keyed `"<workerId>:<virtualIndex>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingNode {
    pub hash: u32,
    pub worker_id: String,
    pub virtual_index: u32,
}

/// Outcome of a routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub worker_id: String,
    pub user_id: String,
    pub hash_value: u32,
    pub is_new_assignment: bool,
}

/// Serializable snapshot of the router: worker set, sticky assignments and
/// the virtual-node count. Assignments referencing workers absent from
/// `workers` are dropped on import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterState {
    pub workers: Vec<String>,
    pub assignments: Vec<(String, String)>,
    pub virtual_nodes: usize,
}

/// Consistent-hash router with a sticky assignment cache. The cache is
/// authoritative over the ring: once a user is assigned, membership changes
/// never move them while their worker stays registered.
#[derive(Debug, Clone)]
pub struct StickyRouter {
    virtual_nodes: usize,
    workers: BTreeSet<String>,
    ring: Vec<RingNode>,
    assignments: HashMap<String, String>,
}

impl Default for StickyRouter {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

impl StickyRouter {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            workers: BTreeSet::new(),
            ring: Vec::new(),
            assignments: HashMap::new(),
        }
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    pub fn workers(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(String::as_str)
    }

    pub fn contains_worker(&self, worker_id: &str) -> bool {
        self.workers.contains(worker_id)
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }

    /// Register a worker and insert its virtual nodes. Idempotent; existing
    /// assignments are untouched (stickiness wins over rebalance).
    pub fn add_worker(&mut self, worker_id: impl Into<String>) {
        let worker_id = worker_id.into();
        if !self.workers.insert(worker_id.clone()) {
            return;
        }
        for virtual_index in 0..self.virtual_nodes as u32 {
            let hash = fnv1a_32(&format!("{worker_id}:{virtual_index}"));
            self.ring.push(RingNode {
                hash,
                worker_id: worker_id.clone(),
                virtual_index,
            });
        }
        self.sort_ring();
        debug!(worker_id = %worker_id, ring_size = self.ring.len(), "worker added to ring");
    }

    /// Drop a worker's virtual nodes and purge every assignment that pointed
    /// at it. Idempotent.
    pub fn remove_worker(&mut self, worker_id: &str) {
        if !self.workers.remove(worker_id) {
            return;
        }
        self.ring.retain(|node| node.worker_id != worker_id);
        self.assignments.retain(|_, assigned| assigned != worker_id);
        debug!(worker_id = %worker_id, ring_size = self.ring.len(), "worker removed from ring");
    }

    /// Resolve the worker for `user_id`, caching the decision. A cached
    /// assignment is returned as long as its worker is still registered.
    pub fn route(&mut self, user_id: &str) -> Result<RouteDecision, RouterError> {
        let hash_value = fnv1a_32(user_id);
        if let Some(assigned) = self.assignments.get(user_id)
            && self.workers.contains(assigned)
        {
            return Ok(RouteDecision {
                worker_id: assigned.clone(),
                user_id: user_id.to_owned(),
                hash_value,
                is_new_assignment: false,
            });
        }

        let worker_id = self
            .lookup(hash_value)
            .ok_or(RouterError::NoWorkersAvailable)?;
        self.assignments
            .insert(user_id.to_owned(), worker_id.clone());
        Ok(RouteDecision {
            worker_id,
            user_id: user_id.to_owned(),
            hash_value,
            is_new_assignment: true,
        })
    }

    /// Ring lookup without reading or writing the cache. Returns `None` when
    /// the ring is empty.
    pub fn peek(&self, user_id: &str) -> Option<String> {
        self.lookup(fnv1a_32(user_id))
    }

    /// Install an assignment bypassing the ring.
    pub fn force_assign(&mut self, user_id: &str, worker_id: &str) -> Result<(), RouterError> {
        if !self.workers.contains(worker_id) {
            return Err(RouterError::UnknownWorker {
                worker_id: worker_id.to_owned(),
            });
        }
        self.assignments
            .insert(user_id.to_owned(), worker_id.to_owned());
        Ok(())
    }

    pub fn assigned_worker(&self, user_id: &str) -> Option<&str> {
        self.assignments.get(user_id).map(String::as_str)
    }

    pub fn clear_assignment(&mut self, user_id: &str) {
        self.assignments.remove(user_id);
    }

    pub fn clear_cache(&mut self) {
        self.assignments.clear();
    }

    pub fn export_state(&self) -> RouterState {
        let mut assignments: Vec<(String, String)> = self
            .assignments
            .iter()
            .map(|(user, worker)| (user.clone(), worker.clone()))
            .collect();
        assignments.sort();
        RouterState {
            workers: self.workers.iter().cloned().collect(),
            assignments,
            virtual_nodes: self.virtual_nodes,
        }
    }

    pub fn from_state(state: RouterState) -> Self {
        let mut router = Self::new(state.virtual_nodes);
        for worker_id in state.workers {
            router.add_worker(worker_id);
        }
        for (user_id, worker_id) in state.assignments {
            if router.workers.contains(&worker_id) {
                router.assignments.insert(user_id, worker_id);
            }
        }
        router
    }

    /// First ring node with hash ≥ target, wrapping to the lowest node.
    fn lookup(&self, target: u32) -> Option<String> {
        if self.ring.is_empty() {
            return None;
        }
        let index = self.ring.partition_point(|node| node.hash < target);
        let node = if index == self.ring.len() {
            &self.ring[0]
        } else {
            &self.ring[index]
        };
        Some(node.worker_id.clone())
    }

    fn sort_ring(&mut self) {
        // Tie-break on (worker, index) so equal hashes order deterministically.
        self.ring.sort_by(|a, b| {
            a.hash
                .cmp(&b.hash)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
                .then_with(|| a.virtual_index.cmp(&b.virtual_index))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with_workers(count: usize) -> StickyRouter {
        let mut router = StickyRouter::default();
        for index in 0..count {
            router.add_worker(format!("worker-{index}"));
        }
        router
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        // Published FNV-1a 32-bit test vectors.
        assert_eq!(fnv1a_32(""), 0x811C_9DC5);
        assert_eq!(fnv1a_32("a"), 0xE40C_292C);
        assert_eq!(fnv1a_32("foobar"), 0xBF9C_F968);
    }

    #[test]
    fn ring_holds_virtual_nodes_per_worker() {
        let router = router_with_workers(3);
        assert_eq!(router.ring.len(), 3 * DEFAULT_VIRTUAL_NODES);
        for index in 0..3 {
            let worker_id = format!("worker-{index}");
            let count = router
                .ring
                .iter()
                .filter(|node| node.worker_id == worker_id)
                .count();
            assert_eq!(count, DEFAULT_VIRTUAL_NODES);
        }
    }

    #[test]
    fn add_worker_is_idempotent() {
        let mut router = router_with_workers(2);
        let ring_before = router.ring.clone();
        router.add_worker("worker-1");
        assert_eq!(router.ring, ring_before);
    }

    #[test]
    fn route_is_sticky_across_repeated_calls() {
        let mut router = router_with_workers(3);
        let first = router.route("user-a").expect("route should succeed");
        assert!(first.is_new_assignment);
        for _ in 0..10 {
            let again = router.route("user-a").expect("route should succeed");
            assert_eq!(again.worker_id, first.worker_id);
            assert!(!again.is_new_assignment);
        }
    }

    #[test]
    fn empty_ring_reports_no_workers() {
        let mut router = StickyRouter::default();
        assert_eq!(
            router.route("user-a"),
            Err(RouterError::NoWorkersAvailable)
        );
        assert_eq!(router.peek("user-a"), None);
    }

    #[test]
    fn adding_a_worker_does_not_move_cached_users() {
        let mut router = router_with_workers(3);
        let mut assigned = Vec::new();
        for index in 0..100 {
            let user_id = format!("user-{index}");
            let decision = router.route(&user_id).expect("route should succeed");
            assigned.push((user_id, decision.worker_id));
        }

        router.add_worker("worker-3");
        for (user_id, worker_id) in &assigned {
            let decision = router.route(user_id).expect("route should succeed");
            assert_eq!(&decision.worker_id, worker_id);
            assert!(!decision.is_new_assignment);
        }
    }

    #[test]
    fn removing_a_worker_purges_its_assignments() {
        let mut router = router_with_workers(4);
        let mut victims = Vec::new();
        for index in 0..200 {
            let user_id = format!("user-{index}");
            let decision = router.route(&user_id).expect("route should succeed");
            if decision.worker_id == "worker-2" {
                victims.push(user_id);
            }
        }
        assert!(!victims.is_empty(), "hash should land users on worker-2");

        router.remove_worker("worker-2");
        assert!(router.ring.iter().all(|node| node.worker_id != "worker-2"));
        for user_id in &victims {
            let decision = router.route(user_id).expect("route should succeed");
            assert_ne!(decision.worker_id, "worker-2");
            assert!(decision.is_new_assignment);
        }
    }

    #[test]
    fn add_then_remove_restores_the_previous_ring() {
        let mut router = router_with_workers(3);
        let ring_before = router.ring.clone();
        let workers_before: Vec<String> = router.workers().map(str::to_owned).collect();

        router.add_worker("worker-9");
        router.remove_worker("worker-9");

        assert_eq!(router.ring, ring_before);
        let workers_after: Vec<String> = router.workers().map(str::to_owned).collect();
        assert_eq!(workers_after, workers_before);
        assert!(router.assignments.values().all(|worker| worker != "worker-9"));
    }

    #[test]
    fn peek_never_touches_the_cache() {
        let mut router = router_with_workers(3);
        router.route("user-a").expect("route should succeed");
        let cached = router.assignment_count();

        for index in 0..50 {
            router.peek(&format!("peek-user-{index}"));
        }
        assert_eq!(router.assignment_count(), cached);
    }

    #[test]
    fn force_assign_requires_a_registered_worker() {
        let mut router = router_with_workers(2);
        router
            .force_assign("user-a", "worker-1")
            .expect("assignment to a registered worker should succeed");
        let decision = router.route("user-a").expect("route should succeed");
        assert_eq!(decision.worker_id, "worker-1");
        assert!(!decision.is_new_assignment);

        let error = router
            .force_assign("user-b", "worker-7")
            .expect_err("unknown worker should be rejected");
        assert_eq!(
            error,
            RouterError::UnknownWorker {
                worker_id: "worker-7".to_owned()
            }
        );
    }

    #[test]
    fn clear_assignment_evicts_a_single_user() {
        let mut router = router_with_workers(2);
        router.route("user-a").expect("route should succeed");
        router.route("user-b").expect("route should succeed");

        router.clear_assignment("user-a");
        assert_eq!(router.assignment_count(), 1);
        let decision = router.route("user-a").expect("route should succeed");
        assert!(decision.is_new_assignment);
    }

    #[test]
    fn export_import_round_trips_and_drops_orphans() {
        let mut router = router_with_workers(3);
        for index in 0..30 {
            router
                .route(&format!("user-{index}"))
                .expect("route should succeed");
        }

        let mut state = router.export_state();
        state
            .assignments
            .push(("ghost-user".to_owned(), "worker-99".to_owned()));

        let mut imported = StickyRouter::from_state(state);
        assert_eq!(imported.assignment_count(), router.assignment_count());
        assert!(imported.assigned_worker("ghost-user").is_none());

        for index in 0..30 {
            let user_id = format!("user-{index}");
            let original = router.route(&user_id).expect("route should succeed");
            let restored = imported.route(&user_id).expect("route should succeed");
            assert_eq!(restored.worker_id, original.worker_id);
            assert!(!restored.is_new_assignment);
        }
    }
}
