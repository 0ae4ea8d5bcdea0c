//! Node collections and fan-out execution.
//!
//! A `NodeCollection` is an ordered set of node handles: duplicates are
//! dropped and nodes are kept sorted by their display name. Selections and
//! set operations return new collections.
//!
//! Any `NodeOperation` can be run over a collection:
//!
//! - sequentially, one node at a time in collection order
//! - in parallel, one task per node, optionally bounded by a semaphore
//!
//! Both report one `Result` per node in a `FanOut`. A failing node never
//! stops the others, and a task that panics is reported as `TaskFailed` for
//! its node.

mod operation;
mod selector;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::error::{MonitorError, Result};
use crate::node::Node;

pub use operation::{from_fn, FnOperation, NodeCommand, NodeOperation, OperationFuture, Outcome};
pub use selector::{Matcher, Selector};

// ============================================================================
// Fan-out Results
// ============================================================================

/// One result per node, in collection order.
#[derive(Debug)]
pub struct FanOut<T> {
    entries: Vec<(Node, Result<T>)>,
}

impl<T> FanOut<T> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, node: &Node) -> Option<&Result<T>> {
        self.entries
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, result)| result)
    }

    pub fn by_gid(&self, gid: &str) -> Option<&Result<T>> {
        self.entries
            .iter()
            .find(|(n, _)| n.gid().as_str() == gid)
            .map(|(_, result)| result)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Node, &Result<T>)> {
        self.entries.iter().map(|(node, result)| (node, result))
    }

    pub fn succeeded(&self) -> impl Iterator<Item = (&Node, &T)> {
        self.entries
            .iter()
            .filter_map(|(node, result)| result.as_ref().ok().map(|value| (node, value)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&Node, &MonitorError)> {
        self.entries
            .iter()
            .filter_map(|(node, result)| result.as_ref().err().map(|err| (node, err)))
    }

    pub fn all_ok(&self) -> bool {
        self.entries.iter().all(|(_, result)| result.is_ok())
    }
}

impl<T> IntoIterator for FanOut<T> {
    type Item = (Node, Result<T>);
    type IntoIter = std::vec::IntoIter<(Node, Result<T>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

// ============================================================================
// Node Collection
// ============================================================================

/// Ordered, duplicate-free group of nodes.
#[derive(Debug, Clone, Default)]
pub struct NodeCollection {
    nodes: Vec<Node>,
}

impl NodeCollection {
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut seen = HashSet::new();
        let mut keyed: Vec<(String, Node)> = nodes
            .into_iter()
            .filter(|node| seen.insert(node.clone()))
            .map(|node| (node.to_string(), node))
            .collect();
        keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
        Self {
            nodes: keyed.into_iter().map(|(_, node)| node).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.nodes.contains(node)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    /// Nodes matching every criterion of `selector`.
    pub fn select(&self, selector: &Selector) -> Self {
        self.filter(|node| selector.matches(node))
    }

    /// Nodes whose display name (`gid@host`) matches a wildcard.
    pub fn matching(&self, pattern: &str) -> Result<Self> {
        let matcher = Matcher::glob(pattern)?;
        Ok(self.filter(|node| matcher.matches(&node.to_string())))
    }

    pub fn filter(&self, predicate: impl Fn(&Node) -> bool) -> Self {
        Self::new(self.nodes.iter().filter(|node| predicate(node)).cloned())
    }

    /// Nodes in either collection.
    pub fn union(&self, other: &Self) -> Self {
        Self::new(self.nodes.iter().chain(other.nodes.iter()).cloned())
    }

    /// Nodes in this collection but not in `other`.
    pub fn difference(&self, other: &Self) -> Self {
        self.filter(|node| !other.contains(node))
    }

    // ------------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------------

    /// Runs `op` on each node in turn.
    pub async fn run_sequential<O>(&self, op: &O) -> FanOut<O::Output>
    where
        O: NodeOperation,
    {
        let mut entries = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let result = op.run(node).await;
            report(op.name(), node, &result);
            entries.push((node.clone(), result));
        }
        FanOut { entries }
    }

    /// Runs `op` on every node at once and waits for all of them.
    pub async fn run_parallel<O>(&self, op: O) -> FanOut<O::Output>
    where
        O: NodeOperation + 'static,
        O::Output: 'static,
    {
        self.run_parallel_bounded(op, self.nodes.len()).await
    }

    /// Runs `op` on every node with at most `limit` running at a time.
    pub async fn run_parallel_bounded<O>(&self, op: O, limit: usize) -> FanOut<O::Output>
    where
        O: NodeOperation + 'static,
        O::Output: 'static,
    {
        self.run_parallel_with(op, limit, |_, _| {}).await
    }

    /// Like `run_parallel_bounded`, reporting each result as it completes.
    pub async fn run_parallel_with<O, F>(
        &self,
        op: O,
        limit: usize,
        mut on_complete: F,
    ) -> FanOut<O::Output>
    where
        O: NodeOperation + 'static,
        O::Output: 'static,
        F: FnMut(&Node, &Result<O::Output>),
    {
        let count = self.nodes.len();
        let op = Arc::new(op);
        let permits = Arc::new(Semaphore::new(limit.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        debug!(operation = op.name(), nodes = count, limit, "Starting parallel fan-out");

        let mut handles = Vec::with_capacity(count);
        for (index, node) in self.nodes.iter().cloned().enumerate() {
            let op = Arc::clone(&op);
            let permits = Arc::clone(&permits);
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let result = op.run(&node).await;
                let _ = tx.send((index, result));
            }));
        }
        drop(tx);

        let mut results: Vec<Option<Result<O::Output>>> = (0..count).map(|_| None).collect();
        while let Some((index, result)) = rx.recv().await {
            if let (Some(node), Some(slot)) = (self.nodes.get(index), results.get_mut(index)) {
                report(op.name(), node, &result);
                on_complete(node, &result);
                *slot = Some(result);
            }
        }

        // Senders are gone, so every task has ended; a missing result means
        // the task panicked or was cancelled.
        for ((handle, slot), node) in handles.into_iter().zip(results.iter_mut()).zip(&self.nodes) {
            if slot.is_some() {
                continue;
            }
            let reason = match handle.await {
                Err(e) if e.is_panic() => "task panicked".to_string(),
                Err(e) => e.to_string(),
                Ok(()) => "task ended without a result".to_string(),
            };
            let result = Err(MonitorError::TaskFailed {
                node: node.to_string(),
                reason,
            });
            report(op.name(), node, &result);
            on_complete(node, &result);
            *slot = Some(result);
        }

        let entries = self
            .nodes
            .iter()
            .cloned()
            .zip(results)
            .filter_map(|(node, result)| result.map(|result| (node, result)))
            .collect();
        FanOut { entries }
    }
}

fn report<T>(operation: &str, node: &Node, result: &Result<T>) {
    match result {
        Ok(_) => debug!(node = %node, operation, "Operation finished"),
        Err(e) => warn!(node = %node, operation, error = %e, "Operation failed"),
    }
}

impl<'a> IntoIterator for &'a NodeCollection {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

impl FromIterator<Node> for NodeCollection {
    fn from_iter<I: IntoIterator<Item = Node>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::node::tests::context;
    use tbm_core::NodeDescriptor;

    fn nodes(bus: &EventBus, gids: &[&str]) -> Vec<Node> {
        gids.iter()
            .map(|gid| {
                Node::new(NodeDescriptor::new(*gid, "telosb", "1", "0001"), context(bus)).unwrap()
            })
            .collect()
    }

    fn gids(collection: &NodeCollection) -> Vec<String> {
        collection.iter().map(|n| n.gid().to_string()).collect()
    }

    #[test]
    fn test_sorted_and_deduplicated() {
        let bus = EventBus::new();
        let all = nodes(&bus, &["c", "a", "b"]);
        let mut input = all.clone();
        input.push(all[0].clone());

        let collection = NodeCollection::new(input);
        assert_eq!(gids(&collection), ["a", "b", "c"]);
    }

    #[test]
    fn test_union_and_difference() {
        let bus = EventBus::new();
        let all = nodes(&bus, &["a", "b", "c"]);
        let ab = NodeCollection::new(all[..2].to_vec());
        let bc = NodeCollection::new(all[1..].to_vec());

        assert_eq!(gids(&ab.union(&bc)), ["a", "b", "c"]);
        assert_eq!(gids(&ab.difference(&bc)), ["a"]);
        assert!(ab.difference(&ab).is_empty());
    }

    #[test]
    fn test_matching_display_name() {
        let bus = EventBus::new();
        let collection = NodeCollection::new(nodes(&bus, &["a1", "a2", "b1"]));

        assert_eq!(gids(&collection.matching("a*@?").unwrap()), ["a1", "a2"]);
        assert!(collection.matching("[").is_err());
    }

    #[tokio::test]
    async fn test_sequential_runs_in_order() {
        let bus = EventBus::new();
        let collection = NodeCollection::new(nodes(&bus, &["b", "a"]));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let seen = Arc::clone(&order);
        let op = from_fn("record", move |node: Node| -> OperationFuture<()> {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                seen.lock().push(node.gid().to_string());
                Ok(())
            })
        });

        let results = collection.run_sequential(&op).await;
        assert_eq!(results.len(), 2);
        assert_eq!(order.lock().as_slice(), ["a", "b"]);
    }

    #[tokio::test]
    async fn test_parallel_reports_every_node() {
        let bus = EventBus::new();
        let collection = NodeCollection::new(nodes(&bus, &["a", "b", "c"]));

        let op = from_fn("maybe_fail", |node: Node| -> OperationFuture<usize> {
            Box::pin(async move {
                if node.gid().as_str() == "b" {
                    Err(MonitorError::NodeUnseen { gid: node.gid().clone() })
                } else {
                    Ok(node.gid().as_str().len())
                }
            })
        });

        let mut completed = 0;
        let results = collection
            .run_parallel_with(op, 2, |_, _| completed += 1)
            .await;

        assert_eq!(completed, 3);
        assert_eq!(results.len(), 3);
        assert_eq!(results.succeeded().count(), 2);
        assert!(matches!(
            results.by_gid("b"),
            Some(Err(MonitorError::NodeUnseen { .. }))
        ));
        assert!(!results.all_ok());
    }

    #[tokio::test]
    async fn test_panicking_task_reported() {
        let bus = EventBus::new();
        let collection = NodeCollection::new(nodes(&bus, &["a", "b"]));

        let op = from_fn("panics", |node: Node| -> OperationFuture<()> {
            Box::pin(async move {
                if node.gid().as_str() == "a" {
                    panic!("boom");
                }
                Ok(())
            })
        });

        let results = collection.run_parallel(op).await;
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results.by_gid("a"),
            Some(Err(MonitorError::TaskFailed { .. }))
        ));
        assert!(matches!(results.by_gid("b"), Some(Ok(()))));
    }

    #[tokio::test]
    async fn test_empty_collection() {
        let collection = NodeCollection::default();
        let results = collection.run_parallel(NodeCommand::IsOnline).await;
        assert!(results.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_parallelism() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        let bus = EventBus::new();
        let collection = NodeCollection::new(nodes(&bus, &["a", "b", "c", "d"]));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let op = from_fn("slow", move |_node: Node| -> OperationFuture<()> {
            let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
            Box::pin(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let results = collection.run_parallel_bounded(op, 2).await;
        assert!(results.all_ok());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
