//! Fan-out and selection over a full session roster.
//!
//! Fan-out tests run on a paused clock: sleeps advance instantly, so elapsed
//! time shows how operations overlapped.

use std::time::Duration;

use tbm_core::NodeDescriptor;
use tbm_monitor::{
    from_fn, MonitorConfig, MonitorError, Node, NodeCollection, OperationFuture, Selector, Session,
};
use tokio::time::{sleep, Instant};

fn session() -> Session {
    let roster = vec![
        NodeDescriptor::new("fast", "telosb", "1", "01.00"),
        NodeDescriptor::new("slow", "telosb", "2", "02.00"),
        NodeDescriptor::new("broken", "telosb", "3", "03.00"),
    ];
    Session::new(MonitorConfig::default(), roster).unwrap()
}

fn nap(node: Node) -> OperationFuture<u64> {
    Box::pin(async move {
        let millis = match node.gid().as_str() {
            "fast" => 100,
            "slow" => 300,
            _ => 200,
        };
        sleep(Duration::from_millis(millis)).await;
        if node.gid().as_str() == "broken" {
            return Err(MonitorError::Action {
                action: "nap".to_string(),
                node: node.to_string(),
                reason: "node refused".to_string(),
            });
        }
        Ok(millis)
    })
}

#[tokio::test(start_paused = true)]
async fn test_parallel_takes_as_long_as_the_slowest_node() {
    let session = session();
    let start = Instant::now();

    let results = session.nodes().run_parallel(from_fn("nap", nap)).await;

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(600), "ran sequentially: {elapsed:?}");

    assert_eq!(results.len(), 3);
    assert_eq!(*results.by_gid("fast").unwrap().as_ref().unwrap(), 100);
    assert_eq!(*results.by_gid("slow").unwrap().as_ref().unwrap(), 300);
    assert!(matches!(
        results.by_gid("broken").unwrap(),
        Err(MonitorError::Action { .. })
    ));
    assert!(!results.all_ok());
    assert_eq!(results.failed().count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_adds_up() {
    let session = session();
    let start = Instant::now();

    let results = session.nodes().run_sequential(&from_fn("nap", nap)).await;

    assert!(start.elapsed() >= Duration::from_millis(600));
    assert_eq!(results.succeeded().count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_progress_callback_sees_every_node() {
    let session = session();
    let mut seen = Vec::new();

    session
        .nodes()
        .run_parallel_with(from_fn("nap", nap), 3, |node, result| {
            seen.push((node.gid().to_string(), result.is_ok()));
        })
        .await;

    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("broken".to_string(), false),
            ("fast".to_string(), true),
            ("slow".to_string(), true),
        ]
    );
}

// ============================================================================
// Selection
// ============================================================================

fn mixed_session() -> Session {
    let roster = vec![
        NodeDescriptor::new("a1", "telosb", "1", "0001").at_line(1),
        NodeDescriptor::new("a2", "telosb", "2", "0002").at_line(2),
        NodeDescriptor::new("a3", "other", "3", "0003").at_line(3),
    ];
    Session::new(MonitorConfig::default(), roster).unwrap()
}

fn gids(nodes: &NodeCollection) -> Vec<String> {
    nodes.iter().map(|node| node.gid().to_string()).collect()
}

#[test]
fn test_select_and_ping_one_node() {
    let session = mixed_session();

    let selector = Selector::new()
        .glob("type", "telosb*")
        .unwrap()
        .glob("gid", "a*")
        .unwrap();
    let telosb = session.nodes().select(&selector);
    assert_eq!(gids(&telosb), vec!["a1", "a2"]);

    session
        .bus()
        .dispatch("1400000000000 10.0.0.1:5000 TELOSB a1 {pos=0}");

    assert!(session.node("a1").unwrap().is_online());
    assert!(!session.node("a2").unwrap().is_online());
    assert!(!session.node("a3").unwrap().is_online());
}

#[test]
fn test_chained_selection_matches_direct_filter() {
    let session = mixed_session();
    let all = session.nodes();
    let telosb = all.select(&Selector::new().glob("type", "telosb*").unwrap());

    for gid in ["a1", "a2", "a3", "a4"] {
        let chained = telosb.select(&Selector::new().exact("gid", gid));
        let direct = all.filter(|node| {
            node.descriptor().type_name.starts_with("telosb") && node.gid().as_str() == gid
        });
        assert_eq!(gids(&chained), gids(&direct), "gid {gid}");
    }
}
