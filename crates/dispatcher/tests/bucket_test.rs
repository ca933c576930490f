//! 分桶租约协调：单一所有权、接管与丢失通知

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use jobflow_core::config::BucketConfig;
use jobflow_domain::memory::{MemoryLeaseBackend, StaticMembership};
use jobflow_domain::messages::SchedulerMessage;
use jobflow_domain::LeaseBackend;
use jobflow_dispatcher::BucketCoordinator;

fn config() -> BucketConfig {
    BucketConfig {
        count: 16,
        lease_ttl_seconds: 30,
        renew_interval_seconds: 10,
        virtual_nodes: 160,
    }
}

fn coordinator(
    node: &str,
    backend: Arc<MemoryLeaseBackend>,
    membership: Arc<StaticMembership>,
) -> (
    BucketCoordinator,
    mpsc::UnboundedReceiver<SchedulerMessage>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let coordinator = BucketCoordinator::new(node.to_string(), config(), backend, membership, tx);
    (coordinator, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<SchedulerMessage>) -> Vec<SchedulerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

fn acquired_buckets(messages: &[SchedulerMessage]) -> HashSet<i32> {
    messages
        .iter()
        .filter_map(|m| match m {
            SchedulerMessage::BucketAcquired { bucket_id } => Some(*bucket_id),
            _ => None,
        })
        .collect()
}

// 两个节点共享一个租约后端，分桶所有权互不重叠且覆盖全部
#[tokio::test]
async fn two_nodes_own_disjoint_buckets_covering_all() {
    let backend = Arc::new(MemoryLeaseBackend::new());
    let membership = Arc::new(StaticMembership::new());
    membership
        .set_schedulers(vec!["node-a:18100".to_string(), "node-b:18100".to_string()])
        .await;

    let (mut a, mut a_rx) = coordinator("node-a:18100", backend.clone(), membership.clone());
    let (mut b, mut b_rx) = coordinator("node-b:18100", backend.clone(), membership.clone());

    a.rebalance().await.unwrap();
    b.rebalance().await.unwrap();

    let owned_a = a.owned_buckets().clone();
    let owned_b = b.owned_buckets().clone();
    assert!(owned_a.is_disjoint(&owned_b));
    let union: HashSet<i32> = owned_a.union(&owned_b).copied().collect();
    assert_eq!(union.len(), 16);

    // 通知与本地所有权一致
    assert_eq!(acquired_buckets(&drain(&mut a_rx)), owned_a);
    assert_eq!(acquired_buckets(&drain(&mut b_rx)), owned_b);

    // 租约后端与两边的本地视图一致
    for bucket in 0..16 {
        let owner = backend.current_owner(bucket).await.unwrap();
        let expected = if owned_a.contains(&bucket) {
            "node-a:18100"
        } else {
            "node-b:18100"
        };
        assert_eq!(owner, expected);
    }
}

// 前任租约未过期时不能抢占，过期后才能接管
#[tokio::test]
async fn takeover_waits_for_lease_expiry() {
    let backend = Arc::new(MemoryLeaseBackend::new());
    let membership = Arc::new(StaticMembership::new());
    membership
        .set_schedulers(vec!["node-a:18100".to_string()])
        .await;

    let (mut a, _a_rx) = coordinator("node-a:18100", backend.clone(), membership.clone());
    a.rebalance().await.unwrap();
    assert_eq!(a.owned_buckets().len(), 16);

    // a失联（不再续期也不释放），b按新视图认为所有桶都归自己
    membership
        .set_schedulers(vec!["node-b:18100".to_string()])
        .await;
    let (mut b, mut b_rx) = coordinator("node-b:18100", backend.clone(), membership.clone());
    b.rebalance().await.unwrap();
    assert!(b.owned_buckets().is_empty());
    assert!(drain(&mut b_rx).is_empty());

    // 租约到期后可以接管
    for bucket in 0..16 {
        backend.force_expire(bucket).await;
    }
    b.rebalance().await.unwrap();
    assert_eq!(b.owned_buckets().len(), 16);
    assert_eq!(acquired_buckets(&drain(&mut b_rx)).len(), 16);
}

// 续期发现租约被夺走时发出BucketLost
#[tokio::test]
async fn lost_lease_emits_bucket_lost_on_renew() {
    let backend = Arc::new(MemoryLeaseBackend::new());
    let membership = Arc::new(StaticMembership::new());
    membership
        .set_schedulers(vec!["node-a:18100".to_string()])
        .await;

    let (mut a, mut a_rx) = coordinator("node-a:18100", backend.clone(), membership.clone());
    a.rebalance().await.unwrap();
    drain(&mut a_rx);

    // 桶3的租约过期并被其他节点拿走
    backend.force_expire(3).await;
    backend
        .try_acquire(3, "node-b:18100", std::time::Duration::from_secs(30))
        .await
        .unwrap();

    a.renew_all().await;
    assert!(!a.owned_buckets().contains(&3));
    let lost: Vec<i32> = drain(&mut a_rx)
        .iter()
        .filter_map(|m| match m {
            SchedulerMessage::BucketLost { bucket_id } => Some(*bucket_id),
            _ => None,
        })
        .collect();
    assert_eq!(lost, vec![3]);
}

// 停机信道的发送端被丢弃时，协调循环退出并释放租约，而不是空转
#[tokio::test(start_paused = true)]
async fn dropped_shutdown_sender_stops_coordinator() {
    let backend = Arc::new(MemoryLeaseBackend::new());
    let membership = Arc::new(StaticMembership::new());
    membership
        .set_schedulers(vec!["node-a:18100".to_string()])
        .await;

    let (coordinator, _rx) = coordinator("node-a:18100", backend.clone(), membership.clone());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(coordinator.run(shutdown_rx));
    // 让首轮rebalance拿到全部租约
    tokio::time::sleep(std::time::Duration::from_secs(11)).await;
    assert!(backend.current_owner(0).await.is_some());

    drop(shutdown_tx);
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("协调循环应当退出")
        .unwrap();
    for bucket in 0..16 {
        assert_eq!(backend.current_owner(bucket).await, None);
    }
}

// 停机释放后另一个节点可以立即接管
#[tokio::test]
async fn release_all_frees_buckets_immediately() {
    let backend = Arc::new(MemoryLeaseBackend::new());
    let membership = Arc::new(StaticMembership::new());
    membership
        .set_schedulers(vec!["node-a:18100".to_string()])
        .await;

    let (mut a, _a_rx) = coordinator("node-a:18100", backend.clone(), membership.clone());
    a.rebalance().await.unwrap();
    a.release_all().await;
    assert!(a.owned_buckets().is_empty());

    membership
        .set_schedulers(vec!["node-b:18100".to_string()])
        .await;
    let (mut b, _b_rx) = coordinator("node-b:18100", backend.clone(), membership.clone());
    b.rebalance().await.unwrap();
    assert_eq!(b.owned_buckets().len(), 16);
}
