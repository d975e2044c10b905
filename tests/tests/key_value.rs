use chordkv_integration_tests::{NetworkInvariants, TestHarness};
use futures::future::join_all;

#[tokio::test]
async fn test_put_get_round_trip_from_every_node() {
    let mut harness = TestHarness::new();
    harness.build_ring(&[10, 100, 200]).await.unwrap();

    let writer = harness.node(100).unwrap();
    writer.put("alpha", b"first".to_vec()).await.unwrap();
    writer.put("beta", b"second".to_vec()).await.unwrap();

    for node in harness.live_nodes() {
        assert_eq!(node.get("alpha").await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(node.get("beta").await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(node.get("gamma").await.unwrap(), None);
    }

    let violations = NetworkInvariants::check_key_ownership(&harness);
    assert!(violations.is_empty(), "{:?}", violations);
}

#[tokio::test]
async fn test_put_overwrites() {
    let mut harness = TestHarness::new();
    harness.build_ring(&[10, 100, 200]).await.unwrap();

    let node10 = harness.node(10).unwrap();
    let node200 = harness.node(200).unwrap();
    node10.put_id(150, b"old".to_vec()).await.unwrap();
    node200.put_id(150, b"new".to_vec()).await.unwrap();

    assert_eq!(node10.get_id(150).await.unwrap(), Some(b"new".to_vec()));
    assert_eq!(node200.key_count(), 1);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let mut harness = TestHarness::new();
    harness.build_ring(&[10, 100, 200]).await.unwrap();

    let node = harness.node(10).unwrap();
    node.put("x", b"1".to_vec()).await.unwrap();

    assert!(node.delete("x").await.unwrap());
    assert!(!node.delete("x").await.unwrap());
    assert_eq!(node.get("x").await.unwrap(), None);
    assert!(!node.delete("never-stored").await.unwrap());
}

#[tokio::test]
async fn test_join_moves_claimed_keys() {
    let mut harness = TestHarness::new();
    harness.build_ring(&[10, 200]).await.unwrap();

    let node10 = harness.node(10).unwrap();
    for key in [50, 105, 150, 250] {
        node10
            .put_id(key, key.to_string().into_bytes())
            .await
            .unwrap();
    }
    let node200 = harness.node(200).unwrap();
    assert_eq!(node200.local_keys(), vec![50, 105, 150]);

    let node100 = harness.join(100, 10).await.unwrap();

    // Moved, not copied
    assert_eq!(node100.local_keys(), vec![50]);
    assert_eq!(node200.local_keys(), vec![105, 150]);
    assert_eq!(node10.local_keys(), vec![250]);

    harness.wait_for_stabilization(20).await.unwrap();
    for node in harness.live_nodes() {
        assert_eq!(node.get_id(50).await.unwrap(), Some(b"50".to_vec()));
        assert_eq!(node.get_id(150).await.unwrap(), Some(b"150".to_vec()));
    }
}

#[tokio::test]
async fn test_back_to_back_joins_into_one_arc() {
    let mut harness = TestHarness::new();
    harness.build_ring(&[10, 100, 200]).await.unwrap();

    let node10 = harness.node(10).unwrap();
    for key in [30, 60, 80, 95] {
        node10.put_id(key, vec![key as u8]).await.unwrap();
    }

    // Both joiners find 100 as their successor before anyone stabilizes
    let node70 = harness.join(70, 10).await.unwrap();
    let node50 = harness.join(50, 10).await.unwrap();
    assert_eq!(node70.local_keys(), vec![30, 60]);
    assert!(node50.local_keys().is_empty());

    // 30 reaches 50 only through the notify handoff from 70
    harness.wait_for_stabilization(30).await.unwrap();
    assert_eq!(node50.local_keys(), vec![30]);
    assert_eq!(node70.local_keys(), vec![60]);
    assert_eq!(harness.node(100).unwrap().local_keys(), vec![80, 95]);

    let violations = NetworkInvariants::check_key_ownership(&harness);
    assert!(violations.is_empty(), "{:?}", violations);
    for node in harness.live_nodes() {
        assert_eq!(node.get_id(30).await.unwrap(), Some(vec![30]));
    }
}

#[tokio::test]
async fn test_keys_follow_ownership_as_ring_grows() {
    let mut harness = TestHarness::new();
    harness.create(128).await;

    let node128 = harness.node(128).unwrap();
    for key in (0..256).step_by(9) {
        node128.put_id(key, vec![key as u8]).await.unwrap();
    }

    for id in [20, 60, 90, 170, 230] {
        harness.join(id, 128).await.unwrap();
        harness.wait_for_stabilization(30).await.unwrap();
    }

    let violations = NetworkInvariants::check_key_ownership(&harness);
    assert!(violations.is_empty(), "{:?}", violations);
    assert_eq!(harness.stored_keys().len(), (0..256).step_by(9).count());
}

#[tokio::test]
async fn test_concurrent_puts_from_all_nodes() {
    let mut harness = TestHarness::new();
    harness.build_ring(&[10, 60, 100, 150, 200]).await.unwrap();

    let nodes = harness.live_nodes();
    let writes = (0..40u64).map(|key| {
        let node = nodes[key as usize % nodes.len()].clone();
        async move { node.put_id(key * 6, vec![key as u8]).await }
    });
    for result in join_all(writes).await {
        result.unwrap();
    }

    let reader = harness.node(150).unwrap();
    for key in 0..40u64 {
        assert_eq!(reader.get_id(key * 6).await.unwrap(), Some(vec![key as u8]));
    }
    assert!(NetworkInvariants::check_key_ownership(&harness).is_empty());
}
