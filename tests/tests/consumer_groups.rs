//! Consumer group coordination: find-coordinator, the join/sync
//! rebalance flow, heartbeats, and offset commit/fetch.

use std::time::Duration;

use bytes::Bytes;
use integration_tests::client::TestClient;
use integration_tests::fixtures::unique_name;
use integration_tests::setup::TestBroker;

/// Polls FindCoordinator until the internal offsets topic is ready.
async fn wait_for_coordinator(client: &mut TestClient, group: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let response = client.find_coordinator(group, 0).await.unwrap();
        if response.error_code == 0 {
            assert_eq!(response.node_id, 1);
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "coordinator never became available (code {})",
            response.error_code
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_single_member_owns_all_partitions() {
    let broker = TestBroker::start().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();
    let topic = unique_name("t");
    let group = unique_name("g-single");
    client.create_topic_ready(&topic, 4, vec![]).await.unwrap();
    wait_for_coordinator(&mut client, &group).await;

    let join = client
        .join_group(&group, "", vec![("range", b"sub")], 10_000, 10_000)
        .await
        .unwrap();
    assert_eq!(join.error_code, 0);
    assert_eq!(join.leader, join.member_id);
    assert_eq!(join.members.len(), 1);
    let member_id = join.member_id.clone();

    // The leader computes and distributes the assignment.
    let assignment = Bytes::from_static(b"0,1,2,3");
    let sync = client
        .sync_group(
            &group,
            join.generation_id,
            &member_id,
            vec![(member_id.clone(), assignment.clone())],
        )
        .await
        .unwrap();
    assert_eq!(sync.error_code, 0);
    assert_eq!(sync.assignment, assignment);

    // Heartbeats for the current generation succeed; a stale generation
    // gets ILLEGAL_GENERATION (22).
    assert_eq!(
        client.heartbeat(&group, join.generation_id, &member_id).await.unwrap(),
        0
    );
    assert_eq!(
        client
            .heartbeat(&group, join.generation_id + 7, &member_id)
            .await
            .unwrap(),
        22
    );
    // An unknown member gets UNKNOWN_MEMBER_ID (25).
    assert_eq!(
        client
            .heartbeat(&group, join.generation_id, "ghost")
            .await
            .unwrap(),
        25
    );
}

#[tokio::test]
async fn test_two_member_rebalance() {
    let broker = TestBroker::start().await;
    let mut m1 = TestClient::connect(&broker.addr()).await.unwrap();
    let mut m2 = TestClient::connect(&broker.addr()).await.unwrap();
    let topic = unique_name("t");
    let group = unique_name("g-pair");
    m1.create_topic_ready(&topic, 4, vec![]).await.unwrap();
    wait_for_coordinator(&mut m1, &group).await;

    // Both members join concurrently; the coordinator parks the joins
    // until the rebalance window closes, then answers both.
    let group_a = group.clone();
    let group_b = group.clone();
    let (join1, join2) = tokio::join!(
        m1.join_group(&group_a, "", vec![("range", b"sub-1")], 10_000, 10_000),
        m2.join_group(&group_b, "", vec![("range", b"sub-2")], 10_000, 10_000),
    );
    let join1 = join1.unwrap();
    let join2 = join2.unwrap();
    assert_eq!(join1.error_code, 0);
    assert_eq!(join2.error_code, 0);
    assert_eq!(join1.generation_id, join2.generation_id);
    assert_eq!(join1.leader, join2.leader);

    let (leader_join, leader_client, follower_join, follower_client) =
        if join1.member_id == join1.leader {
            (&join1, &mut m1, &join2, &mut m2)
        } else {
            (&join2, &mut m2, &join1, &mut m1)
        };
    // Only the leader sees the member roster.
    assert_eq!(leader_join.members.len(), 2);
    assert!(follower_join.members.is_empty());

    let assignments = vec![
        (leader_join.member_id.clone(), Bytes::from_static(b"0,1")),
        (follower_join.member_id.clone(), Bytes::from_static(b"2,3")),
    ];
    let generation = leader_join.generation_id;

    let leader_member = leader_join.member_id.clone();
    let follower_member = follower_join.member_id.clone();
    let (leader_sync, follower_sync) = tokio::join!(
        leader_client.sync_group(&group, generation, &leader_member, assignments.clone()),
        follower_client.sync_group(&group, generation, &follower_member, vec![]),
    );
    let leader_sync = leader_sync.unwrap();
    let follower_sync = follower_sync.unwrap();
    assert_eq!(leader_sync.error_code, 0);
    assert_eq!(follower_sync.error_code, 0);
    assert_eq!(leader_sync.assignment, Bytes::from_static(b"0,1"));
    assert_eq!(follower_sync.assignment, Bytes::from_static(b"2,3"));
}

#[tokio::test]
async fn test_offset_commit_and_fetch() {
    let broker = TestBroker::start().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();
    let topic = unique_name("t");
    let group = unique_name("g-offsets");
    client.create_topic_ready(&topic, 1, vec![]).await.unwrap();
    wait_for_coordinator(&mut client, &group).await;

    // Simple-consumer commits (no generation) are allowed.
    let code = client
        .offset_commit(&group, -1, "", &topic, 0, 42)
        .await
        .unwrap();
    assert_eq!(code, 0);

    let fetched = client.offset_fetch(&group, &topic, 0).await.unwrap();
    assert_eq!(fetched.error_code, 0);
    assert_eq!(fetched.committed_offset, 42);

    // Upsert wins.
    client
        .offset_commit(&group, -1, "", &topic, 0, 99)
        .await
        .unwrap();
    let fetched = client.offset_fetch(&group, &topic, 0).await.unwrap();
    assert_eq!(fetched.committed_offset, 99);

    // An uncommitted partition reads back as -1.
    let other = unique_name("other");
    client.create_topic_ready(&other, 1, vec![]).await.unwrap();
    let fetched = client.offset_fetch(&group, &other, 0).await.unwrap();
    assert_eq!(fetched.committed_offset, -1);
}

#[tokio::test]
async fn test_leave_group_triggers_empty() {
    let broker = TestBroker::start().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();
    let group = unique_name("g-leave");
    wait_for_coordinator(&mut client, &group).await;

    let join = client
        .join_group(&group, "", vec![("range", b"sub")], 10_000, 10_000)
        .await
        .unwrap();
    assert_eq!(join.error_code, 0);

    assert_eq!(
        client.leave_group(&group, &join.member_id).await.unwrap(),
        0
    );
    // The departed member is no longer known.
    assert_eq!(
        client
            .heartbeat(&group, join.generation_id, &join.member_id)
            .await
            .unwrap(),
        25
    );
}
