//! Replicated-partition failover: a three-broker cluster loses the
//! partition leader and a new one takes over from the ISR without losing
//! any acknowledged record.

use std::time::Duration;

use broker_core::TopicPartition;
use integration_tests::client::{TestClient, READ_UNCOMMITTED};
use integration_tests::fixtures::unique_name;
use integration_tests::setup::TestCluster;

async fn wait_serving(client: &mut TestClient, topic: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let response = client
            .fetch(topic, 0, 0, 1024, READ_UNCOMMITTED, 0)
            .await
            .unwrap();
        if response.topics[0].partitions[0].error_code == 0 {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "partition never came up on this broker"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_leader_failover_preserves_acked_records() {
    let mut cluster = TestCluster::start(3).await;
    let topic = unique_name("t");
    let tp = TopicPartition::new(topic.clone(), 0);

    let mut admin = TestClient::connect(&cluster.addr(1)).await.unwrap();
    let code = admin.create_topic(&topic, 1, 3, vec![]).await.unwrap();
    assert_eq!(code, 0, "create topic");

    // Resolve the partition leader from cluster metadata.
    let leader = {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let metadata = admin.metadata(Some(vec![topic.clone()])).await.unwrap();
            let leader = metadata.topics[0]
                .partitions
                .first()
                .map(|p| p.leader_id)
                .unwrap_or(-1);
            if leader > 0 {
                break leader;
            }
            assert!(tokio::time::Instant::now() < deadline, "no leader elected");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };

    let mut producer = TestClient::connect(&cluster.addr(leader)).await.unwrap();
    wait_serving(&mut producer, &topic).await;

    // 100 records with acks=-1: each waits for the full ISR.
    for i in 0..100 {
        let key = format!("k{i}");
        let base = producer
            .produce(&topic, 0, &[(key.as_str(), Some("v"))])
            .await
            .unwrap();
        assert_eq!(base, i);
    }

    // Every replica reaches HWM 100.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let mut caught_up = 0;
        for id in cluster.live_broker_ids() {
            let handle = cluster.context(id).topics.partition(&tp).await.unwrap();
            if handle.shared().high_watermark() >= 100 {
                caught_up += 1;
            }
        }
        if caught_up == 3 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "replicas never caught up"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    cluster.kill(leader).await;

    // A survivor from the ISR takes over within the election window.
    let survivor = *cluster
        .live_broker_ids()
        .first()
        .expect("two survivors remain");
    let new_leader = {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
        loop {
            let current = cluster
                .context(survivor)
                .cluster
                .read(|state| state.leader_of(&tp));
            match current {
                Some(l) if l != leader => break l,
                _ => {
                    assert!(
                        tokio::time::Instant::now() < deadline,
                        "no new leader within the election window"
                    );
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    };
    assert_ne!(new_leader, leader);

    let mut producer = TestClient::connect(&cluster.addr(new_leader)).await.unwrap();
    wait_serving(&mut producer, &topic).await;
    for i in 100..150 {
        let key = format!("k{i}");
        producer
            .produce(&topic, 0, &[(key.as_str(), Some("v"))])
            .await
            .unwrap();
    }

    // No acknowledged record is lost: the new leader serves all 150 in
    // order.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut all = Vec::new();
        let mut cursor = 0i64;
        loop {
            let records = producer
                .fetch_records(&topic, 0, cursor, READ_UNCOMMITTED)
                .await
                .unwrap();
            if records.is_empty() {
                break;
            }
            cursor = records.last().unwrap().offset + 1;
            all.extend(records);
        }
        if all.len() >= 150 {
            for (i, record) in all.iter().enumerate() {
                assert_eq!(record.offset, i as i64);
                assert_eq!(record.key.as_deref(), Some(format!("k{i}").as_bytes()));
            }
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "only {} records visible after failover",
            all.len()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // The surviving follower's log end offset reaches 150 as well.
    let follower = cluster
        .live_broker_ids()
        .into_iter()
        .find(|&id| id != new_leader)
        .expect("one follower left");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let handle = cluster.context(follower).topics.partition(&tp).await.unwrap();
        if handle.shared().log_end_offset() >= 150 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "follower never replicated the post-failover records"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
