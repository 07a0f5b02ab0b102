//! Transactional produce: commit and abort with read-committed isolation.

use std::time::Duration;

use integration_tests::client::{build_batch, TestClient, READ_COMMITTED, READ_UNCOMMITTED};
use integration_tests::fixtures::unique_name;
use integration_tests::setup::TestBroker;

async fn wait_for_txn_coordinator(client: &mut TestClient) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let response = client.find_coordinator("any", 1).await.unwrap();
        if response.error_code == 0 {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "transaction coordinator unavailable"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_commit_then_abort_isolation() {
    let broker = TestBroker::start().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();
    let topic = unique_name("t");
    let txn = unique_name("tx");
    client.create_topic_ready(&topic, 2, vec![]).await.unwrap();
    wait_for_txn_coordinator(&mut client).await;

    let init = client.init_producer_id(Some(&txn)).await.unwrap();
    assert_eq!(init.error_code, 0);
    let pid = init.producer_id;
    let epoch = init.producer_epoch;

    // Transaction 1: three records per partition, committed.
    let code = client
        .add_partitions_to_txn(&txn, pid, epoch, &topic, vec![0, 1])
        .await
        .unwrap();
    assert_eq!(code, 0);
    for partition in 0..2 {
        let batch = build_batch(
            &[("a", Some("1")), ("b", Some("2")), ("c", Some("3"))],
            pid,
            epoch,
            0,
            true,
        );
        let response = client
            .produce_raw(&topic, partition, batch, -1, Some(&txn))
            .await
            .unwrap();
        assert_eq!(response.error_code, 0);
        assert_eq!(response.base_offset, 0);
    }

    // Before the commit, read_committed consumers see nothing.
    let hidden = client
        .fetch_records(&topic, 0, 0, READ_COMMITTED)
        .await
        .unwrap();
    assert!(hidden.is_empty());

    assert_eq!(client.end_txn(&txn, pid, epoch, true).await.unwrap(), 0);

    for partition in 0..2 {
        let committed = client
            .fetch_records(&topic, partition, 0, READ_COMMITTED)
            .await
            .unwrap();
        assert_eq!(committed.len(), 3, "partition {partition}");
        assert_eq!(committed[0].offset, 0);
        assert_eq!(committed[2].offset, 2);
    }

    // Transaction 2: two more records per partition, aborted.
    let code = client
        .add_partitions_to_txn(&txn, pid, epoch, &topic, vec![0, 1])
        .await
        .unwrap();
    assert_eq!(code, 0);
    for partition in 0..2 {
        let batch = build_batch(&[("x", Some("9")), ("y", Some("8"))], pid, epoch, 3, true);
        let response = client
            .produce_raw(&topic, partition, batch, -1, Some(&txn))
            .await
            .unwrap();
        assert_eq!(response.error_code, 0);
        // After three records and a commit marker, the next batch starts
        // at offset 4.
        assert_eq!(response.base_offset, 4);
    }
    assert_eq!(client.end_txn(&txn, pid, epoch, false).await.unwrap(), 0);

    for partition in 0..2 {
        // read_committed never observes the aborted records.
        let committed = client
            .fetch_records(&topic, partition, 0, READ_COMMITTED)
            .await
            .unwrap();
        let values: Vec<_> = committed
            .iter()
            .map(|r| r.value.clone().unwrap())
            .collect();
        assert_eq!(values, vec!["1", "2", "3"], "partition {partition}");

        // read_uncommitted observes them; the markers themselves are
        // control records and never surface as application records.
        let uncommitted = client
            .fetch_records(&topic, partition, 0, READ_UNCOMMITTED)
            .await
            .unwrap();
        assert_eq!(uncommitted.len(), 5, "partition {partition}");
        assert_eq!(uncommitted[3].offset, 4);
        assert_eq!(uncommitted[4].offset, 5);

        // The markers occupy offsets on disk: LEO counts 5 data records
        // plus 2 control records.
        let latest = client.list_offset(&topic, partition, -1).await.unwrap();
        assert_eq!(latest.offset, 7);
    }
}

#[tokio::test]
async fn test_init_producer_id_fences_previous_instance() {
    let broker = TestBroker::start().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();
    let txn = unique_name("tx-fence");
    wait_for_txn_coordinator(&mut client).await;

    let first = client.init_producer_id(Some(&txn)).await.unwrap();
    assert_eq!(first.error_code, 0);

    let second = client.init_producer_id(Some(&txn)).await.unwrap();
    assert_eq!(second.error_code, 0);
    assert_eq!(second.producer_id, first.producer_id);
    assert_eq!(second.producer_epoch, first.producer_epoch + 1);

    // The fenced instance can no longer end transactions:
    // PRODUCER_FENCED (90).
    let code = client
        .end_txn(&txn, first.producer_id, first.producer_epoch, true)
        .await
        .unwrap();
    assert_eq!(code, 90);
}

#[tokio::test]
async fn test_idempotence_only_init_needs_no_txn_id() {
    let broker = TestBroker::start().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();
    wait_for_txn_coordinator(&mut client).await;

    let a = client.init_producer_id(None).await.unwrap();
    let b = client.init_producer_id(None).await.unwrap();
    assert_eq!(a.error_code, 0);
    assert_eq!(b.error_code, 0);
    assert_ne!(a.producer_id, b.producer_id);
    assert_eq!(a.producer_epoch, 0);
}
