//! Idempotent producer semantics: dedupe on resend, fencing on stale
//! epochs, out-of-order rejection.

use integration_tests::client::{build_batch, TestClient, READ_UNCOMMITTED};
use integration_tests::fixtures::unique_name;
use integration_tests::setup::TestBroker;

#[tokio::test]
async fn test_duplicate_batch_appends_once() {
    let broker = TestBroker::start().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();
    let topic = unique_name("dedupe");
    client.create_topic_ready(&topic, 1, vec![]).await.unwrap();

    // Fill the log so the idempotent batch lands at a non-zero offset.
    for i in 0..10 {
        let key = format!("fill{i}");
        client
            .produce(&topic, 0, &[(key.as_str(), Some("x"))])
            .await
            .unwrap();
    }

    let init = client.init_producer_id(None).await.unwrap();
    assert_eq!(init.error_code, 0);
    let pid = init.producer_id;
    assert!(pid >= 0);

    let batch = build_batch(
        &[("a", Some("1")), ("b", Some("2")), ("c", Some("3"))],
        pid,
        0,
        5,
        false,
    );
    let first = client
        .produce_raw(&topic, 0, batch.clone(), -1, None)
        .await
        .unwrap();
    assert_eq!(first.error_code, 0);
    assert_eq!(first.base_offset, 10);

    // The identical resend is acknowledged with the original offset and
    // appends nothing.
    let second = client.produce_raw(&topic, 0, batch, -1, None).await.unwrap();
    assert_eq!(second.error_code, 0);
    assert_eq!(second.base_offset, 10);

    let latest = client.list_offset(&topic, 0, -1).await.unwrap();
    assert_eq!(latest.offset, 13);

    let records = client
        .fetch_records(&topic, 0, 10, READ_UNCOMMITTED)
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].offset, 10);
    assert_eq!(records[2].offset, 12);
}

#[tokio::test]
async fn test_sequence_gap_rejected() {
    let broker = TestBroker::start().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();
    let topic = unique_name("gaps");
    client.create_topic_ready(&topic, 1, vec![]).await.unwrap();

    let pid = client.init_producer_id(None).await.unwrap().producer_id;

    let ok = client
        .produce_raw(&topic, 0, build_batch(&[("a", Some("1"))], pid, 0, 0, false), -1, None)
        .await
        .unwrap();
    assert_eq!(ok.error_code, 0);

    // Sequence jumps from 1 to 5: OUT_OF_ORDER_SEQUENCE_NUMBER (code 45).
    let gap = client
        .produce_raw(&topic, 0, build_batch(&[("b", Some("2"))], pid, 0, 5, false), -1, None)
        .await
        .unwrap();
    assert_eq!(gap.error_code, 45);

    // The expected next sequence still works.
    let next = client
        .produce_raw(&topic, 0, build_batch(&[("c", Some("3"))], pid, 0, 1, false), -1, None)
        .await
        .unwrap();
    assert_eq!(next.error_code, 0);
    assert_eq!(next.base_offset, 1);
}

#[tokio::test]
async fn test_stale_epoch_fenced() {
    let broker = TestBroker::start().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();
    let topic = unique_name("fence");
    client.create_topic_ready(&topic, 1, vec![]).await.unwrap();

    let pid = client.init_producer_id(None).await.unwrap().producer_id;

    let ok = client
        .produce_raw(&topic, 0, build_batch(&[("a", Some("1"))], pid, 3, 0, false), -1, None)
        .await
        .unwrap();
    assert_eq!(ok.error_code, 0);

    // A batch from an older epoch is a zombie: INVALID_PRODUCER_EPOCH (47).
    let stale = client
        .produce_raw(&topic, 0, build_batch(&[("b", Some("2"))], pid, 2, 1, false), -1, None)
        .await
        .unwrap();
    assert_eq!(stale.error_code, 47);
}
