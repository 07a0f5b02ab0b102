//! End-to-end produce/fetch flow over the real wire protocol.

use bytes::Bytes;
use integration_tests::client::{TestClient, READ_UNCOMMITTED};
use integration_tests::fixtures::unique_name;
use integration_tests::setup::TestBroker;

#[tokio::test]
async fn test_create_produce_fetch() {
    let broker = TestBroker::start().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();
    let topic = unique_name("orders");

    // ApiVersions advertises every supported API.
    let versions = client.api_versions().await.unwrap();
    assert_eq!(versions.error_code, 0);
    assert!(versions.api_keys.len() >= 25);

    client.create_topic_ready(&topic, 1, vec![]).await.unwrap();

    let base = client
        .produce(&topic, 0, &[("a", Some("1")), ("b", Some("2"))])
        .await
        .unwrap();
    assert_eq!(base, 0);

    let records = client
        .fetch_records(&topic, 0, 0, READ_UNCOMMITTED)
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].offset, 0);
    assert_eq!(records[0].key.as_deref(), Some(b"a".as_slice()));
    assert_eq!(records[0].value.as_deref(), Some(b"1".as_slice()));
    assert_eq!(records[1].offset, 1);
    assert_eq!(records[1].key.as_deref(), Some(b"b".as_slice()));
    assert_eq!(records[1].value.as_deref(), Some(b"2".as_slice()));
    assert!(records[0].timestamp <= records[1].timestamp);

    // Metadata reflects the topic and its leader.
    let metadata = client.metadata(Some(vec![topic.clone()])).await.unwrap();
    assert_eq!(metadata.topics[0].error_code, 0);
    assert_eq!(metadata.topics[0].partitions[0].leader_id, 1);
    assert_eq!(metadata.controller_id, 1);
}

#[tokio::test]
async fn test_fetch_boundaries() {
    let broker = TestBroker::start().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();
    let topic = unique_name("bounds");
    client.create_topic_ready(&topic, 1, vec![]).await.unwrap();

    client
        .produce(&topic, 0, &[("a", Some("1")), ("b", Some("2"))])
        .await
        .unwrap();

    // Fetch at the log end offset: empty, no error.
    let response = client
        .fetch(&topic, 0, 2, 1 << 20, READ_UNCOMMITTED, 100)
        .await
        .unwrap();
    let p = &response.topics[0].partitions[0];
    assert_eq!(p.error_code, 0);
    assert_eq!(p.high_watermark, 2);
    assert!(p.records.is_none());

    // Beyond the log end offset: OFFSET_OUT_OF_RANGE (code 1).
    let response = client
        .fetch(&topic, 0, 3, 1 << 20, READ_UNCOMMITTED, 100)
        .await
        .unwrap();
    assert_eq!(response.topics[0].partitions[0].error_code, 1);

    // max_bytes smaller than the batch still returns the whole batch.
    let response = client
        .fetch(&topic, 0, 0, 1, READ_UNCOMMITTED, 100)
        .await
        .unwrap();
    let p = &response.topics[0].partitions[0];
    assert_eq!(p.error_code, 0);
    assert!(p.records.as_ref().is_some_and(|r| !r.is_empty()));
}

#[tokio::test]
async fn test_list_offsets_and_delete_records() {
    let broker = TestBroker::start().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();
    let topic = unique_name("offsets");
    client.create_topic_ready(&topic, 1, vec![]).await.unwrap();

    for i in 0..5 {
        let key = format!("k{i}");
        client
            .produce(&topic, 0, &[(key.as_str(), Some("v"))])
            .await
            .unwrap();
    }

    let earliest = client.list_offset(&topic, 0, -2).await.unwrap();
    assert_eq!(earliest.error_code, 0);
    assert_eq!(earliest.offset, 0);
    let latest = client.list_offset(&topic, 0, -1).await.unwrap();
    assert_eq!(latest.offset, 5);

    // An unknown partition is a per-partition error.
    let missing = client.list_offset(&topic, 9, -1).await.unwrap();
    assert_eq!(missing.error_code, 3);

    // DeleteRecords raises the log start offset without touching the end.
    let result = client.delete_records(&topic, 0, 3).await.unwrap();
    assert_eq!(result.error_code, 0);
    assert_eq!(result.low_watermark, 3);
    let earliest = client.list_offset(&topic, 0, -2).await.unwrap();
    assert_eq!(earliest.offset, 3);
    let latest = client.list_offset(&topic, 0, -1).await.unwrap();
    assert_eq!(latest.offset, 5);

    // Reads below the new start offset are out of range.
    let response = client
        .fetch(&topic, 0, 0, 1 << 20, READ_UNCOMMITTED, 100)
        .await
        .unwrap();
    assert_eq!(response.topics[0].partitions[0].error_code, 1);
}

#[tokio::test]
async fn test_produce_to_unknown_topic_fails_per_partition() {
    let broker = TestBroker::start().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();

    let batch = integration_tests::client::build_batch(&[("k", Some("v"))], -1, -1, -1, false);
    let response = client
        .produce_raw("nope", 0, batch, 1, None)
        .await
        .unwrap();
    // UNKNOWN_TOPIC_OR_PARTITION
    assert_eq!(response.error_code, 3);
    assert_eq!(response.base_offset, -1);
}

#[tokio::test]
async fn test_corrupt_batch_rejected() {
    let broker = TestBroker::start().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();
    let topic = unique_name("corrupt");
    client.create_topic_ready(&topic, 1, vec![]).await.unwrap();

    let batch = integration_tests::client::build_batch(&[("k", Some("v"))], -1, -1, -1, false);
    let mut corrupted = batch.to_vec();
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0xff;
    let response = client
        .produce_raw(&topic, 0, Bytes::from(corrupted), 1, None)
        .await
        .unwrap();
    // CORRUPT_MESSAGE
    assert_eq!(response.error_code, 2);

    // The log is untouched.
    let latest = client.list_offset(&topic, 0, -1).await.unwrap();
    assert_eq!(latest.offset, 0);
}
