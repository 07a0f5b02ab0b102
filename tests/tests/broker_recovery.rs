//! Crash-recovery behavior across a broker restart: acknowledged writes
//! survive, offsets and group state are replayed from disk.

use integration_tests::client::{TestClient, READ_UNCOMMITTED};
use integration_tests::fixtures::unique_name;
use integration_tests::setup::TestBroker;

#[tokio::test]
async fn test_acked_writes_survive_restart() {
    let broker = TestBroker::start().await;
    let topic = unique_name("durable");
    {
        let mut client = TestClient::connect(&broker.addr()).await.unwrap();
        client.create_topic_ready(&topic, 1, vec![]).await.unwrap();
        for i in 0..20 {
            let key = format!("k{i}");
            client
                .produce(&topic, 0, &[(key.as_str(), Some("v"))])
                .await
                .unwrap();
        }
        let latest = client.list_offset(&topic, 0, -1).await.unwrap();
        assert_eq!(latest.offset, 20);
    }

    let broker = broker.restart().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();

    // Wait for leadership to re-establish after restart.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let latest = client.list_offset(&topic, 0, -1).await.unwrap();
        if latest.error_code == 0 {
            assert_eq!(latest.offset, 20);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "leadership never recovered");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    // Every acknowledged record is present, in order, with no gaps.
    let records = client
        .fetch_records(&topic, 0, 0, READ_UNCOMMITTED)
        .await
        .unwrap();
    assert_eq!(records.len(), 20);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.offset, i as i64);
        assert_eq!(record.key.as_deref(), Some(format!("k{i}").as_bytes()));
    }

    // The restarted broker keeps assigning offsets where it left off.
    let base = client.produce(&topic, 0, &[("after", Some("restart"))]).await.unwrap();
    assert_eq!(base, 20);
}

#[tokio::test]
async fn test_committed_offsets_survive_restart() {
    let broker = TestBroker::start().await;
    let topic = unique_name("t");
    let group = unique_name("g-durable");
    {
        let mut client = TestClient::connect(&broker.addr()).await.unwrap();
        client.create_topic_ready(&topic, 1, vec![]).await.unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(15);
        loop {
            let response = client.find_coordinator(&group, 0).await.unwrap();
            if response.error_code == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        let code = client
            .offset_commit(&group, -1, "", &topic, 0, 17)
            .await
            .unwrap();
        assert_eq!(code, 0);
    }

    let broker = broker.restart().await;
    let mut client = TestClient::connect(&broker.addr()).await.unwrap();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(15);
    loop {
        let response = client.find_coordinator(&group, 0).await.unwrap();
        if response.error_code == 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "coordinator never recovered");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    // The commit was replayed from the offsets partition.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let fetched = client.offset_fetch(&group, &topic, 0).await.unwrap();
        if fetched.error_code == 0 && fetched.committed_offset == 17 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "committed offset not recovered (code {}, offset {})",
            fetched.error_code,
            fetched.committed_offset
        );
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}
