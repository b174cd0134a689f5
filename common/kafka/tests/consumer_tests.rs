use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common_kafka::test_utils::{records, wait_until, MockTransport, RecordingHandler};
use common_kafka::{Client, ClientOptions, ConsumerError, ErrorKind, Record, TransportError};

const WAIT: Duration = Duration::from_secs(2);

fn options() -> ClientOptions {
    ClientOptions::new()
        .with_client_id("consumer-tests")
        .with_poll_timeout(Duration::from_millis(20))
}

async fn connect(transport: &Arc<MockTransport>, options: ClientOptions) -> Client {
    Client::with_transport(transport.clone(), options)
        .await
        .expect("failed to build client")
}

fn error_collector(options: ClientOptions) -> (ClientOptions, Arc<Mutex<Vec<ErrorKind>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let options = options.with_on_error(move |e: &ConsumerError| {
        sink.lock().unwrap().push(e.kind());
    });
    (options, errors)
}

#[tokio::test]
async fn test_acknowledged_records_committed_once_in_order_before_close() {
    let transport = Arc::new(MockTransport::new());
    let client = connect(
        &transport,
        options()
            .with_manual_commit()
            .with_max_fetch_count(4)
            .with_commit_interval(Duration::from_secs(3600)),
    )
    .await;

    let ack = client.acknowledger().expect("manual commit enabled");
    let acknowledged = Arc::new(AtomicUsize::new(0));
    let handler_acknowledged = acknowledged.clone();
    client
        .add_subscription("orders", move |record: Record| {
            let ack = ack.clone();
            let acknowledged = handler_acknowledged.clone();
            async move {
                ack.acknowledge(record).await?;
                acknowledged.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
        .unwrap();
    client.start_consumer().unwrap();

    transport.push_records(records("orders", 10));
    assert!(
        wait_until(WAIT, || acknowledged.load(Ordering::SeqCst) == 10).await,
        "expected every record to be acknowledged"
    );

    client.close().await;

    let offsets = transport.committed_offsets();
    assert_eq!(offsets, (0..10).collect::<Vec<i64>>());
    assert_eq!(transport.commits().len(), 3);
}

#[tokio::test]
async fn test_full_batch_commits_without_waiting_for_interval() {
    let transport = Arc::new(MockTransport::new());
    let client = connect(
        &transport,
        options()
            .with_manual_commit()
            .with_commit_batch_size(3)
            .with_commit_interval(Duration::from_secs(3600)),
    )
    .await;

    client.acknowledge(records("orders", 3)).await.unwrap();

    assert!(wait_until(WAIT, || transport.commits().len() == 1).await);
    assert_eq!(transport.committed_offsets(), vec![0, 1, 2]);

    client.close().await;
    assert_eq!(transport.commits().len(), 1);
}

#[tokio::test]
async fn test_partial_batch_commits_after_interval() {
    let transport = Arc::new(MockTransport::new());
    let interval = Duration::from_millis(100);
    let client = connect(
        &transport,
        options()
            .with_manual_commit()
            .with_commit_batch_size(5)
            .with_commit_interval(interval),
    )
    .await;

    client.acknowledge(records("orders", 3)).await.unwrap();
    tokio::time::sleep(interval + Duration::from_millis(50)).await;

    let commits = transport.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].len(), 3);

    client.close().await;
}

#[tokio::test]
async fn test_subscription_receives_record_once_and_stops_after_removal() {
    let transport = Arc::new(MockTransport::new());
    let client = connect(&transport, options()).await;
    let handler = RecordingHandler::new();

    client.add_subscription("orders", handler.clone()).unwrap();
    client.start_consumer().unwrap();

    transport.push_records(vec![Record::new("orders", 0, 42)]);
    assert!(wait_until(WAIT, || handler.count() == 1).await);

    client.remove_subscription("orders").unwrap();
    assert!(transport.subscribed_topics().is_empty());

    transport.push_records(vec![Record::new("orders", 0, 43)]);
    let polls = transport.polls();
    assert!(wait_until(WAIT, || transport.polls() > polls + 1).await);

    assert_eq!(handler.offsets(), vec![42]);
    client.close().await;
}

#[tokio::test]
async fn test_poll_once_rejected_while_consumer_runs() {
    let transport = Arc::new(MockTransport::new());
    let client = connect(
        &transport,
        options().with_poll_timeout(Duration::from_millis(500)),
    )
    .await;

    client.start_consumer().unwrap();
    assert!(wait_until(WAIT, || transport.polls() == 1).await);

    let mut seen = 0;
    let err = client.poll_once(|_record| seen += 1).await.unwrap_err();

    assert!(matches!(err, ConsumerError::BackgroundConsumerActive));
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert_eq!(transport.polls(), 1);
    assert_eq!(seen, 0);

    let err = client.fetch_batch().await.unwrap_err();
    assert!(matches!(err, ConsumerError::BackgroundConsumerActive));

    client.close().await;
}

#[tokio::test]
async fn test_transient_poll_error_does_not_stop_consumer() {
    let transport = Arc::new(MockTransport::new());
    let (options, errors) = error_collector(options());
    let client = connect(&transport, options).await;
    let handler = RecordingHandler::new();

    client.add_subscription("orders", handler.clone()).unwrap();
    client.start_consumer().unwrap();

    transport.push_error(TransportError::Other("leader not available".into()));
    transport.push_records(records("orders", 2));

    assert!(wait_until(WAIT, || handler.count() == 2).await);
    assert_eq!(*errors.lock().unwrap(), vec![ErrorKind::TransientPoll]);

    client.close().await;
}

#[tokio::test]
async fn test_close_twice_closes_transport_once() {
    let transport = Arc::new(MockTransport::new());
    let client = connect(&transport, options().with_manual_commit()).await;
    client.start_consumer().unwrap();

    client.close().await;
    client.close().await;

    assert_eq!(transport.close_calls(), 1);
    assert_eq!(transport.last_allow_rebalance(), Some(true));
}

#[tokio::test]
async fn test_acknowledge_after_close_fails() {
    let transport = Arc::new(MockTransport::new());
    let client = connect(&transport, options().with_manual_commit()).await;
    let ack = client.acknowledger().unwrap();

    client.close().await;

    assert!(matches!(
        client.acknowledge(records("orders", 1)).await,
        Err(ConsumerError::ClientClosed)
    ));
    assert!(matches!(
        ack.acknowledge(Record::new("orders", 0, 0)).await,
        Err(ConsumerError::ClientClosed)
    ));
    assert!(transport.commits().is_empty());
}

#[tokio::test]
async fn test_terminal_closure_stops_consumer() {
    let transport = Arc::new(MockTransport::new());
    let client = connect(&transport, options()).await;
    let handler = RecordingHandler::new();
    client.add_subscription("orders", handler.clone()).unwrap();
    client.start_consumer().unwrap();

    transport.push_closed();
    transport.push_records(records("orders", 1));
    let polls_before = transport.polls();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(transport.polls() <= polls_before + 1);
    assert_eq!(handler.count(), 0);

    client.close().await;
}

#[tokio::test]
async fn test_static_subscriptions_dispatch_and_ignore_mutation() {
    let transport = Arc::new(MockTransport::new());
    let handler = RecordingHandler::new();
    let client = connect(
        &transport,
        options().with_subscription("orders", handler.clone()),
    )
    .await;

    let ignored = RecordingHandler::new();
    client.add_subscription("payments", ignored.clone()).unwrap();
    client.remove_subscription("orders").unwrap();
    assert_eq!(client.subscriptions(), vec!["orders".to_string()]);

    client.add_consume_topic("payments").unwrap();
    assert_eq!(
        transport.subscribed_topics(),
        vec!["orders".to_string(), "payments".to_string()]
    );

    client.start_consumer().unwrap();
    transport.push_records(vec![
        Record::new("payments", 0, 0),
        Record::new("orders", 0, 1),
    ]);

    assert!(wait_until(WAIT, || handler.count() == 1).await);
    assert_eq!(handler.offsets(), vec![1]);
    assert_eq!(ignored.count(), 0);

    client.close().await;
}

#[tokio::test]
async fn test_failing_handler_reported_and_consumer_continues() {
    let transport = Arc::new(MockTransport::new());
    let (options, errors) = error_collector(options().with_max_fetch_count(10));
    let client = connect(&transport, options).await;
    let failing = RecordingHandler::failing();
    let healthy = RecordingHandler::new();

    client.add_subscription("orders", failing.clone()).unwrap();
    client.add_subscription("payments", healthy.clone()).unwrap();
    client.start_consumer().unwrap();

    transport.push_records(vec![
        Record::new("orders", 0, 0),
        Record::new("payments", 0, 0),
    ]);

    assert!(wait_until(WAIT, || healthy.count() == 1).await);
    assert_eq!(failing.count(), 1);
    assert_eq!(*errors.lock().unwrap(), vec![ErrorKind::Handler]);

    client.close().await;
}

#[tokio::test]
async fn test_poll_once_without_background_consumer() {
    let transport = Arc::new(MockTransport::new());
    let client = connect(&transport, options().with_max_fetch_count(5)).await;
    transport.push_records(records("orders", 3));

    let mut offsets = vec![];
    client
        .poll_once(|record| offsets.push(record.offset()))
        .await
        .unwrap();
    assert_eq!(offsets, vec![0, 1, 2]);

    let mut calls = 0;
    client
        .poll_once_with_deadline(Duration::from_millis(20), |_record| calls += 1)
        .await
        .unwrap();
    assert_eq!(calls, 0);

    client.close().await;
    assert!(matches!(
        client.fetch_batch().await,
        Err(ConsumerError::ClientClosed)
    ));
}
