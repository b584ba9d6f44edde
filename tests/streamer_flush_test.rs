mod common;

use std::sync::Arc;
use std::time::Duration;

use bulkdb::{ItemOperation, PartitionKey, StatusCode};
use common::{dispatcher_with, memory_backend, test_config, ScriptedTransport};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_five_creates_make_two_requests() {
    let router = memory_backend(1);
    let transport = Arc::new(ScriptedTransport::new(StatusCode::CREATED));
    let config = test_config()
        .with_request_limits(3, 100_000)
        .with_flush_interval(Duration::from_millis(100));
    let dispatcher = dispatcher_with(transport.clone(), router, config, false);
    let cancel = CancellationToken::new();

    let mut pending = Vec::new();
    for i in 0..5 {
        let op = ItemOperation::create(PartitionKey::from("p"), json!({ "id": i.to_string() }));
        pending.push(dispatcher.add(op, None, &cancel).await.unwrap());
    }

    let mut resolved = 0;
    for result in pending {
        assert_eq!(result.await.unwrap().status, StatusCode::CREATED);
        resolved += 1;
    }

    assert_eq!(resolved, 5);
    assert_eq!(transport.request_sizes(), vec![3, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_idle_timer_sends_nothing() {
    let router = memory_backend(1);
    let transport = Arc::new(ScriptedTransport::new(StatusCode::OK));
    let dispatcher = dispatcher_with(
        transport.clone(),
        router,
        test_config().with_flush_interval(Duration::from_millis(5)),
        false,
    );
    let cancel = CancellationToken::new();

    dispatcher
        .execute(ItemOperation::read("a", PartitionKey::from("p")), None, &cancel)
        .await
        .unwrap();
    assert_eq!(transport.request_sizes(), vec![1]);

    // Many ticks with an empty batcher.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.request_sizes(), vec![1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_rotate_exactly_once() {
    const TASKS: usize = 16;

    let router = memory_backend(1);
    let transport = Arc::new(ScriptedTransport::new(StatusCode::OK));
    let config = test_config()
        .with_request_limits(TASKS / 2, 1_000_000)
        .with_flush_interval(Duration::from_secs(3600));
    let dispatcher = dispatcher_with(transport.clone(), router, config, false);

    let mut admissions = Vec::new();
    for i in 0..TASKS {
        let dispatcher = dispatcher.clone();
        admissions.push(tokio::spawn(async move {
            let op = ItemOperation::read(format!("item-{}", i), PartitionKey::from("same"));
            dispatcher.add(op, None, &CancellationToken::new()).await
        }));
    }

    let mut pending = Vec::new();
    for admission in admissions {
        pending.push(admission.await.unwrap().unwrap());
    }
    dispatcher.flush();

    for result in pending {
        assert_eq!(result.await.unwrap().status, StatusCode::OK);
    }

    let sizes = transport.request_sizes();
    assert_eq!(sizes, vec![TASKS / 2, TASKS / 2]);
}

#[tokio::test(start_paused = true)]
async fn test_ranges_batch_independently() {
    let router = memory_backend(4);
    let transport = Arc::new(ScriptedTransport::new(StatusCode::OK));
    let dispatcher = dispatcher_with(transport.clone(), router.clone(), test_config(), false);
    let cancel = CancellationToken::new();

    let mut pending = Vec::new();
    for i in 0..40 {
        let op = ItemOperation::read("x", PartitionKey::from(format!("key-{}", i)));
        pending.push(dispatcher.add(op, None, &cancel).await.unwrap());
    }
    for result in pending {
        result.await.unwrap();
    }

    let requests = transport.requests.lock().clone();
    let total: usize = requests.iter().map(|(_, n)| n).sum();
    assert_eq!(total, 40);

    let mut ranges: Vec<_> = requests.iter().map(|(r, _)| r.clone()).collect();
    ranges.sort();
    ranges.dedup();
    assert_eq!(ranges.len(), requests.len(), "one request per range");
    assert_eq!(dispatcher.active_ranges().len(), ranges.len());
}
