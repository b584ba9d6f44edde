mod common;

use bulkdb::transport::{BatchHeaders, RequestTarget};
use bulkdb::{Error, Fault, ItemRequestOptions, PartitionKey, StatusCode, SubStatusCode};
use bytes::Bytes;
use common::{memory_client, test_config};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_commit_applies_every_operation() {
    let (client, backend) = memory_client(4, test_config());
    let orders = client.container("orders");
    let cancel = CancellationToken::new();

    orders
        .create_item("order-1", json!({ "id": "line-1", "qty": 1 }), &cancel)
        .await
        .unwrap();

    let mut batch = orders.transactional_batch("order-1");
    batch
        .create(json!({ "id": "header", "total": 10 }))
        .replace("line-1", json!({ "id": "line-1", "qty": 2 }))
        .patch("header", json!([{ "op": "set", "path": "/total", "value": 12 }]))
        .read("header");
    assert_eq!(batch.len(), 4);

    let response = batch.execute(None, &cancel).await.unwrap();
    assert!(response.is_success());
    assert_eq!(response.status, StatusCode::OK);
    assert!(!response.activity_id.is_empty());
    assert!(response.request_charge > 0.0);

    let statuses: Vec<StatusCode> = response.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![StatusCode::CREATED, StatusCode::OK, StatusCode::OK, StatusCode::OK]
    );
    let header: Value = response.get(3).unwrap().resource().unwrap().unwrap();
    assert_eq!(header["total"], 12);

    let pk = PartitionKey::from("order-1");
    assert_eq!(
        backend.item(orders.id(), &pk, "line-1"),
        Some(json!({ "id": "line-1", "qty": 2 }))
    );

    let last = backend.requests().pop().unwrap();
    assert_eq!(last.headers, BatchHeaders::transactional());
    assert!(!last.headers.continue_on_error);
    assert_eq!(last.target, RequestTarget::PartitionKey(pk.to_json()));
    assert_eq!(last.operation_count, 4);
}

#[tokio::test]
async fn test_failure_rolls_back_and_marks_dependencies() {
    let (client, backend) = memory_client(1, test_config());
    let orders = client.container("orders");
    let cancel = CancellationToken::new();

    orders
        .create_item("o", json!({ "id": "exists" }), &cancel)
        .await
        .unwrap();

    let mut batch = orders.transactional_batch("o");
    batch
        .create(json!({ "id": "new" }))
        .create(json!({ "id": "exists" }))
        .delete("exists");
    let response = batch.execute(None, &cancel).await.unwrap();

    assert!(!response.is_success());
    assert_eq!(response.status, StatusCode::CONFLICT);
    let statuses: Vec<u16> = response.iter().map(|r| r.status.as_raw()).collect();
    assert_eq!(statuses, vec![424, 409, 424]);

    // Nothing from the batch was applied.
    let pk = PartitionKey::from("o");
    assert_eq!(backend.item(orders.id(), &pk, "new"), None);
    assert!(backend.item(orders.id(), &pk, "exists").is_some());
}

#[tokio::test]
async fn test_per_item_etag_is_honoured() {
    let (client, _backend) = memory_client(1, test_config());
    let orders = client.container("orders");
    let cancel = CancellationToken::new();

    let created = orders
        .create_item("o", json!({ "id": "a", "v": 1 }), &cancel)
        .await
        .unwrap();
    let etag = created.etag.clone().unwrap();

    let mut stale = orders.transactional_batch("o");
    stale
        .replace("a", json!({ "id": "a", "v": 2 }))
        .with_item_options(ItemRequestOptions {
            if_match_etag: Some("\"stale\"".into()),
            ..Default::default()
        });
    let response = stale.execute(None, &cancel).await.unwrap();
    assert_eq!(response.status, StatusCode::PRECONDITION_FAILED);

    let mut fresh = orders.transactional_batch("o");
    fresh
        .replace("a", json!({ "id": "a", "v": 2 }))
        .with_item_options(ItemRequestOptions {
            if_match_etag: Some(etag),
            minimal_response: Some(true),
            ..Default::default()
        });
    let response = fresh.execute(None, &cancel).await.unwrap();
    assert!(response.is_success());
    assert!(response.get(0).unwrap().resource_body.is_none());
}

#[tokio::test]
async fn test_validation_happens_before_sending() {
    let (client, backend) = memory_client(1, test_config());
    let orders = client.container("orders");
    let cancel = CancellationToken::new();

    let err = orders
        .transactional_batch("o")
        .execute(None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidBatch(_)));

    let mut batch = orders.transactional_batch("o");
    batch.create(json!({ "id": "a" }));
    let options = ItemRequestOptions {
        if_none_match_etag: Some("*".into()),
        ..Default::default()
    };
    let err = batch.execute(Some(options), &cancel).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedOption(_)));

    let mut batch = orders.transactional_batch("o");
    batch
        .create(json!({ "id": "a" }))
        .with_item_options(ItemRequestOptions {
            effective_partition_key: Some(Bytes::from_static(b"\x01\x02")),
            ..Default::default()
        });
    let err = batch.execute(None, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));

    let mut batch = orders.transactional_batch("o");
    batch.read("a");
    cancel.cancel();
    let err = batch.execute(None, &cancel).await.unwrap_err();
    assert_eq!(err, Error::Cancelled);

    assert_eq!(backend.request_count(), 0);
}

#[tokio::test]
async fn test_batch_over_the_request_limit_is_rejected() {
    let (client, backend) = memory_client(1, test_config().with_request_limits(100, 400));
    let mut batch = client.container("orders").transactional_batch("o");
    for i in 0..10 {
        batch.create(json!({ "id": format!("item-{}", i), "pad": "z".repeat(40) }));
    }

    let err = batch
        .execute(None, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        Error::BatchTooLarge { packed, total } => {
            assert_eq!(total, 10);
            assert!(packed < total);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(backend.request_count(), 0);
}

#[tokio::test]
async fn test_request_level_error_reaches_every_result() {
    let (client, backend) = memory_client(1, test_config());
    backend.inject_fault(Fault::Status {
        status: StatusCode::GONE,
        sub_status: SubStatusCode::COMPLETING_SPLIT,
    });

    let mut batch = client.container("orders").transactional_batch("o");
    batch.create(json!({ "id": "a" })).create(json!({ "id": "b" }));
    let response = batch.execute(None, &CancellationToken::new()).await.unwrap();

    // No retries on the transactional path.
    assert_eq!(backend.request_count(), 1);
    assert_eq!(response.status, StatusCode::GONE);
    assert_eq!(response.sub_status, SubStatusCode::COMPLETING_SPLIT);
    assert_eq!(response.len(), 2);
    assert!(response
        .into_results()
        .iter()
        .all(|r| r.status == StatusCode::GONE));
}
