use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tessera_query::{
  ColumnDef, DataType, MemoryClient, QueryClient, QueryError, ScriptedResponse, Session,
};
use tokio_util::sync::CancellationToken;

fn columns() -> Vec<ColumnDef> {
  vec![ColumnDef::new("n", DataType::Integer)]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_in_flight_tracks_concurrent_streams() {
  let client = Arc::new(MemoryClient::new().with_response(
    "select slow",
    ScriptedResponse::rows(columns(), vec![vec![json!(1)]]).delayed(50),
  ));
  let cancel = CancellationToken::new();

  let handles: Vec<_> = (0..3)
    .map(|i| {
      let client = Arc::clone(&client);
      let cancel = cancel.clone();
      tokio::spawn(async move {
        let session = Session::new(format!("s{}", i));
        let result = client
          .execute_in_session(&session, "select slow", &[], &cancel)
          .await?;
        result.collect().await
      })
    })
    .collect();

  for result in join_all(handles).await {
    assert_eq!(result.unwrap().unwrap().rows.len(), 1);
  }
  assert_eq!(client.max_in_flight(), 3);
  assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_delay_is_cancellable() {
  let client = MemoryClient::new().with_response(
    "select slow",
    ScriptedResponse::rows(columns(), vec![vec![json!(1)]]).delayed(10_000),
  );
  let cancel = CancellationToken::new();
  let canceller = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(10)).await;
    canceller.cancel();
  });

  let result = client
    .execute_in_session(&Session::new("s"), "select slow", &[], &cancel)
    .await
    .unwrap();
  assert_eq!(result.collect().await, Err(QueryError::Cancelled));
}

#[tokio::test]
async fn test_closed_sessions_are_recorded() {
  let client = MemoryClient::new();
  let cancel = CancellationToken::new();
  let first = client.acquire_session(&cancel).await.unwrap();
  let second = client.acquire_session(&cancel).await.unwrap();
  assert_ne!(first, second);

  client.close_session(first, false).await;
  client.close_session(second, true).await;
  assert_eq!(
    client.closed_sessions(),
    vec![
      ("session-0".to_string(), false),
      ("session-1".to_string(), true)
    ]
  );
}

#[tokio::test]
async fn test_acquire_after_cancel_fails() {
  let client = MemoryClient::new();
  let cancel = CancellationToken::new();
  cancel.cancel();
  let error = client.acquire_session(&cancel).await.unwrap_err();
  assert!(error.is_cancelled());
}
