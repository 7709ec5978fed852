//! Session integration tests.
//!
//! Drives the full pipeline: CodeBox → Session → ExecStream → MockBackend.
//! These tests do NOT require Python, Docker or network access.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use codebox_sandbox::{
    Backend, CodeBox, CodeBoxConfig, Error, ExecOptions, HealthStatus, KernelMode, MockBackend,
    SessionState,
};

// =============================================================================
// Helpers
// =============================================================================

fn mock_codebox(mock: MockBackend) -> (CodeBox, Arc<MockBackend>) {
    let mock = Arc::new(mock);
    let backend: Arc<dyn Backend> = mock.clone();
    (CodeBox::with_backend(backend, CodeBoxConfig::local()), mock)
}

fn slow_codebox(outputs: Vec<&str>) -> (CodeBox, Arc<MockBackend>) {
    mock_codebox(MockBackend::new(outputs).with_latency(Duration::from_secs(10)))
}

// =============================================================================
// 1. Execution results
// =============================================================================

#[tokio::test]
async fn test_execute_aggregates_mixed_chunks() {
    let (codebox, mock) = mock_codebox(MockBackend::new(vec![
        "<txt>loading\n</txt><img>iVBORw0KGgo=</img><err>ValueError: bad</err>",
    ]));

    let result = codebox
        .execute("plot()", KernelMode::Python)
        .await
        .unwrap();

    assert_eq!(result.text(), "loading\n");
    assert_eq!(result.images(), vec!["iVBORw0KGgo="]);
    assert_eq!(result.errors(), vec!["ValueError: bad"]);
    assert!(!result.cancelled);
    assert_eq!(mock.executed.lock().await.len(), 1);
}

#[tokio::test]
async fn test_empty_code_is_not_sent() {
    let (codebox, mock) = mock_codebox(MockBackend::default());

    let result = codebox.execute("   \n", KernelMode::Python).await.unwrap();

    assert!(result.is_empty());
    assert!(mock.executed.lock().await.is_empty());
    assert_eq!(codebox.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_stream_yields_chunks_in_order() {
    let (codebox, _) = mock_codebox(MockBackend::new(vec![
        "<txt>one</txt><txt>two</txt><err>three</err>",
    ]));

    let mut stream = codebox
        .stream_execute("run()", KernelMode::Python)
        .await
        .unwrap();
    let mut contents = Vec::new();
    while let Some(chunk) = stream.next().await {
        contents.push(chunk.unwrap().content);
    }

    assert_eq!(contents.concat(), "onetwothree");
    assert_eq!(stream.result().unwrap().errors(), vec!["three"]);
}

// =============================================================================
// 2. Single execution slot
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_second_execute_is_busy() {
    let (codebox, _) = slow_codebox(vec!["<txt>slow</txt>", "<txt>fast</txt>"]);

    let first = codebox
        .stream_execute("slow()", KernelMode::Python)
        .await
        .unwrap();
    assert_eq!(codebox.state(), SessionState::Executing);

    let second = codebox.execute("fast()", KernelMode::Python).await;
    assert!(matches!(second, Err(Error::SessionBusy(_))));

    let result = first.collect().await.unwrap();
    assert_eq!(result.text(), "slow");
    assert_eq!(codebox.state(), SessionState::Ready);

    let result = codebox.execute("fast()", KernelMode::Python).await.unwrap();
    assert_eq!(result.text(), "fast");
}

#[tokio::test(start_paused = true)]
async fn test_file_transfer_runs_beside_execution() {
    let (codebox, _) = slow_codebox(vec!["<txt>done</txt>"]);

    let running = codebox
        .stream_execute("work()", KernelMode::Python)
        .await
        .unwrap();
    let file = codebox.upload("input.txt", "side channel").await.unwrap();
    assert_eq!(file.cached_size(), Some(12));

    assert_eq!(running.collect().await.unwrap().text(), "done");
}

// =============================================================================
// 3. Timeout and cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_timeout_discards_partial_output() {
    let (codebox, _) = slow_codebox(vec!["<txt>never</txt>"]);

    let err = codebox
        .execute_with(
            "while True: pass",
            KernelMode::Python,
            ExecOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(codebox.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_timeout_fires_while_output_keeps_coming() {
    let (codebox, _) = mock_codebox(MockBackend::default().with_endless_output());

    let err = codebox
        .execute_with(
            "while True: print('.')",
            KernelMode::Python,
            ExecOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(codebox.state(), SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_returns_truncated_result() {
    let (codebox, _) = slow_codebox(vec!["<txt>never</txt>"]);

    let stream = codebox
        .stream_execute("sleep()", KernelMode::Python)
        .await
        .unwrap();
    let result = stream.cancel();

    assert!(result.cancelled);
    assert!(result.is_empty());
    assert_eq!(codebox.state(), SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_stream_frees_the_slot() {
    let (codebox, _) = slow_codebox(vec!["<txt>never</txt>"]);

    let stream = codebox
        .stream_execute("sleep()", KernelMode::Python)
        .await
        .unwrap();
    drop(stream);

    assert_eq!(codebox.state(), SessionState::Ready);
}

// =============================================================================
// 4. Lifecycle
// =============================================================================

#[tokio::test]
async fn test_lazy_start_happens_once() {
    let (codebox, mock) = mock_codebox(MockBackend::new(vec!["<txt>1</txt>", "<txt>2</txt>"]));
    assert_eq!(codebox.state(), SessionState::Uninitialized);

    codebox.execute("1", KernelMode::Python).await.unwrap();
    codebox.execute("2", KernelMode::Python).await.unwrap();

    assert_eq!(mock.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (codebox, mock) = mock_codebox(MockBackend::default());
    codebox.start().await.unwrap();

    codebox.stop().await.unwrap();
    codebox.stop().await.unwrap();

    assert_eq!(mock.stops.load(Ordering::SeqCst), 1);
    assert_eq!(codebox.state(), SessionState::Stopped);
    assert!(!mock.is_running());
}

#[tokio::test]
async fn test_stop_before_start_touches_nothing() {
    let (codebox, mock) = mock_codebox(MockBackend::default());

    codebox.stop().await.unwrap();

    assert_eq!(mock.stops.load(Ordering::SeqCst), 0);
    assert_eq!(codebox.state(), SessionState::Stopped);
}

#[tokio::test]
async fn test_operations_after_stop_are_closed() {
    let (codebox, _) = mock_codebox(MockBackend::default());
    codebox.start().await.unwrap();
    codebox.stop().await.unwrap();

    let exec = codebox.execute("1", KernelMode::Python).await;
    assert!(matches!(exec, Err(Error::SessionClosed(_))));

    let upload = codebox.upload("a.txt", "x").await;
    assert!(matches!(upload, Err(Error::SessionClosed(_))));

    assert_eq!(codebox.healthcheck().await, HealthStatus::Error);
}

#[tokio::test]
async fn test_restart_in_place() {
    let (codebox, mock) = mock_codebox(MockBackend::default());
    codebox.start().await.unwrap();

    codebox.restart().await.unwrap();

    assert_eq!(mock.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(mock.starts.load(Ordering::SeqCst), 1);
    assert_eq!(codebox.state(), SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_restart_cancels_in_flight_execution() {
    let (codebox, _) = slow_codebox(vec!["<txt>never</txt>"]);

    let mut stream = codebox
        .stream_execute("sleep()", KernelMode::Python)
        .await
        .unwrap();
    codebox.restart().await.unwrap();

    assert!(stream.next().await.is_none());
    assert!(stream.is_cancelled());
    assert_eq!(codebox.state(), SessionState::Ready);
    drop(stream);
    assert_eq!(codebox.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_restart_after_failed_start_is_cold() {
    let (codebox, mock) = mock_codebox(MockBackend::default());
    mock.fail_start.store(true, Ordering::SeqCst);
    assert!(matches!(codebox.start().await, Err(Error::Startup(_))));
    assert_eq!(codebox.state(), SessionState::Error);

    mock.fail_start.store(false, Ordering::SeqCst);
    codebox.restart().await.unwrap();

    assert_eq!(codebox.state(), SessionState::Ready);
    assert_eq!(mock.restarts.load(Ordering::SeqCst), 0);
    assert_eq!(mock.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_info_reports_backend_and_state() {
    let (codebox, _) = mock_codebox(MockBackend::default().with_id("mock-session"));
    codebox.start().await.unwrap();

    let info = codebox.info();
    assert_eq!(info.id, "mock-session");
    assert_eq!(info.state, SessionState::Ready);
    assert!(info.last_activity >= info.created_at);
    assert_eq!(codebox.healthcheck().await, HealthStatus::Healthy);
}

// =============================================================================
// 5. Files
// =============================================================================

#[tokio::test]
async fn test_upload_download_round_trip() {
    let (codebox, _) = mock_codebox(MockBackend::default());
    let payload: Vec<u8> = (0..=255u8).cycle().take(200_000).collect();

    let uploaded = codebox.upload("data/blob.bin", payload.clone()).await.unwrap();
    assert_eq!(uploaded.size().await.unwrap(), 200_000);

    let downloaded = codebox.download("data/blob.bin").await.unwrap();
    assert_eq!(downloaded.content().await.unwrap().to_vec(), payload);
}

#[tokio::test]
async fn test_list_files_returns_handles() {
    let (codebox, _) = mock_codebox(MockBackend::default());
    codebox.upload("b.txt", "bb").await.unwrap();
    codebox.upload("a.txt", "a").await.unwrap();

    let files = codebox.list_files().await.unwrap();
    let names: Vec<_> = files.iter().map(|f| f.path().to_string()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);
    assert_eq!(files[1].cached_size(), Some(2));
}

#[tokio::test]
async fn test_missing_file_is_not_found() {
    let (codebox, _) = mock_codebox(MockBackend::default());
    let err = codebox.download("missing.csv").await.unwrap_err();
    assert!(matches!(err, Error::FileNotFound(_)));
}

#[tokio::test]
async fn test_file_handle_outliving_session() {
    let (codebox, mock) = mock_codebox(MockBackend::default());
    let file = codebox.file("late.txt");
    drop(codebox);
    drop(mock);

    let err = file.content().await.unwrap_err();
    assert!(matches!(err, Error::SessionClosed(_)));
}

#[tokio::test]
async fn test_oversized_upload_is_rejected() {
    let mock = Arc::new(MockBackend::default());
    let backend: Arc<dyn Backend> = mock.clone();
    let config = CodeBoxConfig {
        max_file_size: 1024,
        transfer_chunk_size: 256,
        ..CodeBoxConfig::local()
    };
    let codebox = CodeBox::with_backend(backend, config);

    let err = codebox.upload("big.bin", vec![0u8; 2048]).await.unwrap_err();
    assert!(matches!(err, Error::FileTooLarge { .. }));
    assert!(mock.files.lock().await.is_empty());
}

// =============================================================================
// 6. Keep-alive
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_keep_alive_ends_after_duration() {
    let mock = Arc::new(MockBackend::default());
    let backend: Arc<dyn Backend> = mock.clone();
    let config = CodeBoxConfig {
        keep_alive_interval_secs: 1,
        ..CodeBoxConfig::local()
    };
    let codebox = CodeBox::with_backend(backend, config);
    codebox.start().await.unwrap();

    let keep_alive = codebox.keep_alive(Duration::from_secs(3)).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(keep_alive.is_finished());
    assert_eq!(codebox.state(), SessionState::Ready);
}
