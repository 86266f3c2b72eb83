//! Integration tests for the download worker.
//!
//! These tests run the worker against a mock HTTP server with real Range
//! semantics: chunked end-to-end downloads, mid-chunk resume, servers that
//! ignore Range headers, retry exhaustion, cancellation, and the
//! unknown-size single-stream fallback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use download_center::{
    ChunkManager, ConcurrencyAdjuster, DownloadConfig, DownloadRequest, DownloadTask,
    DownloadWorker, ErrorKind, NetworkMonitor,
};
use download_center::task::{ChunkStatus, SharedTask, shared, snapshot, with_task_mut};
use download_center::worker::ProgressSink;
use tempfile::TempDir;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

// ==================== Test Server ====================

/// Serves a fixed body with real byte-range semantics.
///
/// - `Range: bytes=a-b` -> 206 with the slice and a `Content-Range` header
/// - no Range header -> 200 with the full body
/// - `ignore_ranges` -> always 200 with the full body
/// - `hide_total` -> range probes get `Content-Range: bytes a-b/*`
struct RangeResponder {
    body: Vec<u8>,
    ignore_ranges: bool,
    hide_total: bool,
    delay: Option<Duration>,
    hits: Arc<Mutex<Vec<(Instant, Option<String>)>>>,
}

impl RangeResponder {
    fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ignore_ranges: false,
            hide_total: false,
            delay: None,
            hits: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn ignoring_ranges(mut self) -> Self {
        self.ignore_ranges = true;
        self
    }

    fn hiding_total(mut self) -> Self {
        self.hide_total = true;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn hits(&self) -> Arc<Mutex<Vec<(Instant, Option<String>)>>> {
        Arc::clone(&self.hits)
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        self.hits
            .lock()
            .unwrap()
            .push((Instant::now(), range.clone()));

        let template = if self.ignore_ranges || range.is_none() {
            ResponseTemplate::new(200).set_body_bytes(self.body.clone())
        } else {
            let spec = range.unwrap();
            let (start, end) = parse_range(&spec, self.body.len() as u64);
            let slice = self.body[start as usize..=(end as usize)].to_vec();
            let total = if self.hide_total {
                "*".to_string()
            } else {
                self.body.len().to_string()
            };
            ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!("bytes {start}-{end}/{total}").as_str(),
                )
                .set_body_bytes(slice)
        };

        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

fn parse_range(spec: &str, body_len: u64) -> (u64, u64) {
    let raw = spec.trim_start_matches("bytes=");
    let (start, end) = raw.split_once('-').unwrap();
    let start: u64 = start.parse().unwrap();
    let end: u64 = end
        .parse()
        .unwrap_or(body_len - 1)
        .min(body_len - 1);
    (start, end)
}

/// Deterministic pseudo-random body so merge order errors are visible.
fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

// ==================== Harness ====================

struct Harness {
    worker: DownloadWorker,
    config: DownloadConfig,
    _temp: TempDir,
    dest: TempDir,
}

fn harness(chunk_size: u64, max_concurrent: usize) -> Harness {
    let temp = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    let mut config = DownloadConfig::default();
    config.chunk.size = chunk_size;
    config.chunk.max_retries = 2;
    config.network.retry_delay_ms = 10;
    config.network.timeout_secs = 10;
    config.concurrency.max_concurrent = max_concurrent;
    config.storage.temp_dir = temp.path().to_path_buf();

    let monitor = Arc::new(NetworkMonitor::with_probe_urls([]));
    let adjuster = Arc::new(ConcurrencyAdjuster::new(&config, monitor));
    let worker = DownloadWorker::new(&config, adjuster);

    Harness {
        worker,
        config,
        _temp: temp,
        dest,
    }
}

impl Harness {
    fn make_task(&self, id: &str, url: &str) -> SharedTask {
        let mut request = DownloadRequest::new(url, self.dest.path());
        request.id = Some(id.to_string());
        request.filename = Some(format!("{id}.bin"));
        shared(DownloadTask::from_request(&request, 50))
    }

    fn chunk_manager(&self) -> ChunkManager {
        ChunkManager::from_config(&self.config)
    }
}

fn noop_sink() -> ProgressSink {
    Arc::new(|_, _| {})
}

async fn mount(server: &MockServer, responder: RangeResponder) {
    // HEAD is deliberately unsupported so sizing exercises the ranged-GET
    // fallback, which the responder answers deterministically.
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(405))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .respond_with(responder)
        .mount(server)
        .await;
}

// ==================== End-to-End Tests ====================

#[tokio::test]
async fn test_chunked_download_end_to_end() {
    let server = MockServer::start().await;
    let body = test_body(100 * 1024);
    mount(&server, RangeResponder::new(body.clone())).await;

    let harness = harness(16 * 1024, 4);
    let url = format!("{}/file.bin", server.uri());
    let task = harness.make_task("e2e", &url);

    harness
        .worker
        .run_task(SharedTask::clone(&task), noop_sink())
        .await
        .unwrap();

    let view = snapshot(&task);
    assert_eq!(view.progress.percentage, 100);
    assert_eq!(view.progress.downloaded_size, body.len() as u64);
    assert_eq!(view.chunks.len(), 7); // ceil(100/16)
    assert!(view.chunks.iter().all(|c| c.status == ChunkStatus::Completed));

    let merged = tokio::fs::read(view.final_path()).await.unwrap();
    assert_eq!(merged, body);

    // temp artifacts consumed by the merge
    let temp_dir = harness.chunk_manager().task_temp_dir("e2e");
    assert!(tokio::fs::metadata(&temp_dir).await.is_err());
}

#[tokio::test]
async fn test_ten_chunks_never_exceed_four_concurrent_requests() {
    let server = MockServer::start().await;
    let body = test_body(10 * 16 * 1024);
    let responder =
        RangeResponder::new(body.clone()).with_delay(Duration::from_millis(80));
    let hits = responder.hits();
    mount(&server, responder).await;

    let harness = harness(16 * 1024, 4);
    let url = format!("{}/file.bin", server.uri());
    let task = harness.make_task("bound", &url);

    harness
        .worker
        .run_task(SharedTask::clone(&task), noop_sink())
        .await
        .unwrap();

    assert_eq!(snapshot(&task).chunks.len(), 10);
    let merged = tokio::fs::read(snapshot(&task).final_path()).await.unwrap();
    assert_eq!(merged, body);

    // Each request is in flight for ~delay; count the maximum overlap of
    // chunk requests (skip the 0-0 sizing probe).
    let hits = hits.lock().unwrap();
    let chunk_hits: Vec<Instant> = hits
        .iter()
        .filter(|(_, range)| range.as_deref() != Some("bytes=0-0"))
        .map(|(at, _)| *at)
        .collect();
    assert_eq!(chunk_hits.len(), 10);

    let window = Duration::from_millis(80);
    let max_overlap = chunk_hits
        .iter()
        .map(|&t| {
            chunk_hits
                .iter()
                .filter(|&&other| other <= t && t < other + window)
                .count()
        })
        .max()
        .unwrap();
    assert!(
        max_overlap <= 4,
        "observed {max_overlap} overlapping chunk requests"
    );
}

// ==================== Resume Tests ====================

#[tokio::test]
async fn test_resume_partially_written_chunk() {
    let server = MockServer::start().await;
    let body = test_body(40 * 1024);
    let responder = RangeResponder::new(body.clone());
    let hits = responder.hits();
    mount(&server, responder).await;

    let harness = harness(16 * 1024, 2);
    let url = format!("{}/file.bin", server.uri());
    let task = harness.make_task("resume", &url);

    // Simulate a prior interrupted run: a compatible layout with chunk 0
    // half-written and chunk 1 complete on disk.
    let manager = harness.chunk_manager();
    let chunks = manager.create_chunks("resume", body.len() as u64);
    manager.ensure_temp_dir("resume").await.unwrap();
    tokio::fs::write(&chunks[0].file_path, &body[..8 * 1024])
        .await
        .unwrap();
    tokio::fs::write(&chunks[1].file_path, &body[16 * 1024..32 * 1024])
        .await
        .unwrap();
    with_task_mut(&task, |t| t.chunks = chunks);

    harness
        .worker
        .run_task(SharedTask::clone(&task), noop_sink())
        .await
        .unwrap();

    let merged = tokio::fs::read(snapshot(&task).final_path()).await.unwrap();
    assert_eq!(merged, body);

    // chunk 0 resumed mid-chunk, chunk 1 was never re-requested
    let hits = hits.lock().unwrap();
    let ranges: Vec<&str> = hits.iter().filter_map(|(_, r)| r.as_deref()).collect();
    assert!(
        ranges.contains(&format!("bytes={}-{}", 8 * 1024, 16 * 1024 - 1).as_str()),
        "expected mid-chunk resume request, saw {ranges:?}"
    );
    assert!(
        !ranges
            .iter()
            .any(|r| r.starts_with(&format!("bytes={}-", 16 * 1024))),
        "completed chunk must not be re-requested, saw {ranges:?}"
    );
}

#[tokio::test]
async fn test_incompatible_layout_is_discarded() {
    let server = MockServer::start().await;
    let body = test_body(20 * 1024);
    mount(&server, RangeResponder::new(body.clone())).await;

    let harness = harness(16 * 1024, 2);
    let url = format!("{}/file.bin", server.uri());
    let task = harness.make_task("stale", &url);

    // Layout computed against a different (stale) total size.
    let manager = harness.chunk_manager();
    let stale = manager.create_chunks("stale", 64 * 1024);
    with_task_mut(&task, |t| t.chunks = stale);

    harness
        .worker
        .run_task(SharedTask::clone(&task), noop_sink())
        .await
        .unwrap();

    let view = snapshot(&task);
    assert_eq!(view.chunks.len(), 2); // re-chunked for the real 20 KiB
    let merged = tokio::fs::read(view.final_path()).await.unwrap();
    assert_eq!(merged, body);
}

// ==================== Range-Ignoring Server Tests ====================

#[tokio::test]
async fn test_200_resets_partial_chunk_and_restarts_from_zero() {
    let server = MockServer::start().await;
    let body = test_body(8 * 1024);
    // Server answers every GET with 200 + full body (no range support).
    let responder = RangeResponder::new(body.clone()).ignoring_ranges();
    let hits = responder.hits();
    mount(&server, responder).await;

    // Single-chunk layout so the whole file is the head chunk.
    let harness = harness(16 * 1024, 2);
    let url = format!("{}/file.bin", server.uri());
    let task = harness.make_task("reset", &url);

    let manager = harness.chunk_manager();
    let chunks = manager.create_chunks("reset", body.len() as u64);
    manager.ensure_temp_dir("reset").await.unwrap();
    // 512000 bytes would exceed this body; use a half-written chunk file.
    tokio::fs::write(&chunks[0].file_path, &body[..4 * 1024])
        .await
        .unwrap();
    with_task_mut(&task, |t| t.chunks = chunks);

    harness
        .worker
        .run_task(SharedTask::clone(&task), noop_sink())
        .await
        .unwrap();

    // The merged file is exactly the body - no duplicated prefix, which is
    // what appending the 200 body to the partial file would have produced.
    let merged = tokio::fs::read(snapshot(&task).final_path()).await.unwrap();
    assert_eq!(merged, body);

    // First chunk request resumed at 4096, got 200, reset, re-requested
    // from byte 0.
    let hits = hits.lock().unwrap();
    let ranges: Vec<&str> = hits.iter().filter_map(|(_, r)| r.as_deref()).collect();
    let resumed = format!("bytes={}-{}", 4 * 1024, body.len() - 1);
    let restarted = format!("bytes=0-{}", body.len() - 1);
    assert!(ranges.contains(&resumed.as_str()), "saw {ranges:?}");
    assert!(ranges.contains(&restarted.as_str()), "saw {ranges:?}");
}

#[tokio::test]
async fn test_range_ignoring_server_fails_multi_chunk_task() {
    let server = MockServer::start().await;
    let body = test_body(48 * 1024);
    mount(
        &server,
        RangeResponder::new(body.clone()).ignoring_ranges(),
    )
    .await;

    let harness = harness(16 * 1024, 2);
    let url = format!("{}/file.bin", server.uri());
    let task = harness.make_task("noranges", &url);

    let error = harness
        .worker
        .run_task(SharedTask::clone(&task), noop_sink())
        .await
        .unwrap_err();

    // Tail chunks can never be fetched from a 200 body; the task fails
    // with a network-class error instead of writing interleaved garbage.
    assert_eq!(error.kind(), ErrorKind::Network);
    assert!(
        tokio::fs::metadata(snapshot(&task).final_path())
            .await
            .is_err(),
        "no merged file may exist"
    );
}

// ==================== Failure Tests ====================

#[tokio::test]
async fn test_chunk_retries_then_task_fails() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    // Sizing probe succeeds; every chunk GET afterwards fails with 503.
    let body_len = 4 * 1024u64;
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = Arc::clone(&hits);
    Mock::given(method("GET"))
        .respond_with(move |request: &Request| {
            let range = request
                .headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if range == "bytes=0-0" {
                ResponseTemplate::new(206)
                    .insert_header("content-range", format!("bytes 0-0/{body_len}").as_str())
                    .set_body_bytes(vec![0u8])
            } else {
                hits_clone.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(503)
            }
        })
        .mount(&server)
        .await;

    let harness = harness(16 * 1024, 2);
    let url = format!("{}/file.bin", server.uri());
    let task = harness.make_task("failing", &url);

    let error = harness
        .worker
        .run_task(SharedTask::clone(&task), noop_sink())
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Network);
    // initial attempt + config.chunk.max_retries (2)
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    let view = snapshot(&task);
    assert_eq!(view.chunks[0].status, ChunkStatus::Failed);
}

#[tokio::test]
async fn test_404_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let harness = harness(16 * 1024, 2);
    let url = format!("{}/missing.bin", server.uri());
    let task = harness.make_task("missing", &url);

    let error = harness
        .worker
        .run_task(SharedTask::clone(&task), noop_sink())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::FileNotFound);
    assert!(!error.can_retry());
}

// ==================== Unknown Size Tests ====================

#[tokio::test]
async fn test_unknown_size_rejected_by_default() {
    let server = MockServer::start().await;
    let body = test_body(12 * 1024);
    mount(&server, RangeResponder::new(body).hiding_total()).await;

    let harness = harness(16 * 1024, 2);
    let url = format!("{}/stream.bin", server.uri());
    let task = harness.make_task("nosize", &url);

    let error = harness
        .worker
        .run_task(SharedTask::clone(&task), noop_sink())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Network);
    assert!(error.to_string().contains("cannot determine file size"));
}

#[tokio::test]
async fn test_unknown_size_single_stream_fallback() {
    let server = MockServer::start().await;
    let body = test_body(12 * 1024);
    mount(&server, RangeResponder::new(body.clone()).hiding_total()).await;

    let harness = harness(16 * 1024, 2);
    let url = format!("{}/stream.bin", server.uri());
    let task = harness.make_task("single", &url);
    with_task_mut(&task, |t| t.allow_unknown_size = true);

    harness
        .worker
        .run_task(SharedTask::clone(&task), noop_sink())
        .await
        .unwrap();

    let view = snapshot(&task);
    assert_eq!(view.progress.percentage, 100);
    assert!(view.chunks.is_empty()); // non-chunked path
    let merged = tokio::fs::read(view.final_path()).await.unwrap();
    assert_eq!(merged, body);
}

// ==================== Cancellation Tests ====================

#[tokio::test]
async fn test_cancellation_aborts_and_preserves_completed_chunks() {
    let server = MockServer::start().await;
    let body = test_body(5 * 16 * 1024);
    // Slow chunks so cancellation lands mid-download.
    mount(
        &server,
        RangeResponder::new(body.clone()).with_delay(Duration::from_millis(150)),
    )
    .await;

    // One lane: chunks complete strictly in order.
    let harness = harness(16 * 1024, 1);
    let url = format!("{}/file.bin", server.uri());
    let task = harness.make_task("cancelme", &url);

    let worker = Arc::new(harness.worker);
    let runner = Arc::clone(&worker);
    let run_task = SharedTask::clone(&task);
    let handle = tokio::spawn(async move { runner.run_task(run_task, noop_sink()).await });

    // Let roughly two chunks finish, then cancel.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(worker.cancel_task("cancelme"));

    let result = handle.await.unwrap();
    let error = result.unwrap_err();
    assert!(error.is_cancelled());

    let view = snapshot(&task);
    // No merge was attempted.
    assert!(tokio::fs::metadata(view.final_path()).await.is_err());

    // Completed chunks stay completed and their files stay on disk.
    let manager = ChunkManager::from_config(&harness.config);
    for chunk in view
        .chunks
        .iter()
        .filter(|c| c.status == ChunkStatus::Completed)
    {
        let meta = tokio::fs::metadata(&chunk.file_path).await.unwrap();
        assert_eq!(meta.len(), chunk.size);
    }
    // Untouched chunks were marked failed, progressed ones pending.
    for chunk in &view.chunks {
        match chunk.status {
            ChunkStatus::Completed => {}
            ChunkStatus::Pending => assert!(chunk.downloaded > 0),
            ChunkStatus::Failed => assert_eq!(chunk.downloaded, 0),
            ChunkStatus::Downloading => panic!("no chunk may be left downloading"),
        }
    }

    // A subsequent cleanup call removes the task's temp directory.
    manager.cleanup_task_temp_dir("cancelme").await;
    assert!(
        tokio::fs::metadata(manager.task_temp_dir("cancelme"))
            .await
            .is_err()
    );
}
