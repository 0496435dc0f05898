//! End-to-end HTTP download behavior through the controller:
//! segmentation, resume-after-validator-change, retries, checksums.

use std::time::Duration;

use fetchd_core::config::EngineConfig;
use fetchd_core::record::{DownloadSource, DownloadState, Segment, SegmentState};
use fetchd_core::storage::{Database, DownloadStore};
use fetchd_core::{AddOptions, Controller, ErrorKind, EventBus};
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

mod support;

use support::{test_config, wait_for_state};

/// Serves a body with real Range support, like a static file server.
fn ranged_server_mock(body: Vec<u8>, etag: &str) -> (Mock, Mock) {
    let etag_owned = etag.to_string();
    let body_for_head = body.clone();
    let head = Mock::given(method("HEAD")).respond_with(move |_: &Request| {
        ResponseTemplate::new(200)
            .insert_header("Content-Length", body_for_head.len().to_string().as_str())
            .insert_header("Accept-Ranges", "bytes")
            .insert_header("ETag", etag_owned.as_str())
    });

    let etag_owned = etag.to_string();
    let get = Mock::given(method("GET")).respond_with(move |request: &Request| {
        let range = request
            .headers
            .get("Range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| {
                let (start, end) = v.split_once('-')?;
                let start: usize = start.parse().ok()?;
                let end: usize = end.parse().ok().unwrap_or(body.len() - 1);
                Some((start, end.min(body.len() - 1)))
            });
        match range {
            Some((start, end)) => ResponseTemplate::new(206)
                .insert_header(
                    "Content-Range",
                    format!("bytes {start}-{end}/{}", body.len()).as_str(),
                )
                .insert_header("ETag", etag_owned.as_str())
                .set_body_bytes(body[start..=end].to_vec()),
            None => ResponseTemplate::new(200)
                .insert_header("ETag", etag_owned.as_str())
                .set_body_bytes(body.clone()),
        }
    });
    (head, get)
}

async fn start_controller(config: EngineConfig) -> (Controller, Database) {
    let store = Database::open_in_memory().await.unwrap();
    let controller = Controller::start(config, store.clone(), EventBus::new())
        .await
        .unwrap();
    (controller, store)
}

#[tokio::test]
async fn segmented_download_completes_with_correct_bytes() {
    let server = MockServer::start().await;
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let (head, get) = ranged_server_mock(body.clone(), "\"v1\"");
    head.mount(&server).await;
    get.mount(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.min_segment_size = 16 * 1024; // force several segments
    config.max_connections_per_download = 4;
    let (controller, _store) = start_controller(config).await;

    let gid = controller
        .add_url(&format!("{}/big.bin", server.uri()), AddOptions::default())
        .await
        .unwrap();

    wait_for_state(&controller, &gid, Duration::from_secs(20), |state| {
        matches!(state, DownloadState::Completed)
    })
    .await;

    let status = controller.status(&gid).unwrap();
    assert_eq!(status.completed_length, body.len() as u64);
    assert_eq!(status.total_length, Some(body.len() as u64));

    let saved = std::fs::read(dir.path().join("big.bin")).unwrap();
    assert_eq!(saved, body);
    // The partial file was renamed away.
    assert!(!dir.path().join("big.bin.part").exists());
}

#[tokio::test]
async fn restart_from_zero_when_etag_changes() {
    let server = MockServer::start().await;
    let body: Vec<u8> = vec![7u8; 64 * 1024];
    let (head, get) = ranged_server_mock(body.clone(), "\"v2\"");
    head.mount(&server).await;
    get.mount(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("engine.db");
    let store = Database::open(&db_path).await.unwrap();

    // Simulate a previous run killed mid-download against ETag v1: the
    // record and a half-complete segment table survive in the database.
    let mut record = fetchd_core::DownloadRecord::new(
        fetchd_core::DownloadKind::Http,
        DownloadSource::Url { url: format!("{}/file.bin", server.uri()) },
        "file.bin".into(),
        dir.path().to_path_buf(),
    );
    record.files = vec!["file.bin".into()];
    record.total = Some(body.len() as u64);
    record.completed = 30_000;
    record.etag = Some("\"v1\"".into());
    record.supports_range = true;
    record.state = DownloadState::Downloading; // active at crash time
    store.save_download(&record).await.unwrap();
    store
        .save_segments(
            &record.id,
            &[
                Segment {
                    index: 0,
                    start: 0,
                    end: 32_767,
                    downloaded: 30_000,
                    state: SegmentState::Downloading,
                },
                Segment {
                    index: 1,
                    start: 32_768,
                    end: 65_535,
                    downloaded: 0,
                    state: SegmentState::Pending,
                },
            ],
        )
        .await
        .unwrap();
    std::fs::write(dir.path().join("file.bin.part"), vec![0u8; 30_000]).unwrap();

    // Restart: the server now carries ETag v2.
    let mut config = test_config(dir.path());
    config.database_path = Some(db_path);
    let controller = Controller::start(config, store, EventBus::new()).await.unwrap();

    let gid = record.id.clone();
    wait_for_state(&controller, &gid, Duration::from_secs(20), |state| {
        matches!(state, DownloadState::Completed)
    })
    .await;

    let status = controller.status(&gid).unwrap();
    assert_eq!(status.completed_length, body.len() as u64);
    let saved = std::fs::read(dir.path().join("file.bin")).unwrap();
    assert_eq!(saved, body);
}

#[tokio::test]
async fn transient_5xx_is_retried_then_succeeds() {
    let server = MockServer::start().await;
    let body = vec![3u8; 4096];

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    let (head, get) = ranged_server_mock(body.clone(), "\"r\"");
    head.mount(&server).await;
    get.mount(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.http.retry_delay_ms = 50; // keep the test quick
    let (controller, _store) = start_controller(config).await;

    let gid = controller
        .add_url(&format!("{}/retry.bin", server.uri()), AddOptions::default())
        .await
        .unwrap();

    wait_for_state(&controller, &gid, Duration::from_secs(20), |state| {
        matches!(state, DownloadState::Completed)
    })
    .await;
    assert_eq!(std::fs::read(dir.path().join("retry.bin")).unwrap(), body);
}

#[tokio::test]
async fn not_found_fails_immediately_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1) // no retries for permanent failures
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (controller, _store) = start_controller(test_config(dir.path())).await;

    let gid = controller
        .add_url(&format!("{}/gone.bin", server.uri()), AddOptions::default())
        .await
        .unwrap();

    wait_for_state(&controller, &gid, Duration::from_secs(10), |state| {
        matches!(state, DownloadState::Error { kind: ErrorKind::NotFound })
    })
    .await;
}

#[tokio::test]
async fn checksum_mismatch_keeps_artifact() {
    let server = MockServer::start().await;
    let body = vec![9u8; 2048];
    let (head, get) = ranged_server_mock(body, "\"c\"");
    head.mount(&server).await;
    get.mount(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let (controller, _store) = start_controller(test_config(dir.path())).await;

    let options = AddOptions {
        checksum: Some(format!("sha256:{}", "00".repeat(32))),
        ..AddOptions::default()
    };
    let gid = controller
        .add_url(&format!("{}/sum.bin", server.uri()), options)
        .await
        .unwrap();

    wait_for_state(&controller, &gid, Duration::from_secs(10), |state| {
        matches!(state, DownloadState::Error { kind: ErrorKind::HashMismatch })
    })
    .await;
    // The mismatching artifact is kept for inspection (as .part).
    assert!(dir.path().join("sum.bin.part").exists());
}

#[tokio::test]
async fn duplicate_url_is_rejected() {
    let server = MockServer::start().await;
    // Slow HEAD keeps the first download alive while the second is added.
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(20)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (controller, _store) = start_controller(test_config(dir.path())).await;

    let url = format!("{}/dup.bin", server.uri());
    controller.add_url(&url, AddOptions::default()).await.unwrap();
    let err = controller.add_url(&url, AddOptions::default()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyExists);
}

#[tokio::test]
async fn unsupported_range_falls_back_to_sequential() {
    let server = MockServer::start().await;
    let body = vec![5u8; 10_000];
    Mock::given(method("HEAD"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", body.len().to_string().as_str()),
        )
        .mount(&server)
        .await;
    // Plain 200 regardless of Range: no segmentation possible.
    Mock::given(method("GET"))
        .and(path("/flat.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (controller, _store) = start_controller(test_config(dir.path())).await;

    let gid = controller
        .add_url(&format!("{}/flat.bin", server.uri()), AddOptions::default())
        .await
        .unwrap();

    wait_for_state(&controller, &gid, Duration::from_secs(10), |state| {
        matches!(state, DownloadState::Completed)
    })
    .await;
    assert_eq!(std::fs::read(dir.path().join("flat.bin")).unwrap(), body);
}

#[tokio::test]
async fn header_forwarding_reaches_the_server() {
    let server = MockServer::start().await;
    let body = vec![1u8; 256];
    Mock::given(method("HEAD"))
        .and(header_exists("X-Auth-Token"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", "256")
                .insert_header("Accept-Ranges", "bytes"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(header_exists("X-Auth-Token"))
        .respond_with(ResponseTemplate::new(206)
            .insert_header("Content-Range", "bytes 0-255/256")
            .set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (controller, _store) = start_controller(test_config(dir.path())).await;

    let mut options = AddOptions::default();
    options.headers.insert("X-Auth-Token".into(), "secret".into());
    let gid = controller
        .add_url(&format!("{}/auth.bin", server.uri()), options)
        .await
        .unwrap();

    wait_for_state(&controller, &gid, Duration::from_secs(10), |state| {
        matches!(state, DownloadState::Completed)
    })
    .await;
}
