//! End-to-end integration tests

use axum::{
    body::{to_bytes, Body},
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::util::ServiceExt;

use crate::auth::{AllowAll, AuthManager, BasicAuth};
use crate::config::{
    AuthConfig, HlsConfig, RecordConfig, RecordFormat, ResolvedPath, ServerConfig,
};
use crate::error::Result;
use crate::http::create_router;
use crate::integration::fixtures::{t0, video_init, write_segment, FakeEncoder, RecordingMuxer};
use crate::request::format_start;
use crate::segment::store::segment_file_name;
use crate::segment::{mux_parts, read_header, FsSegmentStore, Segment, SegmentStore};
use crate::state::AppState;
use crate::transcode::{compute_token, is_complete};

struct Harness {
    root: TempDir,
    state: Arc<AppState>,
    encoder: Arc<FakeEncoder>,
}

impl Harness {
    fn new(encoder: FakeEncoder) -> Self {
        Self::build(encoder, RecordFormat::Fmp4, None)
    }

    fn build(encoder: FakeEncoder, format: RecordFormat, auth: Option<AuthConfig>) -> Self {
        Self::with_store(encoder, format, auth, Arc::new(FsSegmentStore))
    }

    fn with_store(
        encoder: FakeEncoder,
        format: RecordFormat,
        auth: Option<AuthConfig>,
        store: Arc<dyn SegmentStore>,
    ) -> Self {
        let root = TempDir::new().unwrap();
        let config = ServerConfig {
            record: RecordConfig {
                root: root.path().join("rec"),
                format,
            },
            hls: HlsConfig {
                output_dir: root.path().join("hls"),
                ..Default::default()
            },
            auth,
            ..Default::default()
        };

        let auth: Arc<dyn AuthManager> = match &config.auth {
            Some(creds) => Arc::new(BasicAuth::new(creds)),
            None => Arc::new(AllowAll),
        };
        let encoder = Arc::new(encoder);
        let mut state =
            AppState::with_collaborators(config, store, auth, encoder.clone());
        state.auth_pause = Duration::ZERO;

        Self {
            root,
            state: Arc::new(state),
            encoder,
        }
    }

    /// Record `secs` seconds of video for path `cam` starting at `start`.
    fn record(&self, start: DateTime<Utc>, secs: u32) {
        write_segment(&self.root.path().join("rec"), "cam", start, &video_init(), secs);
    }

    fn app(&self) -> Router {
        create_router(self.state.clone())
    }

    fn hls_dir(&self, start: DateTime<Utc>, duration: Duration) -> std::path::PathBuf {
        let token = compute_token("127.0.0.1", "cam", &start, duration);
        self.state.hls_dir(&token)
    }

    async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
        send(self.app(), get_request(uri)).await
    }
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body)
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

fn playback_uri(start: DateTime<Utc>, duration: u64, format: &str) -> String {
    format!(
        "/get?path=cam&start={}&duration={}&format={}",
        format_start(&start),
        duration,
        format
    )
}

/// Top-level box types of an ISO-BMFF file
fn box_types(data: &[u8]) -> Vec<String> {
    let mut types = Vec::new();
    let mut pos = 0;
    while pos + 8 <= data.len() {
        let size = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        types.push(String::from_utf8_lossy(&data[pos + 4..pos + 8]).to_string());
        if size < 8 {
            break;
        }
        pos += size as usize;
    }
    types
}

#[tokio::test]
async fn test_fmp4_window_across_segments() {
    let h = Harness::new(FakeEncoder::default());
    h.record(t0(), 60);
    h.record(t0() + secs(60), 60);

    let (status, headers, body) = h.get(&playback_uri(t0() + secs(50), 30, "fmp4")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(headers[header::ACCEPT_RANGES], "none");

    // read the output back as if it were a recording
    let mut cur = Cursor::new(body.to_vec());
    let (init, _) = read_header(&mut cur).unwrap();
    assert_eq!(init.tracks.len(), 1);

    let mut muxer = RecordingMuxer::default();
    let produced = mux_parts(
        &mut cur,
        chrono::Duration::zero(),
        Duration::from_secs(3600),
        &init,
        &mut muxer,
    )
    .unwrap();

    assert_eq!(produced, Duration::from_secs(30));
    let dts = muxer.track_samples(1);
    assert_eq!(dts.len(), 30 * 30);
    assert_eq!(dts.first(), Some(&0));
    assert_eq!(dts.last(), Some(&(30 * 90000 - 3000)));
    assert!(dts.windows(2).all(|w| w[1] - w[0] == 3000));
}

#[tokio::test]
async fn test_mp4_window() {
    let h = Harness::new(FakeEncoder::default());
    h.record(t0(), 20);

    let (status, headers, body) = h.get(&playback_uri(t0() + secs(5), 10, "mp4")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(box_types(&body), vec!["ftyp", "moov", "mdat"]);
}

#[tokio::test]
async fn test_invalid_format() {
    let h = Harness::new(FakeEncoder::default());
    h.record(t0(), 10);

    let (status, _, body) = h.get(&playback_uri(t0(), 5, "xyz")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(&body[..], b"invalid format: xyz");
}

#[tokio::test]
async fn test_missing_parameters() {
    let h = Harness::new(FakeEncoder::default());
    let (status, _, body) = h.get("/get?path=cam&duration=5").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(&body[..], b"missing start");
}

#[tokio::test]
async fn test_no_segments() {
    let h = Harness::new(FakeEncoder::default());
    h.record(t0(), 10);

    let (status, _, _) = h.get(&playback_uri(t0() - secs(3600), 5, "fmp4")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = h.get(&playback_uri(t0(), 5, "mp4").replace("cam", "garage")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_start_before_first_segment_is_clamped() {
    let h = Harness::new(FakeEncoder::default());
    h.record(t0(), 10);

    let (status, _, body) = h.get(&playback_uri(t0() - secs(2), 4, "mp4")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(box_types(&body), vec!["ftyp", "moov", "mdat"]);
}

#[tokio::test]
async fn test_mpegts_direct_format_rejected() {
    let h = Harness::build(FakeEncoder::default(), RecordFormat::Mpegts, None);
    let dir = h.root.path().join("rec/cam");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(segment_file_name(t0(), "ts")), b"ts data").unwrap();

    let (status, _, body) = h.get(&playback_uri(t0(), 5, "fmp4")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("unsupported format"));

    // HLS goes through the encoder's concat input instead
    let (status, _, body) = h.get(&playback_uri(t0(), 5, "hls")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with(b"#EXTM3U"));
    assert!(h.encoder.last_args().contains(&"concat".to_string()));
}

#[tokio::test]
async fn test_hls_concurrent_requests_run_encoder_once() {
    let h = Harness::new(FakeEncoder::slow(Duration::from_millis(200)));
    h.record(t0(), 40);
    let uri = playback_uri(t0() + secs(10), 20, "hls");

    let mut handles = Vec::new();
    for _ in 0..5 {
        let app = h.app();
        let request = get_request(&uri);
        handles.push(tokio::spawn(send(app, request)));
    }

    let mut bodies = Vec::new();
    for handle in handles {
        let (status, headers, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/vnd.apple.mpegurl");
        bodies.push(body);
    }

    assert_eq!(h.encoder.runs(), 1);
    assert!(bodies.windows(2).all(|w| w[0] == w[1]));

    let manifest = String::from_utf8(bodies[0].to_vec()).unwrap();
    assert!(manifest.starts_with("#EXTM3U"));
    assert!(manifest.contains(&format!("{}&file=index0.ts", uri)));
    assert!(h.state.coordinator.is_empty());
}

/// Filesystem store whose lookups after the first one are slow
#[derive(Default)]
struct SlowLookups {
    calls: AtomicUsize,
}

impl SegmentStore for SlowLookups {
    fn find_segments(
        &self,
        conf: &ResolvedPath,
        path_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Segment>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            std::thread::sleep(Duration::from_millis(400));
        }
        FsSegmentStore.find_segments(conf, path_name, start, end)
    }
}

#[tokio::test]
async fn test_hls_job_finishing_during_lookup_is_not_rerun() {
    let h = Harness::with_store(
        FakeEncoder::slow(Duration::from_millis(100)),
        RecordFormat::Fmp4,
        None,
        Arc::new(SlowLookups::default()),
    );
    h.record(t0(), 40);
    let uri = playback_uri(t0(), 20, "hls");

    let first = tokio::spawn(send(h.app(), get_request(&uri)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    // still looking up segments when the first job completes
    let second = tokio::spawn(send(h.app(), get_request(&uri)));

    let (status_a, _, body_a) = first.await.unwrap();
    let (status_b, _, body_b) = second.await.unwrap();
    assert_eq!(status_a, StatusCode::OK);
    assert_eq!(status_b, StatusCode::OK);
    assert_eq!(body_a, body_b);
    assert_eq!(h.encoder.runs(), 1);
    assert!(is_complete(&h.hls_dir(t0(), Duration::from_secs(20))));
}

#[tokio::test]
async fn test_hls_completed_job_served_from_disk() {
    let h = Harness::new(FakeEncoder::default());
    h.record(t0(), 40);
    let uri = playback_uri(t0(), 20, "hls");

    let (first, _, body1) = h.get(&uri).await;
    let (second, _, body2) = h.get(&uri).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(body1, body2);
    assert_eq!(h.encoder.runs(), 1);
    assert!(is_complete(&h.hls_dir(t0(), Duration::from_secs(20))));
}

#[tokio::test]
async fn test_hls_file_fetch() {
    let h = Harness::new(FakeEncoder::default());
    h.record(t0(), 20);
    let uri = playback_uri(t0(), 10, "hls");
    assert_eq!(h.get(&uri).await.0, StatusCode::OK);

    let (status, headers, body) = h.get(&format!("{}&file=index0.ts", uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "video/mp2t");
    assert_eq!(&body[..], b"segment");

    let (status, _, _) = h.get(&format!("{}&file=missing.ts", uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    for bad in ["..%2F..%2Fetc%2Fpasswd", "sub%2Findex0.ts", ".done"] {
        let (status, _, _) = h.get(&format!("{}&file={}", uri, bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{bad}");
    }
}

#[tokio::test]
async fn test_hls_failure_reaches_client() {
    let h = Harness::new(FakeEncoder::failing());
    h.record(t0(), 20);

    let (status, _, body) = h.get(&playback_uri(t0(), 10, "hls")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(String::from_utf8_lossy(&body).contains("encoder failed"));
    assert!(!h.hls_dir(t0(), Duration::from_secs(10)).exists());
    assert!(h.state.coordinator.is_empty());
}

#[tokio::test]
async fn test_delete_hls() {
    let h = Harness::new(FakeEncoder::default());
    h.record(t0(), 20);
    assert_eq!(h.get(&playback_uri(t0(), 10, "hls")).await.0, StatusCode::OK);

    let delete = |uri: String| {
        Request::builder()
            .method(Method::DELETE)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    };
    let uri = format!(
        "/hls?path=cam&start={}&duration=10",
        format_start(&t0())
    );

    let (status, _, _) = send(h.app(), delete(uri.clone())).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(!h.hls_dir(t0(), Duration::from_secs(10)).exists());

    let (status, _, _) = send(h.app(), delete(uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_hls_while_job_runs() {
    let h = Harness::new(FakeEncoder::slow(Duration::from_millis(300)));
    h.record(t0(), 20);

    let pending = tokio::spawn(send(h.app(), get_request(&playback_uri(t0(), 10, "hls"))));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let request = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/hls?path=cam&start={}&duration=10", format_start(&t0())))
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(h.app(), request).await;
    assert_eq!(status, StatusCode::CONFLICT);

    assert_eq!(pending.await.unwrap().0, StatusCode::OK);
    assert!(is_complete(&h.hls_dir(t0(), Duration::from_secs(10))));
}

#[tokio::test]
async fn test_debug_jobs_lists_running_job() {
    let h = Harness::new(FakeEncoder::slow(Duration::from_millis(500)));
    h.record(t0(), 20);

    let pending = tokio::spawn(send(h.app(), get_request(&playback_uri(t0(), 10, "hls"))));
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (status, _, body) = h.get("/debug/jobs").await;
    assert_eq!(status, StatusCode::OK);
    let jobs: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let jobs = jobs.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["state"], "running");
    assert_eq!(jobs[0]["client"], "127.0.0.1");

    assert_eq!(pending.await.unwrap().0, StatusCode::OK);
    let (_, _, body) = h.get("/debug/jobs").await;
    assert_eq!(&body[..], b"[]");
}

#[tokio::test]
async fn test_basic_auth() {
    let h = Harness::build(
        FakeEncoder::default(),
        RecordFormat::Fmp4,
        Some(AuthConfig {
            user: "viewer".into(),
            pass: "secret".into(),
        }),
    );
    h.record(t0(), 10);
    let uri = playback_uri(t0(), 5, "mp4");

    let (status, headers, _) = h.get(&uri).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers[header::WWW_AUTHENTICATE], "Basic realm=\"playback\"");

    let with_creds = |creds: &str| {
        Request::builder()
            .uri(&uri)
            .header(
                header::AUTHORIZATION,
                format!("Basic {}", STANDARD.encode(creds)),
            )
            .body(Body::empty())
            .unwrap()
    };

    let (status, headers, _) = send(h.app(), with_creds("viewer:wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(headers.get(header::WWW_AUTHENTICATE).is_none());

    let (status, _, _) = send(h.app(), with_creds("viewer:secret")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_forwarded_client_gets_own_job() {
    let h = Harness::new(FakeEncoder::default());
    h.record(t0(), 20);
    let uri = playback_uri(t0(), 10, "hls");

    let request = Request::builder()
        .uri(&uri)
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(h.app(), request).await.0, StatusCode::OK);
    assert_eq!(h.get(&uri).await.0, StatusCode::OK);

    // one job per client
    assert_eq!(h.encoder.runs(), 2);
    let token = compute_token("203.0.113.9", "cam", &t0(), Duration::from_secs(10));
    assert!(is_complete(&h.state.hls_dir(&token)));
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new(FakeEncoder::default());
    let (status, _, body) = h.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"OK");
}
