//! The HLS origin server. One hyper service routes the whole surface:
//! player page, static assets, playlists, init/media segments and the
//! log-forward endpoint, all nested under an unguessable random path.
//!
//! Status semantics clients rely on: 404 means "this segment rolled out
//! of the window, refresh the playlist"; 410 means "your URL namespace is
//! dead, reload the page to pick up a new random path".

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::http::response::Builder;
use hyper::server::conn::http1;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::fs::File;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;

use crate::egress::hls::HlsPublisher;
use crate::logsink::LogSink;
use crate::player::{PlayerAssets, PlayerVars};

/// Idle/slow connections are cut after this long.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

pub const MIME_HLS: &str = "application/vnd.apple.mpegurl";
pub const MIME_MP4: &str = "video/mp4";

/// 8 alphanumeric characters from the thread-local CSPRNG; knowing the
/// URL is the only access control there is.
pub fn generate_random_path() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

pub struct ServerState {
    pub random_path: String,
    pub publisher: Arc<HlsPublisher>,
    pub player: PlayerAssets,
    pub log_sink: Option<Arc<LogSink>>,
    pub port: u16,
    pub app_title: String,
    /// How long after end-of-stream the namespace keeps serving the final
    /// playlist before switching to 410.
    pub end_grace: Duration,
}

impl ServerState {
    fn stream_base(&self) -> String {
        format!("/stream/{}", self.random_path)
    }
}

#[derive(Clone)]
pub struct HttpServer {
    state: Arc<ServerState>,
}

impl HttpServer {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

type ResponseBody = BoxBody<Bytes, anyhow::Error>;

fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into()).map_err(|e| match e {}).boxed()
}

fn base_response(status: StatusCode) -> Builder {
    Response::builder()
        .status(status)
        .header("server", "selfcast")
        .header("access-control-allow-origin", "*")
}

fn empty(status: StatusCode) -> Result<Response<ResponseBody>> {
    Ok(base_response(status).body(BoxBody::default())?)
}

fn text(status: StatusCode, content_type: &str, body: String) -> Result<Response<ResponseBody>> {
    Ok(base_response(status)
        .header("content-type", content_type)
        .header("cache-control", "no-cache")
        .body(full_body(body))?)
}

fn media(bytes: Bytes) -> Result<Response<ResponseBody>> {
    Ok(base_response(StatusCode::OK)
        .header("content-type", MIME_MP4)
        .body(full_body(bytes))?)
}

fn not_found() -> Result<Response<ResponseBody>> {
    empty(StatusCode::NOT_FOUND)
}

fn gone() -> Result<Response<ResponseBody>> {
    empty(StatusCode::GONE)
}

pub async fn handle<B>(state: Arc<ServerState>, req: Request<B>) -> Result<Response<ResponseBody>>
where
    B: Body<Data = Bytes> + Send,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    if method == Method::OPTIONS {
        return Ok(base_response(StatusCode::OK)
            .header("access-control-allow-headers", "*")
            .header("access-control-allow-methods", "GET, POST, OPTIONS")
            .body(BoxBody::default())?);
    }

    if method == Method::POST && path == "/forward-log" {
        return forward_log(state, req).await;
    }

    if method != Method::GET {
        return empty(StatusCode::METHOD_NOT_ALLOWED);
    }

    match path.as_str() {
        "/" | "/view" => {
            return Ok(base_response(StatusCode::FOUND)
                .header("location", format!("/view/{}", state.random_path))
                .body(BoxBody::default())?);
        }
        _ => {}
    }

    if let Some(token) = path.strip_prefix("/view/") {
        return view_page(&state, token);
    }
    if path.starts_with("/css/") || path.starts_with("/js/") || path.starts_with("/images/") {
        return static_asset(&state, &path).await;
    }
    if let Some(rest) = path.strip_prefix("/stream/") {
        return stream_route(&state, rest);
    }
    #[cfg(feature = "debug-validate")]
    if path.starts_with("/debug/validate") {
        return debug_validate(&state);
    }

    not_found()
}

fn namespace_gone(state: &ServerState) -> bool {
    state.publisher.ended_longer_than(state.end_grace)
}

fn view_page(state: &ServerState, token: &str) -> Result<Response<ResponseBody>> {
    if token != state.random_path || namespace_gone(state) {
        return gone();
    }
    let html = state.player.render_player(&PlayerVars {
        app_title: &state.app_title,
        page_title: &state.app_title,
        stream_url: &format!("{}/master.m3u8", state.stream_base()),
        server_port: state.port,
        initial_status: "Connecting",
    });
    Ok(base_response(StatusCode::OK)
        .header("content-type", "text/html; charset=utf-8")
        .header("cache-control", "no-cache")
        .body(full_body(html))?)
}

fn stream_route(state: &ServerState, rest: &str) -> Result<Response<ResponseBody>> {
    let (token, tail) = match rest.split_once('/') {
        Some(parts) => parts,
        None => return not_found(),
    };
    // No wildcarding across path regenerations: anything but the live
    // token is dead, including this server's own previous paths.
    if token != state.random_path || namespace_gone(state) {
        return gone();
    }

    match tail {
        "master.m3u8" => match state.publisher.master_playlist(&state.stream_base()) {
            Some(playlist) => text(StatusCode::OK, MIME_HLS, playlist),
            None => not_found(),
        },
        "playlist.m3u8" => match state.publisher.media_playlist(&state.stream_base()) {
            Some(playlist) => text(StatusCode::OK, MIME_HLS, playlist),
            None => not_found(),
        },
        "init.mp4" => match state.publisher.init_segment() {
            Some(bytes) => media(bytes),
            None => not_found(),
        },
        _ => match tail.strip_prefix("segments/") {
            // Not in the window (anymore) is a 404: the client lagged and
            // needs a fresh playlist, not a reload.
            Some(name) => match state.publisher.segment(name) {
                Some(bytes) => media(bytes),
                None => not_found(),
            },
            None => not_found(),
        },
    }
}

async fn static_asset(state: &ServerState, path: &str) -> Result<Response<ResponseBody>> {
    let Some(asset) = state.player.asset_path(path) else {
        return not_found();
    };
    let file = match File::open(&asset).await {
        Ok(file) => file,
        Err(_) => return not_found(),
    };
    let mime = mime_guess::from_path(&asset).first_or_octet_stream();
    let stream = ReaderStream::new(file);
    let body = StreamBody::new(stream.map_ok(Frame::data).map_err(anyhow::Error::new)).boxed();
    Ok(base_response(StatusCode::OK)
        .header("content-type", mime.as_ref())
        .header("cache-control", "max-age=3600")
        .body(body)?)
}

async fn forward_log<B>(state: Arc<ServerState>, req: Request<B>) -> Result<Response<ResponseBody>>
where
    B: Body<Data = Bytes> + Send,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(anyhow::Error::new)?
        .to_bytes();
    let message = String::from_utf8_lossy(&body);
    match &state.log_sink {
        Some(sink) => sink.send("JS", message.trim()),
        None => debug!("JS|{}", message.trim()),
    }
    empty(StatusCode::OK)
}

#[cfg(feature = "debug-validate")]
fn debug_validate(state: &ServerState) -> Result<Response<ResponseBody>> {
    use crate::mux::validate::{
        check_continuity, check_playlist_matches_window, inspect_init_segment,
        inspect_media_segment,
    };
    use std::fmt::Write as _;

    let mut report = String::new();
    match state.publisher.init_segment() {
        Some(init) => match inspect_init_segment(&init) {
            Ok(r) => {
                let _ = writeln!(
                    report,
                    "init: ok ({} bytes, brands {:?}, tracks {:?}, codec {:?})",
                    init.len(),
                    r.compatible_brands,
                    r.track_ids,
                    r.video_codec
                );
            }
            Err(e) => {
                let _ = writeln!(report, "init: INVALID: {}", e);
            }
        },
        None => {
            let _ = writeln!(report, "init: not yet published");
        }
    }

    let mut previous = None;
    for name in state.publisher.window_filenames() {
        let Some(bytes) = state.publisher.segment(&name) else {
            let _ = writeln!(report, "{}: vanished from the window mid-walk", name);
            continue;
        };
        match inspect_media_segment(&bytes) {
            Ok(r) => {
                let _ = writeln!(
                    report,
                    "{}: ok (seq {}, tfdt {}, {} samples, {} bytes)",
                    name,
                    r.sequence_number,
                    r.base_media_decode_time,
                    r.sample_count,
                    bytes.len()
                );
                if let Some(prev) = &previous {
                    if let Err(e) = check_continuity(prev, &r) {
                        let _ = writeln!(report, "{}: CONTINUITY: {}", name, e);
                    }
                }
                previous = Some(r);
            }
            Err(e) => {
                let _ = writeln!(report, "{}: INVALID: {}", name, e);
            }
        }
    }

    if let Some(playlist) = state.publisher.media_playlist(&state.stream_base()) {
        let window = state.publisher.window_filenames();
        match check_playlist_matches_window(&playlist, &window) {
            Ok(()) => {
                let _ = writeln!(report, "playlist: matches window ({} segments)", window.len());
            }
            Err(e) => {
                let _ = writeln!(report, "playlist: MISMATCH: {}", e);
            }
        }
    }

    text(StatusCode::OK, "text/plain; charset=utf-8", report)
}

impl Service<Request<Incoming>> for HttpServer {
    type Response = Response<ResponseBody>;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let state = self.state.clone();
        Box::pin(async move {
            match handle(state, req).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    error!("Request handling failed: {}", e);
                    Ok(base_response(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(BoxBody::default())?)
                }
            }
        })
    }
}

/// Accept loop. Per-connection failures are logged and dropped; the loop
/// itself never exits on them.
pub async fn listen(listener: TcpListener, server: HttpServer) -> Result<()> {
    info!("HTTP server listening on {}", listener.local_addr()?);
    loop {
        let (socket, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };
        let io = TokioIo::new(socket);
        let server = server.clone();
        tokio::spawn(async move {
            let conn = http1::Builder::new().serve_connection(io, server);
            match tokio::time::timeout(CONNECTION_TIMEOUT, conn).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Connection error from {}: {}", remote, e),
                Err(_) => debug!("Connection from {} timed out", remote),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::hls::{Segment, StreamInfo};
    use crate::player::PLAYER_TEMPLATE;
    use chrono::Utc;
    use http_body_util::Empty;

    fn state_with(
        publisher: Arc<HlsPublisher>,
        log_sink: Option<Arc<LogSink>>,
        end_grace: Duration,
    ) -> (tempfile::TempDir, Arc<ServerState>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PLAYER_TEMPLATE),
            "<html><title>{{PAGE_TITLE}}</title>{{STREAM_URL}}</html>",
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("css/style.css"), "body{}").unwrap();

        let state = Arc::new(ServerState {
            random_path: "Ab12Cd34".to_string(),
            publisher,
            player: PlayerAssets::load(dir.path()).unwrap(),
            log_sink,
            port: 8080,
            app_title: "selfcast".to_string(),
            end_grace,
        });
        (dir, state)
    }

    fn live_publisher() -> Arc<HlsPublisher> {
        let publisher = Arc::new(HlsPublisher::new(3, 1.0));
        publisher.publish_init(
            Bytes::from_static(b"init-bytes"),
            StreamInfo {
                codecs: "avc1.640020".to_string(),
                width: 960,
                height: 540,
                frame_rate: 15.0,
                bandwidth: 2_000_000,
            },
        );
        publisher.publish_segment(Segment {
            filename: "segment_0.m4s".to_string(),
            sequence_number: 0,
            bytes: Bytes::from_static(b"segment-bytes"),
            duration_seconds: 1.0,
            created_at: Utc::now(),
        });
        publisher
    }

    fn get(path: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Empty::new())
            .unwrap()
    }

    async fn body_text(response: Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn root_redirects_to_the_random_path() {
        let (_dir, state) = state_with(live_publisher(), None, Duration::from_secs(10));
        let response = handle(state, get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "/view/Ab12Cd34"
        );
    }

    #[tokio::test]
    async fn playlist_is_served_uncached() {
        let (_dir, state) = state_with(live_publisher(), None, Duration::from_secs(10));
        let response = handle(state, get("/stream/Ab12Cd34/playlist.m3u8"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), MIME_HLS);
        assert_eq!(
            response.headers().get("cache-control").unwrap(),
            "no-cache"
        );
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
        let body = body_text(response).await;
        assert!(body.contains("#EXT-X-MAP:URI=\"/stream/Ab12Cd34/init.mp4\""));
        assert!(body.contains("/stream/Ab12Cd34/segments/segment_0.m4s"));
    }

    #[tokio::test]
    async fn init_and_segments_are_mp4() {
        let (_dir, state) = state_with(live_publisher(), None, Duration::from_secs(10));
        let response = handle(state.clone(), get("/stream/Ab12Cd34/init.mp4"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), MIME_MP4);
        assert_eq!(body_text(response).await, "init-bytes");

        let response = handle(state, get("/stream/Ab12Cd34/segments/segment_0.m4s"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "segment-bytes");
    }

    #[tokio::test]
    async fn missing_segment_is_404() {
        let (_dir, state) = state_with(live_publisher(), None, Duration::from_secs(10));
        let response = handle(state, get("/stream/Ab12Cd34/segments/segment_9.m4s"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stale_random_path_is_410() {
        let (_dir, state) = state_with(live_publisher(), None, Duration::from_secs(10));
        let response = handle(state.clone(), get("/stream/OLDpath1/playlist.m3u8"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);

        let response = handle(state, get("/view/OLDpath1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn ended_stream_goes_410_after_grace() {
        let publisher = live_publisher();
        let (_dir, state) = state_with(publisher.clone(), None, Duration::ZERO);

        // while live: 200 with the playlist
        let response = handle(state.clone(), get("/stream/Ab12Cd34/playlist.m3u8"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        publisher.mark_ended();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let response = handle(state, get("/stream/Ab12Cd34/playlist.m3u8"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn ended_stream_serves_endlist_during_grace() {
        let publisher = live_publisher();
        let (_dir, state) = state_with(publisher.clone(), None, Duration::from_secs(60));
        publisher.mark_ended();

        let response = handle(state, get("/stream/Ab12Cd34/playlist.m3u8"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[tokio::test]
    async fn view_page_substitutes_the_stream_url() {
        let (_dir, state) = state_with(live_publisher(), None, Duration::from_secs(10));
        let response = handle(state, get("/view/Ab12Cd34")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("/stream/Ab12Cd34/master.m3u8"));
        assert!(!body.contains("{{"));
    }

    #[tokio::test]
    async fn static_assets_have_mime_and_caching() {
        let (_dir, state) = state_with(live_publisher(), None, Duration::from_secs(10));
        let response = handle(state, get("/css/style.css")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/css");
        assert_eq!(
            response.headers().get("cache-control").unwrap(),
            "max-age=3600"
        );
    }

    #[tokio::test]
    async fn options_answers_cors_preflight() {
        let (_dir, state) = state_with(live_publisher(), None, Duration::from_secs(10));
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/stream/Ab12Cd34/playlist.m3u8")
            .body(Empty::new())
            .unwrap();
        let response = handle(state, request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
        assert!(response.headers().contains_key("access-control-allow-methods"));
    }

    #[tokio::test]
    async fn forward_log_reaches_the_sink() {
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let sink = Arc::new(LogSink::new(&receiver.local_addr().unwrap().to_string()).unwrap());
        let (_dir, state) = state_with(live_publisher(), Some(sink), Duration::from_secs(10));

        let request = Request::builder()
            .method(Method::POST)
            .uri("/forward-log")
            .body(http_body_util::Full::new(Bytes::from_static(
                b"player error: stalled",
            )))
            .unwrap();
        let response = handle(state, request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut buf = [0u8; 128];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"JS|player error: stalled\n");
    }

    #[test]
    fn random_paths_are_8_alphanumeric_chars() {
        let path = generate_random_path();
        assert_eq!(path.len(), 8);
        assert!(path.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(generate_random_path(), generate_random_path());
    }
}
