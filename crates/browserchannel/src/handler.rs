use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::backchannel::BackChannel;
use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::cors;
use crate::error::{ChannelError, RequestError};
use crate::registry::{spawn_gc, ChannelMap};
use crate::session::SessionId;
use crate::wire;
use crate::SUPPORTED_PROTOCOL_VERSION;

/// How long the chunking probe holds the response open between its two
/// tokens so the client can detect buffering proxies.
const TEST_PHASE_DELAY: Duration = Duration::from_secs(2);

type ChannelCallback = Box<dyn Fn(Arc<Channel>) -> BoxFuture<'static, ()> + Send + Sync>;

/// The BrowserChannel HTTP entry point. Cheap to clone; all clones share the
/// session table and the GC loop. Build the axum service with [`router`].
///
/// [`router`]: ChannelServer::router
#[derive(Clone)]
pub struct ChannelServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    channels: Arc<ChannelMap>,
    gc_tx: mpsc::UnboundedSender<SessionId>,
    on_channel: ChannelCallback,
}

impl ChannelServer {
    /// Creates a server with the default configuration. `on_channel` runs in
    /// its own task for every newly created session. Must be called within a
    /// tokio runtime; the GC loop starts immediately.
    pub fn new<F, Fut>(on_channel: F) -> Self
    where
        F: Fn(Arc<Channel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_config(ServerConfig::default(), on_channel)
    }

    pub fn with_config<F, Fut>(config: ServerConfig, on_channel: F) -> Self
    where
        F: Fn(Arc<Channel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (gc_tx, gc_rx) = mpsc::unbounded_channel();
        let channels = Arc::new(ChannelMap::new());
        spawn_gc(Arc::clone(&channels), gc_rx);
        Self {
            inner: Arc::new(ServerInner {
                config,
                channels,
                gc_tx,
                on_channel: Box::new(move |channel| Box::pin(on_channel(channel))),
            }),
        }
    }

    /// Routes every request through the suffix dispatcher, so the returned
    /// router can be nested under any mount point.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", any(dispatch))
            .route("/*path", any(dispatch))
            .with_state(self.clone())
    }

    pub fn session_count(&self) -> usize {
        self.inner.channels.len()
    }
}

async fn dispatch(
    State(server): State<ChannelServer>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // The body is decoded on its own so the reqN_ map entries are never
    // coalesced with query parameters; bind and test parameters are read
    // from the query exclusively.
    let body_pairs: Vec<(String, String)> = form_urlencoded::parse(&body).into_owned().collect();
    let query_pairs: Vec<(String, String)> = uri
        .query()
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let cors_headers = server.cors_reply_headers(&headers);

    let path = uri.path();
    let mut response = if path.ends_with(&server.inner.config.test_path) {
        handle_test(&server, &query_pairs).unwrap_or_else(IntoResponse::into_response)
    } else if path.ends_with(&server.inner.config.bind_path) {
        handle_bind(&server, &method, &query_pairs, &body_pairs)
            .unwrap_or_else(IntoResponse::into_response)
    } else {
        StatusCode::NOT_FOUND.into_response()
    };

    response.headers_mut().extend(cors_headers);
    response
}

impl ChannelServer {
    /// Echoes `Access-Control-Allow-Origin`/`-Credentials` when the request
    /// origin matches the configured pattern.
    fn cors_reply_headers(&self, request_headers: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::new();
        let Some(cross_domain) = self.inner.config.cross_domain.as_ref() else {
            return out;
        };
        let Some(origin) = request_headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
        else {
            return out;
        };
        if !origin.is_empty() && cross_domain.allows_origin(origin) {
            if let Ok(value) = HeaderValue::from_str(origin) {
                out.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
                out.insert(
                    header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                    HeaderValue::from_static("true"),
                );
            }
        }
        out
    }

    /// Looks up an existing session or, when no SID was supplied, creates
    /// one: fresh id (re-drawn on the off chance of a collision), channel in
    /// Init with its session timer armed, and the application handler
    /// spawned.
    fn resolve_channel(
        &self,
        sid: Option<SessionId>,
        client_version: &str,
    ) -> Result<Arc<Channel>, RequestError> {
        if let Some(sid) = sid {
            return match self.inner.channels.get(&sid) {
                Some(channel) => Ok(channel),
                None => {
                    warn!(sid = %sid, "bind request for unknown session");
                    Err(RequestError::UnknownSession)
                }
            };
        }

        let mut sid = SessionId::generate();
        while self.inner.channels.contains(&sid) {
            sid = SessionId::generate();
        }
        let host_prefix = cors::host_prefix(self.inner.config.cross_domain.as_ref());
        let channel = Channel::new(
            sid,
            client_version.to_string(),
            host_prefix,
            self.inner.gc_tx.clone(),
            self.inner.config.timeouts.clone(),
        );
        self.inner.channels.insert(sid, Arc::clone(&channel));
        channel.arm_session_timer();
        info!(sid = %sid, cver = client_version, "created session");
        tokio::spawn((self.inner.on_channel)(Arc::clone(&channel)));
        Ok(channel)
    }
}

struct BindParams {
    sid: Option<SessionId>,
    qtype: String,
    domain: Option<String>,
    rid: String,
    aid: Option<u64>,
    chunked: bool,
    client_version: String,
}

fn parse_bind_params(query: &[(String, String)]) -> Result<BindParams, RequestError> {
    let sid = SessionId::parse(query_value(query, "SID").unwrap_or(""))?;
    let aid = match query_value(query, "AID") {
        None | Some("") | Some("-1") => None,
        Some(raw) => Some(
            raw.parse()
                .map_err(|_| RequestError::malformed("AID is not an integer"))?,
        ),
    };
    Ok(BindParams {
        sid,
        qtype: query_value(query, "TYPE").unwrap_or("").to_string(),
        domain: query_value(query, "DOMAIN").map(str::to_string),
        rid: query_value(query, "zx").unwrap_or("").to_string(),
        aid,
        chunked: query_value(query, "CI") == Some("0"),
        client_version: query_value(query, "VER").unwrap_or("").to_string(),
    })
}

fn handle_bind(
    server: &ChannelServer,
    method: &Method,
    query: &[(String, String)],
    body_pairs: &[(String, String)],
) -> Result<Response, RequestError> {
    let params = parse_bind_params(query)?;
    let channel = server.resolve_channel(params.sid, &params.client_version)?;

    if let Some(aid) = params.aid {
        channel.acknowledge_arrays(aid);
    }

    if *method == Method::POST {
        handle_bind_post(&channel, &params, body_pairs)
    } else if *method == Method::GET {
        Ok(handle_bind_get(&channel, &params))
    } else {
        Ok(StatusCode::BAD_REQUEST.into_response())
    }
}

/// Forward channel. The very first POST of a session doubles as the carrier
/// for the configuration array: it is answered with a single-shot back
/// channel instead of the usual status snapshot.
fn handle_bind_post(
    channel: &Arc<Channel>,
    params: &BindParams,
    body_pairs: &[(String, String)],
) -> Result<Response, RequestError> {
    let (offset, maps) = wire::decode_incoming_maps(body_pairs)?;
    match channel.receive_maps(offset, maps) {
        // A stale batch is the client retransmitting; it still gets the
        // status snapshot below.
        Ok(()) | Err(ChannelError::StaleOffset { .. }) => {}
        Err(err) => {
            warn!(sid = %channel.session_id(), error = %err, "rejecting forward maps");
            return Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
    }

    if channel.is_init() {
        let (back, body) = BackChannel::new(
            channel.session_id(),
            false,
            None,
            false,
            params.rid.clone(),
        );
        channel.set_back_channel(back);
        return Ok(streaming_response(false, body));
    }

    let snapshot = channel.state_snapshot();
    let json = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".into());
    debug!(sid = %channel.session_id(), snapshot = %json, "forward channel status reply");
    Ok((
        StatusCode::OK,
        no_cache_headers(false),
        wire::length_prefixed(&json),
    )
        .into_response())
}

/// Back channel, or termination when the client says goodbye.
fn handle_bind_get(channel: &Arc<Channel>, params: &BindParams) -> Response {
    if params.qtype == "terminate" {
        channel.terminate();
        return StatusCode::OK.into_response();
    }

    let is_html = params.qtype == "html";
    let (back, body) = BackChannel::new(
        channel.session_id(),
        is_html,
        params.domain.as_deref(),
        params.chunked,
        params.rid.clone(),
    );
    channel.set_back_channel(back);
    streaming_response(is_html, body)
}

fn handle_test(
    server: &ChannelServer,
    query: &[(String, String)],
) -> Result<Response, RequestError> {
    let version: i64 = query_value(query, "VER")
        .and_then(|v| v.parse().ok())
        .unwrap_or(-1);
    if version != i64::from(SUPPORTED_PROTOCOL_VERSION) {
        return Err(RequestError::UnsupportedVersion);
    }

    if query_value(query, "MODE") == Some("init") {
        let prefix = cors::host_prefix(server.inner.config.cross_domain.as_ref());
        let body = serde_json::json!([prefix, ""]).to_string();
        return Ok((StatusCode::OK, body).into_response());
    }

    let is_html = query_value(query, "TYPE") == Some("html");
    let domain = query_value(query, "DOMAIN").unwrap_or("").to_string();
    let (tx, rx) = mpsc::unbounded_channel::<Result<Bytes, Infallible>>();
    tokio::spawn(async move {
        let write = |text: String| tx.send(Ok(Bytes::from(text))).is_ok();
        if is_html {
            let mut head = String::from(wire::HTML_HEAD);
            if !domain.is_empty() {
                head.push_str(&wire::html_domain(&domain));
            }
            head.push_str(&wire::html_rpc("11111"));
            head.push_str(&wire::html_padding());
            if !write(head) {
                return;
            }
        } else if !write("11111".to_string()) {
            return;
        }
        tokio::time::sleep(TEST_PHASE_DELAY).await;
        if is_html {
            let mut tail = wire::html_rpc("2");
            tail.push_str(wire::html_done());
            write(tail);
        } else {
            write("2".to_string());
        }
    });
    let body = Body::from_stream(UnboundedReceiverStream::new(rx));
    Ok(streaming_response(is_html, body))
}

fn streaming_response(is_html: bool, body: Body) -> Response {
    (StatusCode::OK, no_cache_headers(is_html), body).into_response()
}

/// Headers every channel response carries so intermediaries neither cache
/// nor sniff the stream.
fn no_cache_headers(is_html: bool) -> [(header::HeaderName, HeaderValue); 5] {
    let content_type = if is_html {
        HeaderValue::from_static("text/html")
    } else {
        HeaderValue::from_static("text/plain")
    };
    [
        (header::CONTENT_TYPE, content_type),
        (
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, max-age=0, must-revalidate"),
        ),
        (
            header::EXPIRES,
            HeaderValue::from_static("Fri, 01 Jan 1990 00:00:00 GMT"),
        ),
        (
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ),
        (header::PRAGMA, HeaderValue::from_static("no-cache")),
    ]
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        match self {
            RequestError::UnknownSession => (
                StatusCode::BAD_REQUEST,
                no_cache_headers(false),
                "Unknown SID",
            )
                .into_response(),
            RequestError::UnsupportedVersion => {
                (StatusCode::BAD_REQUEST, "Unsupported protocol version.").into_response()
            }
            RequestError::Malformed(reason) => {
                debug!(reason = %reason, "malformed request");
                StatusCode::BAD_REQUEST.into_response()
            }
        }
    }
}

fn query_value<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
