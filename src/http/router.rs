//! The request router: classifies every incoming request by method and
//! path, and dispatches to sender registration, receiver registration, a
//! reserved-path handler, or CORS preflight.
//!
//! Two bugs present in the router this system was distilled from are fixed
//! here rather than reproduced: `/robots.txt` no longer falls through into
//! the receiver handler, and `OPTIONS` no longer falls through into the
//! unsupported-method branch after its preflight response.

use std::convert::Infallible;
use std::sync::Arc;

use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE,
};
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;

use super::reserved;
use super::Scheme;
use crate::body::{channel, channel_with_disconnect, disconnect_signal, ChannelBody};
use crate::cfg::ServerConfig;
use crate::err::RegistrationError;
use crate::pipe;
use crate::registry::{PathRegistry, SourceHeaders};

/// Channel capacity for a sender's own `[INFO]`/`[ERROR]` status stream.
/// Small: these are infrequent, tiny control lines, never the bulk transfer.
const INFO_CHANNEL_CAPACITY: usize = 16;

type RelayResponse = Response<ChannelBody>;

/// Entry point called once per request by the `hyper` service function.
pub(crate) async fn route(
    registry: Arc<PathRegistry>,
    config: Arc<ServerConfig>,
    scheme: Scheme,
    req: Request<Incoming>,
) -> Result<RelayResponse, Infallible> {
    let path = normalize_path(req.uri().path());
    let n = parse_n(req.uri().query());

    let response = match *req.method() {
        Method::POST | Method::PUT => {
            if reserved::is_reserved(&path) {
                reserved_path_rejection(&path)
            } else {
                register_sender(registry, path, n, req).await
            }
        }
        Method::GET => {
            if reserved::is_reserved(&path) {
                serve_reserved(&path, &config, scheme, &req)
            } else {
                register_receiver(registry, path, n, req).await
            }
        }
        Method::OPTIONS => cors_preflight(),
        ref other => unsupported_method(other),
    };

    Ok(response)
}

/// Resolves `path` against `/`, stripping any trailing slash except on the
/// root itself.
fn normalize_path(path: &str) -> String {
    let path = if path.is_empty() { "/" } else { path };
    if path == "/" {
        return "/".to_string();
    }
    path.trim_end_matches('/').to_string()
}

/// Reads the `n` query parameter, defaulting to `1` when absent or not a
/// valid integer (negative/zero values are passed through so the registry
/// can reject them with the correct error, per `spec.md` §9).
fn parse_n(query: Option<&str>) -> i64 {
    let Some(query) = query else { return 1 };
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "n")
        .and_then(|(_, value)| value.parse::<i64>().ok())
        .unwrap_or(1)
}

async fn register_sender(
    registry: Arc<PathRegistry>,
    path: String,
    n: i64,
    req: Request<Incoming>,
) -> RelayResponse {
    let headers = source_headers(&req);
    let is_multipart = headers
        .content_type
        .as_ref()
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("multipart/form-data"));

    let (info_tx, info_body, abort_rx) = channel_with_disconnect(INFO_CHANNEL_CAPACITY);
    let body = req.into_body();

    match registry.register_sender(path, n, info_tx, body, headers, is_multipart, abort_rx) {
        Ok(()) => Response::builder()
            .status(StatusCode::OK)
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(info_body)
            .expect("well-formed response"),
        Err(err) => registration_error_response(&err),
    }
}

async fn register_receiver(
    registry: Arc<PathRegistry>,
    path: String,
    n: i64,
    _req: Request<Incoming>,
) -> RelayResponse {
    let (data_tx, data_body) = channel(pipe::data_channel_capacity());
    let (guard, abort_rx) = disconnect_signal();

    let established_rx = match registry.register_receiver(path, n, data_tx, abort_rx) {
        Ok(rx) => rx,
        Err(err) => return registration_error_response(&err),
    };

    // Kept alive until establishment resolves: if this request's connection
    // is torn down while we wait, `hyper` drops this future (and `guard`
    // with it), signalling withdrawal.
    let headers = match established_rx.await {
        Ok(headers) => headers,
        Err(_) => SourceHeaders::default(),
    };
    drop(guard);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*");
    if let Some(value) = headers.content_length {
        builder = builder.header(CONTENT_LENGTH, value);
    }
    if let Some(value) = headers.content_type {
        builder = builder.header(CONTENT_TYPE, value);
    }
    if let Some(value) = headers.content_disposition {
        builder = builder.header(CONTENT_DISPOSITION, value);
    }
    builder.body(data_body).expect("well-formed response")
}

fn source_headers(req: &Request<Incoming>) -> SourceHeaders {
    SourceHeaders {
        content_length: req.headers().get(CONTENT_LENGTH).cloned(),
        content_type: req.headers().get(CONTENT_TYPE).cloned(),
        content_disposition: req.headers().get(CONTENT_DISPOSITION).cloned(),
    }
}

fn registration_error_response(err: &RegistrationError) -> RelayResponse {
    let message = match err {
        RegistrationError::NotPositive => {
            "[ERROR] The number of receivers must be a positive integer.\n".to_string()
        }
        RegistrationError::AlreadyEstablished { path } => {
            format!("[ERROR] The path '{path}' is already in use.\n")
        }
        RegistrationError::SenderAlreadyRegistered { path } => {
            format!("[ERROR] Another sender already registered for path '{path}'.\n")
        }
        RegistrationError::ReceiverCountMismatch { expected, offered } => {
            format!(
                "[ERROR] The number of receivers must be {expected}, but you specified {offered}.\n"
            )
        }
        RegistrationError::ReceiverLimitReached { path, limit } => {
            format!("[ERROR] The receiver limit ({limit}) for path '{path}' has already been reached.\n")
        }
    };
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(ChannelBody::once(message))
        .expect("well-formed response")
}

fn reserved_path_rejection(path: &str) -> RelayResponse {
    let message =
        format!("[ERROR] Cannot send to a reserved path '{path}'. (e.g. '/mypath123')\n");
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(ChannelBody::once(message))
        .expect("well-formed response")
}

fn serve_reserved(
    path: &str,
    config: &ServerConfig,
    scheme: Scheme,
    req: &Request<Incoming>,
) -> RelayResponse {
    match path {
        "/" => text_response(StatusCode::OK, "text/html", reserved::index_html()),
        "/version" => text_response(StatusCode::OK, "text/plain", reserved::version_text()),
        "/help" => {
            let scheme = resolve_scheme(scheme, req);
            let host = resolve_host(config, req);
            text_response(StatusCode::OK, "text/plain", reserved::help_text(scheme, &host))
        }
        "/favicon.ico" => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(ChannelBody::empty())
            .expect("well-formed response"),
        "/robots.txt" => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(ChannelBody::empty())
            .expect("well-formed response"),
        _ => unreachable!("serve_reserved only called for reserved::RESERVED_PATHS members"),
    }
}

fn resolve_scheme(scheme: Scheme, req: &Request<Incoming>) -> &'static str {
    if scheme == Scheme::Https {
        return "https";
    }
    let forwarded = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if forwarded.contains("https") {
        "https"
    } else {
        "http"
    }
}

fn resolve_host(config: &ServerConfig, req: &Request<Incoming>) -> String {
    req.headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| config.host_header_fallback.clone())
}

fn cors_preflight() -> RelayResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(ACCESS_CONTROL_ALLOW_METHODS, "GET, HEAD, POST, PUT, OPTIONS")
        .header(
            ACCESS_CONTROL_ALLOW_HEADERS,
            "Content-Type, Content-Disposition",
        )
        .header(ACCESS_CONTROL_MAX_AGE, "86400")
        .header(CONTENT_LENGTH, "0")
        .body(ChannelBody::empty())
        .expect("well-formed response")
}

fn unsupported_method(method: &Method) -> RelayResponse {
    let message = format!("[ERROR] Unsupported method: {method}.\n");
    Response::builder()
        .body(ChannelBody::once(message))
        .expect("well-formed response")
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> RelayResponse {
    let len = body.len();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_LENGTH, len.to_string())
        .body(ChannelBody::once(body))
        .expect("well-formed response")
}
