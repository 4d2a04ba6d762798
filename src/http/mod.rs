//! The HTTP listener: accepts connections and drives hyper's HTTP/1 server
//! over each one, dispatching every request to the [`router`].
//!
//! Structured the same way as a conventional hyper server: a small
//! [`HttpServerBuilder`] assembles the shared state once, [`HttpServer::serve`]
//! then runs forever over any `Stream` of accepted duplex connections,
//! tracking every per-connection task in a [`JoinSet`] so that one
//! connection panicking or erroring can never bring the listener down.

pub(crate) mod reserved;
pub(crate) mod router;

use std::convert::Infallible;
use std::sync::Arc;

use futures::Stream;
use futures::StreamExt;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tracing::warn;

use crate::cfg::ServerConfig;
use crate::err::BuilderError;
use crate::registry::PathRegistry;

/// Which scheme a listener should advertise in generated `/help` text, absent
/// an `x-forwarded-proto` override on a given request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// The assembled HTTP server, ready to [`serve`](HttpServer::serve) any
/// stream of accepted connections.
pub(crate) struct HttpServer {
    registry: Arc<PathRegistry>,
    config: Arc<ServerConfig>,
    scheme: Scheme,
}

/// Builder for [`HttpServer`].
#[derive(Default)]
pub(crate) struct HttpServerBuilder {
    registry: Option<Arc<PathRegistry>>,
    config: Option<Arc<ServerConfig>>,
    scheme: Option<Scheme>,
}

impl HttpServer {
    pub(crate) fn builder() -> HttpServerBuilder {
        HttpServerBuilder::default()
    }

    /// Runs the server endlessly over `listener`, never returning under
    /// normal operation.
    ///
    /// Every error that can occur happens inside a per-connection task and
    /// is logged there; this function itself never fails.
    pub(crate) async fn serve<I, S, E>(self, mut listener: I) -> Result<(), Infallible>
    where
        I: Stream<Item = Result<S, E>> + Unpin,
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        E: std::error::Error,
    {
        let mut connections: JoinSet<Result<(), hyper::Error>> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.next() => match accepted {
                    Some(Ok(stream)) => self.dispatch(&mut connections, stream),
                    Some(Err(err)) => {
                        warn!(scheme = self.scheme.as_str(), "listener accept failure: {err}");
                        continue;
                    }
                    None => {
                        warn!(scheme = self.scheme.as_str(), "listener stream ended");
                        return Ok(());
                    }
                },
                Some(result) = connections.join_next(), if !connections.is_empty() => match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!("connection task ended with an error: {err}"),
                    Err(err) => warn!("connection task panicked: {err}"),
                },
            }
        }
    }

    fn dispatch<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(
        &self,
        connections: &mut JoinSet<Result<(), hyper::Error>>,
        stream: S,
    ) {
        let stream = TokioIo::new(stream);
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);
        let scheme = self.scheme;
        let service = service_fn(move |req| {
            let registry = Arc::clone(&registry);
            let config = Arc::clone(&config);
            async move { router::route(registry, config, scheme, req).await }
        });

        connections.spawn(
            http1::Builder::new()
                .serve_connection(stream, service)
                .with_upgrades(),
        );
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use http::{Method, Request};
    use http_body_util::{BodyExt, Full};
    use hyper_util::rt::TokioIo;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_stream::wrappers::TcpListenerStream;

    use super::*;
    use crate::cfg::ServerConfig;

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            http_port: 0,
            https: None,
            host_header_fallback: "localhost".to_string(),
            log_level: None,
        })
    }

    /// Spawns a server over a fresh loopback listener and returns its address.
    async fn spawn_server() -> std::net::SocketAddr {
        let registry = Arc::new(PathRegistry::new());
        let server = HttpServer::builder()
            .registry(registry)
            .config(test_config())
            .scheme(Scheme::Http)
            .build()
            .expect("builder has every field set");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            server.serve(TcpListenerStream::new(listener)).await.ok();
        });
        addr
    }

    /// As [`connect`], but also returns the [`JoinHandle`](tokio::task::JoinHandle)
    /// driving the connection, so a test can forcibly tear the connection
    /// down (abort the handle) instead of waiting for a clean close.
    async fn connect_with_handle<B>(
        addr: std::net::SocketAddr,
    ) -> (
        hyper::client::conn::http1::SendRequest<B>,
        tokio::task::JoinHandle<()>,
    )
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (send, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        let handle = tokio::spawn(async move {
            let _ = conn.await;
        });
        (send, handle)
    }

    async fn connect(addr: std::net::SocketAddr) -> hyper::client::conn::http1::SendRequest<Full<Bytes>> {
        connect_with_handle(addr).await.0
    }

    async fn body_text<B>(body: B) -> String
    where
        B: http_body::Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Debug,
    {
        let collected = body.collect().await.expect("body collects").to_bytes();
        String::from_utf8(collected.to_vec()).expect("utf8 response body")
    }

    /// As [`body_text`], but stops draining (rather than panicking) the
    /// moment a frame comes back as an `Err` — for responses the server
    /// forcibly destroys mid-stream, where the trailing bytes already
    /// written are still the thing under test.
    async fn body_text_tolerating_destruction<B>(mut body: B) -> String
    where
        B: http_body::Body<Data = Bytes> + Unpin,
    {
        let mut collected = Vec::new();
        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        collected.extend_from_slice(&data);
                    }
                }
                Some(Err(_)) | None => break,
            }
        }
        String::from_utf8(collected).expect("utf8 response body")
    }

    #[tokio::test]
    async fn single_sender_single_receiver_round_trip() {
        let addr = spawn_server().await;

        let mut sender_conn = connect(addr).await;
        let mut receiver_conn = connect(addr).await;

        let sender_req = Request::builder()
            .method(Method::PUT)
            .uri("/foo")
            .body(Full::new(Bytes::from_static(b"hello")))
            .unwrap();
        let receiver_req = Request::builder()
            .method(Method::GET)
            .uri("/foo")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let (sender_resp, receiver_resp) = tokio::join!(
            sender_conn.send_request(sender_req),
            receiver_conn.send_request(receiver_req),
        );
        let sender_resp = sender_resp.unwrap();
        let receiver_resp = receiver_resp.unwrap();

        assert_eq!(receiver_resp.status(), http::StatusCode::OK);
        let received = timeout(Duration::from_secs(5), body_text(receiver_resp.into_body()))
            .await
            .unwrap();
        assert_eq!(received, "hello");

        let sender_log = timeout(Duration::from_secs(5), body_text(sender_resp.into_body()))
            .await
            .unwrap();
        assert!(sender_log.contains("Waiting for 1 receiver(s)"));
        assert!(sender_log.contains("Start sending with 1 receiver(s)!"));
        assert!(sender_log.contains("Sending successful!"));
    }

    #[tokio::test]
    async fn mismatched_receiver_count_is_rejected() {
        let addr = spawn_server().await;

        let mut sender_conn = connect(addr).await;
        let sender_req = Request::builder()
            .method(Method::POST)
            .uri("/baz?n=2")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let sender_resp = sender_conn.send_request(sender_req).await.unwrap();
        // Drain the waiting line so the connection task can proceed.
        tokio::spawn(body_text(sender_resp.into_body()));

        let mut receiver_conn = connect(addr).await;
        let receiver_req = Request::builder()
            .method(Method::GET)
            .uri("/baz?n=3")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let receiver_resp = receiver_conn.send_request(receiver_req).await.unwrap();
        assert_eq!(receiver_resp.status(), http::StatusCode::BAD_REQUEST);
        let body = body_text(receiver_resp.into_body()).await;
        assert!(body.contains("must be 2"));
        assert!(body.contains("you specified 3"));
    }

    #[tokio::test]
    async fn reserved_path_rejects_sender_registration() {
        let addr = spawn_server().await;
        let mut conn = connect(addr).await;
        let req = Request::builder()
            .method(Method::POST)
            .uri("/version")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = conn.send_request(req).await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::BAD_REQUEST);
        let body = body_text(resp.into_body()).await;
        assert_eq!(
            body,
            "[ERROR] Cannot send to a reserved path '/version'. (e.g. '/mypath123')\n"
        );
    }

    #[tokio::test]
    async fn favicon_and_robots_do_not_fall_through() {
        let addr = spawn_server().await;

        let mut conn = connect(addr).await;
        let req = Request::builder()
            .method(Method::GET)
            .uri("/favicon.ico")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = conn.send_request(req).await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::NO_CONTENT);

        let mut conn = connect(addr).await;
        let req = Request::builder()
            .method(Method::GET)
            .uri("/robots.txt")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = conn.send_request(req).await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn options_preflight_does_not_fall_through_to_unsupported_method() {
        let addr = spawn_server().await;
        let mut conn = connect(addr).await;
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/anything")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = conn.send_request(req).await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(
            resp.headers().get("access-control-allow-methods").unwrap(),
            "GET, HEAD, POST, PUT, OPTIONS"
        );
        let body = body_text(resp.into_body()).await;
        assert_eq!(body, "");
    }

    #[tokio::test]
    async fn multipart_sender_propagates_first_part_headers() {
        let addr = spawn_server().await;

        let mut sender_conn = connect(addr).await;
        let mut receiver_conn = connect(addr).await;

        let boundary = "X";
        let multipart_body = format!(
            "--{boundary}\r\n\
             Content-Disposition: attachment; filename=x.png\r\n\
             Content-Type: image/png\r\n\
             \r\n\
             PNGDATA\r\n\
             --{boundary}--\r\n"
        );
        let sender_req = Request::builder()
            .method(Method::POST)
            .uri("/m")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .body(Full::new(Bytes::from(multipart_body)))
            .unwrap();
        let receiver_req = Request::builder()
            .method(Method::GET)
            .uri("/m")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let (sender_resp, receiver_resp) = tokio::join!(
            sender_conn.send_request(sender_req),
            receiver_conn.send_request(receiver_req),
        );
        let sender_resp = sender_resp.unwrap();
        let receiver_resp = receiver_resp.unwrap();

        assert_eq!(
            receiver_resp.headers().get("content-type").unwrap(),
            "image/png"
        );
        assert_eq!(
            receiver_resp.headers().get("content-disposition").unwrap(),
            "attachment; filename=x.png"
        );

        let received = timeout(Duration::from_secs(5), body_text(receiver_resp.into_body()))
            .await
            .unwrap();
        assert_eq!(received, "PNGDATA");

        let sender_log = timeout(Duration::from_secs(5), body_text(sender_resp.into_body()))
            .await
            .unwrap();
        assert!(sender_log.contains("Sending successful!"));
    }

    /// `spec.md` §6 scenario 2: two receivers connect before the sender, and
    /// the sender sees a connection notice for each of them, in order,
    /// before the transfer starts.
    #[tokio::test]
    async fn two_receivers_connect_before_sender() {
        let addr = spawn_server().await;

        let mut receiver1_conn = connect(addr).await;
        let mut receiver2_conn = connect(addr).await;
        let mut sender_conn = connect(addr).await;

        let receiver_req = || {
            Request::builder()
                .method(Method::GET)
                .uri("/bar?n=2")
                .body(Full::new(Bytes::new()))
                .unwrap()
        };

        let receiver1_fut = receiver1_conn.send_request(receiver_req());
        let receiver2_fut = receiver2_conn.send_request(receiver_req());
        // Give both receivers a moment to land in the pending rendezvous
        // before the sender arrives, so the sender observes two distinct
        // connection notices rather than racing the sender's own arrival.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sender_req = Request::builder()
            .method(Method::POST)
            .uri("/bar?n=2")
            .body(Full::new(Bytes::from_static(b"abc")))
            .unwrap();
        let sender_fut = sender_conn.send_request(sender_req);

        let (receiver1_resp, receiver2_resp, sender_resp) =
            tokio::join!(receiver1_fut, receiver2_fut, sender_fut);
        let receiver1_resp = receiver1_resp.unwrap();
        let receiver2_resp = receiver2_resp.unwrap();
        let sender_resp = sender_resp.unwrap();

        let received1 = timeout(Duration::from_secs(5), body_text(receiver1_resp.into_body()))
            .await
            .unwrap();
        let received2 = timeout(Duration::from_secs(5), body_text(receiver2_resp.into_body()))
            .await
            .unwrap();
        assert_eq!(received1, "abc");
        assert_eq!(received2, "abc");

        let sender_log = timeout(Duration::from_secs(5), body_text(sender_resp.into_body()))
            .await
            .unwrap();
        let connected_at: Vec<_> = sender_log
            .match_indices("[INFO] A receiver was connected.")
            .map(|(idx, _)| idx)
            .collect();
        assert_eq!(connected_at.len(), 2);
        let start_sending_at = sender_log
            .find("Start sending with 2 receiver(s)!")
            .expect("start-sending line present");
        assert!(connected_at.iter().all(|&idx| idx < start_sending_at));
    }

    /// `spec.md` §6 scenario 6: a sole receiver drops before any payload
    /// reaches it; the sender sees the "closed halfway" message and its own
    /// connection is then forcibly destroyed.
    #[tokio::test]
    async fn sole_receiver_disconnect_mid_stream_destroys_sender() {
        let addr = spawn_server().await;

        // A slow, multi-chunk sender body: each chunk only becomes available
        // after a short delay, giving the test a window to tear the receiver
        // down before any of it is actually delivered. Sent over its own
        // connection (handshake inferring its body type from `sender_req`
        // below), since this is not `Full<Bytes>` like `connect()` assumes.
        let sender_stream = TcpStream::connect(addr).await.unwrap();
        let (mut sender_conn, sender_conn_driver) =
            hyper::client::conn::http1::handshake(TokioIo::new(sender_stream))
                .await
                .unwrap();
        tokio::spawn(async move {
            let _ = sender_conn_driver.await;
        });

        let chunks: Vec<&'static str> = vec!["hello-", "world-", "never-arrives-"];
        let stream = futures::stream::unfold(chunks.into_iter(), |mut remaining| async move {
            let chunk = remaining.next()?;
            tokio::time::sleep(Duration::from_millis(30)).await;
            Some((
                Ok::<_, std::convert::Infallible>(http_body::Frame::data(Bytes::from_static(
                    chunk.as_bytes(),
                ))),
                remaining,
            ))
        });
        let sender_req = Request::builder()
            .method(Method::PUT)
            .uri("/q")
            .body(http_body_util::StreamBody::new(stream))
            .unwrap();
        let sender_fut = sender_conn.send_request(sender_req);

        let (mut receiver_send, receiver_handle) = connect_with_handle::<Full<Bytes>>(addr).await;
        let receiver_req = Request::builder()
            .method(Method::GET)
            .uri("/q")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let receiver_resp = timeout(
            Duration::from_secs(5),
            receiver_send.send_request(receiver_req),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(receiver_resp.status(), http::StatusCode::OK);

        // Established, but torn down before the first (still 30ms away)
        // chunk can reach it.
        drop(receiver_resp);
        receiver_handle.abort();
        drop(receiver_send);

        let sender_resp = timeout(Duration::from_secs(5), sender_fut)
            .await
            .unwrap()
            .unwrap();
        let sender_log = timeout(
            Duration::from_secs(5),
            body_text_tolerating_destruction(sender_resp.into_body()),
        )
        .await
        .unwrap();
        assert!(sender_log.contains("All receiver(s) was/were closed halfway."));
    }
}

impl HttpServerBuilder {
    pub(crate) fn registry(mut self, registry: Arc<PathRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub(crate) fn config(mut self, config: Arc<ServerConfig>) -> Self {
        self.config = Some(config);
        self
    }

    pub(crate) fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = Some(scheme);
        self
    }

    pub(crate) fn build(self) -> Result<HttpServer, BuilderError> {
        Ok(HttpServer {
            registry: self.registry.ok_or(BuilderError::MissingField("registry"))?,
            config: self.config.ok_or(BuilderError::MissingField("config"))?,
            scheme: self.scheme.ok_or(BuilderError::MissingField("scheme"))?,
        })
    }
}
