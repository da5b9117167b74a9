//! Upstream server used by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use hyperdial::client::{Client, ClientConfig};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub const ANYTHING: &str = r#"{"id":1,"desc":"anything"}"#;

/// How long `/slow` stalls before answering.
pub const STALL: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: u64,
    pub desc: String,
}

#[derive(Debug, Default)]
struct State {
    hits: Mutex<HashMap<String, usize>>,
}

impl State {
    fn hit(&self, path: &str) -> usize {
        let mut hits = self.hits.lock().unwrap();
        let count = hits.entry(path.to_owned()).or_default();
        *count += 1;
        *count
    }
}

/// An HTTP/1 server on a random local port.
pub struct Upstream {
    addr: SocketAddr,
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl Upstream {
    pub async fn start() -> Self {
        Self::spawn(None).await
    }

    /// Serve HTTPS with the `example.com` certificate signed by the test root.
    #[cfg(feature = "tls")]
    pub async fn start_tls() -> Self {
        let acceptor = tokio_rustls::TlsAcceptor::from(std::sync::Arc::new(tls::server_config()));
        Self::spawn(Some(acceptor)).await
    }

    #[cfg(feature = "tls")]
    async fn spawn(tls: Option<tokio_rustls::TlsAcceptor>) -> Self {
        Self::listen(move |stream, state| {
            let tls = tls.clone();
            async move {
                match tls {
                    Some(acceptor) => {
                        if let Ok(stream) = acceptor.accept(stream).await {
                            serve(stream, state).await;
                        }
                    }
                    None => serve(stream, state).await,
                }
            }
        })
        .await
    }

    #[cfg(not(feature = "tls"))]
    async fn spawn(_tls: Option<()>) -> Self {
        Self::listen(serve::<TcpStream>).await
    }

    async fn listen<F, Fut>(handle: F) -> Self
    where
        F: Fn(TcpStream, Arc<State>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());

        let task = tokio::spawn({
            let state = state.clone();
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    tokio::spawn(handle(stream, state.clone()));
                }
            }
        });

        Self { addr, state, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// URL for a server started with `start_tls`, naming the certificate's host.
    pub fn tls_url(&self, path: &str) -> String {
        format!("https://example.com:{}{}", self.addr.port(), path)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of requests received for `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.state
            .hits
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or_default()
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<IO>(stream: IO, state: Arc<State>)
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |req| {
        let state = state.clone();
        async move { route(&state, req).await }
    });
    let _ = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await;
}

async fn route(state: &State, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_owned();
    let hit = state.hit(&path);

    let response = match path.as_str() {
        "/anything" => reply(StatusCode::OK, ANYTHING),
        "/error" => reply(StatusCode::INTERNAL_SERVER_ERROR, "ERROR"),
        "/not-found" => reply(StatusCode::NOT_FOUND, "no such thing"),
        "/unauthorized" => reply(StatusCode::UNAUTHORIZED, "who are you"),
        "/forbidden" => reply(StatusCode::FORBIDDEN, "go away"),
        "/unprocessable" => reply(StatusCode::UNPROCESSABLE_ENTITY, r#"{"field":"id"}"#),
        "/empty-response" => reply(StatusCode::OK, ""),
        "/not-json" => reply(StatusCode::OK, "<html></html>"),
        "/slow" => {
            tokio::time::sleep(STALL).await;
            reply(StatusCode::OK, ANYTHING)
        }
        "/slow-retry" => {
            // Only the first request stalls.
            if hit == 1 {
                tokio::time::sleep(STALL).await;
            }
            reply(StatusCode::OK, ANYTHING)
        }
        "/echo" => {
            let method = req.method().to_string();
            let authorization = req
                .headers()
                .get(http::header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            let body = req
                .into_body()
                .collect()
                .await
                .map(|body| body.to_bytes())
                .unwrap_or_default();
            let body: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            let echo = serde_json::json!({
                "method": method,
                "authorization": authorization,
                "body": body,
            });
            reply(StatusCode::OK, echo.to_string())
        }
        _ => reply(StatusCode::NOT_FOUND, ""),
    };

    Ok(response)
}

fn reply(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .unwrap()
}

/// A server which sends a response head and part of the body, then stalls.
pub struct Truncated {
    addr: SocketAddr,
    hits: Arc<std::sync::atomic::AtomicUsize>,
    task: JoinHandle<()>,
}

impl Truncated {
    pub async fn start() -> Self {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let hits = hits.clone();
            async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let _ = stream.read(&mut buf).await;
                        let _ = stream
                            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 30\r\n\r\n{\"id\":")
                            .await;
                        tokio::time::sleep(STALL * 5).await;
                    });
                }
            }
        });

        Self { addr, hits, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}/truncated", self.addr)
    }

    /// Number of connections accepted.
    pub fn hits(&self) -> usize {
        self.hits.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Drop for Truncated {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A local address with nothing listening on it.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Client with a generous default timeout; tests which need a short one
/// pass it per request.
pub fn client(config: ClientConfig) -> Client {
    Client::new(config.with_timeout(Duration::from_secs(30))).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Log output collected by [`capture_logs`].
#[derive(Debug, Clone, Default)]
pub struct Logs(Arc<Mutex<Vec<u8>>>);

impl Logs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for Logs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Collect debug logs emitted on this thread until the guard is dropped.
pub fn capture_logs() -> (Logs, tracing::subscriber::DefaultGuard) {
    let logs = Logs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer({
            let logs = logs.clone();
            move || logs.clone()
        })
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

#[cfg(feature = "tls")]
pub mod tls {
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};

    fn decode(pem: &[u8]) -> (&str, Vec<u8>) {
        pem_rfc7468::decode_vec(pem).unwrap()
    }

    fn provider() -> std::sync::Arc<rustls::crypto::CryptoProvider> {
        std::sync::Arc::new(rustls::crypto::ring::default_provider())
    }

    pub fn server_config() -> rustls::ServerConfig {
        let (_, cert) = decode(include_bytes!("../minica/example.com/cert.pem"));
        let (label, key) = decode(include_bytes!("../minica/example.com/key.pem"));

        let key = match label {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(key.into()),
            "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(key.into()),
            "EC PRIVATE KEY" => PrivateKeyDer::Sec1(key.into()),
            _ => panic!("unknown key type"),
        };

        let mut cfg = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![CertificateDer::from(cert)], key)
            .unwrap();
        cfg.alpn_protocols.push(b"http/1.1".to_vec());
        cfg
    }

    /// Client configuration trusting only the test root.
    pub fn client_config() -> rustls::ClientConfig {
        let mut roots = rustls::RootCertStore::empty();
        let (_, root) = decode(include_bytes!("../minica/minica.pem"));
        roots.add(CertificateDer::from(root)).unwrap();

        rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}
