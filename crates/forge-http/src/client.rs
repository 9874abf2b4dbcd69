//! hyper-based JSON client.
//!
//! One HTTP/1.1 connection per request, optionally wrapped in TLS. Calls
//! are infrequent and long-polled, so there is no pooling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST, HeaderName, HeaderValue};
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{HttpError, HttpResult};
use crate::JsonTransport;

/// How server certificates are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Validate against the Mozilla root store.
    Verified,
    /// Accept any certificate. The install service ships self-signed certs.
    Insecure,
}

#[derive(Debug, Clone)]
pub struct ClientBuilder {
    tls: TlsMode,
    timeout: Duration,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl ClientBuilder {
    pub fn tls(mut self, mode: TlsMode) -> Self {
        self.tls = mode;
        self
    }

    /// Per-request deadline covering connect, send and body read.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn basic_auth(self, user: &str, password: &str) -> HttpResult<Self> {
        let token = BASE64.encode(format!("{user}:{password}"));
        self.header(AUTHORIZATION.as_str(), &format!("Basic {token}"))
    }

    /// Add a header sent with every request.
    pub fn header(mut self, name: &str, value: &str) -> HttpResult<Self> {
        let invalid = |reason: String| HttpError::InvalidUrl {
            url: format!("header {name}"),
            reason,
        };
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        self.headers.push((name, value));
        Ok(self)
    }

    pub fn build(self) -> HttpResult<HttpClient> {
        let tls = tls_config(self.tls).map_err(|reason| HttpError::Tls {
            url: String::new(),
            reason,
        })?;
        Ok(HttpClient {
            tls: tokio_rustls::TlsConnector::from(tls),
            timeout: self.timeout,
            headers: self.headers,
        })
    }
}

/// JSON client speaking HTTP/1.1 over plain TCP or rustls.
#[derive(Clone)]
pub struct HttpClient {
    tls: tokio_rustls::TlsConnector,
    timeout: Duration,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("timeout", &self.timeout)
            .field("headers", &self.headers.len())
            .finish()
    }
}

impl HttpClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder {
            tls: TlsMode::Verified,
            timeout: Duration::from_secs(60),
            headers: Vec::new(),
        }
    }

    async fn execute(&self, method: Method, url: &str, body: Option<&Value>) -> HttpResult<Option<Value>> {
        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| HttpError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let target = Target::from_uri(url, &uri)?;

        let payload = match body {
            Some(v) => Bytes::from(v.to_string()),
            None => Bytes::new(),
        };
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(target.path_and_query.as_str())
            .header(HOST, target.authority.as_str());
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(payload))
            .map_err(|e| HttpError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let exchange = self.round_trip(&target, request, url);
        let (status, reason, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| HttpError::Timeout {
                url: url.to_string(),
                after: self.timeout,
            })??;

        if status >= 400 {
            return Err(HttpError::Status {
                method: method.to_string(),
                url: url.to_string(),
                status,
                reason,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| HttpError::malformed(url, e.to_string()))
    }

    async fn round_trip(
        &self,
        target: &Target,
        request: Request<Full<Bytes>>,
        url: &str,
    ) -> HttpResult<(u16, String, Bytes)> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|source| HttpError::Connect {
                url: url.to_string(),
                source,
            })?;
        if !target.https {
            return send(TokioIo::new(stream), request, url).await;
        }

        let server_name = rustls::pki_types::ServerName::try_from(target.host.clone()).map_err(|e| {
            HttpError::Tls {
                url: url.to_string(),
                reason: e.to_string(),
            }
        })?;
        let tls = self
            .tls
            .connect(server_name, stream)
            .await
            .map_err(|source| HttpError::Connect {
                url: url.to_string(),
                source,
            })?;
        send(TokioIo::new(tls), request, url).await
    }
}

#[async_trait]
impl JsonTransport for HttpClient {
    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> HttpResult<Option<Value>> {
        debug!(%method, %url, "http request");
        self.execute(method, url, body).await
    }
}

async fn send<I>(io: I, request: Request<Full<Bytes>>, url: &str) -> HttpResult<(u16, String, Bytes)>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let request_err = |source| HttpError::Request {
        url: url.to_string(),
        source,
    };
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(request_err)?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let response = sender.send_request(request).await.map_err(request_err)?;
    let status = response.status();
    let reason = status.canonical_reason().unwrap_or_default().to_string();
    let bytes = response
        .into_body()
        .collect()
        .await
        .map_err(request_err)?
        .to_bytes();
    Ok((status.as_u16(), reason, bytes))
}

struct Target {
    https: bool,
    host: String,
    port: u16,
    authority: String,
    path_and_query: String,
}

impl Target {
    fn from_uri(url: &str, uri: &Uri) -> HttpResult<Self> {
        let invalid = |reason: &str| HttpError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };
        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(invalid("scheme must be http or https")),
        };
        let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;
        let port = authority.port_u16().unwrap_or(if https { 443 } else { 80 });
        Ok(Self {
            https,
            host: authority.host().trim_matches(['[', ']']).to_string(),
            port,
            authority: authority.as_str().to_string(),
            path_and_query: uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
        })
    }
}

fn tls_config(mode: TlsMode) -> Result<Arc<rustls::ClientConfig>, String> {
    let builder = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .map_err(|e| format!("tls protocol version error: {e}"))?;

    let config = match mode {
        TlsMode::Verified => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TlsMode::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
            .with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::{Classify, ErrorKind};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn one_shot_server(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn target_defaults_ports() {
        let uri: Uri = "https://cloud.example.org/v2.1/servers".parse().unwrap();
        let t = Target::from_uri("x", &uri).unwrap();
        assert!(t.https);
        assert_eq!(t.port, 443);
        assert_eq!(t.path_and_query, "/v2.1/servers");

        let uri: Uri = "ftp://h/".parse().unwrap();
        assert!(Target::from_uri("x", &uri).is_err());
    }

    #[test]
    fn both_tls_modes_build() {
        assert!(tls_config(TlsMode::Verified).is_ok());
        assert!(tls_config(TlsMode::Insecure).is_ok());
    }

    #[tokio::test]
    async fn sends_auth_and_custom_headers() {
        let (base, server) = one_shot_server(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\n\r\n{\"ok\":true}",
        )
        .await;
        let client = HttpClient::builder()
            .basic_auth("admin", "admin")
            .unwrap()
            .header("X-Requested-By", "stackforge")
            .unwrap()
            .build()
            .unwrap();

        let body = serde_json::json!({"Users": {"password": "p"}});
        let reply = client
            .send(Method::PUT, &format!("{base}/api/v1/users/admin"), Some(&body))
            .await
            .unwrap();
        assert_eq!(reply, Some(serde_json::json!({"ok": true})));

        let raw = server.await.unwrap().to_lowercase();
        assert!(raw.starts_with("put /api/v1/users/admin http/1.1"));
        assert!(raw.contains("authorization: basic ywrtaw46ywrtaw4="));
        assert!(raw.contains("x-requested-by: stackforge"));
    }

    #[tokio::test]
    async fn error_status_is_fatal_with_body() {
        let (base, _server) = one_shot_server(
            "HTTP/1.1 409 Conflict\r\ncontent-length: 9\r\n\r\nduplicate",
        )
        .await;
        let client = HttpClient::builder().build().unwrap();
        let err = client.send(Method::POST, &format!("{base}/api/v1/blueprints/b"), None).await.unwrap_err();
        assert_eq!(err.status(), Some(409));
        assert_eq!(err.kind(), ErrorKind::HttpStatus);
        assert!(err.to_string().contains("duplicate"));
    }

    #[tokio::test]
    async fn empty_body_is_none() {
        let (base, _server) = one_shot_server("HTTP/1.1 201 Created\r\ncontent-length: 0\r\n\r\n").await;
        let client = HttpClient::builder().build().unwrap();
        let reply = client.send(Method::POST, &format!("{base}/x"), None).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn truncated_json_is_malformed() {
        let (base, _server) = one_shot_server(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 22\r\n\r\n{\"href\": \"http://x/req",
        )
        .await;
        let client = HttpClient::builder().build().unwrap();
        let err = client.send(Method::POST, &format!("{base}/api/v1/clusters/c"), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
        assert!(err.kind().is_transient());
        assert!(err.to_string().contains("/api/v1/clusters/c"));
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClient::builder().build().unwrap();
        let err = client.send(Method::GET, &format!("http://{addr}/"), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.kind().is_transient());
    }
}
