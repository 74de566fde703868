use std::error::Error as StdError;
use std::time::{Duration, Instant};

use chrono::Utc;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::stats::RequestSample;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// A request as the workload describes it. The URL is already absolute.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Overrides the executor's default timeout.
    pub timeout: Option<Duration>,
    /// Grouping key for per-endpoint stats; defaults to the URL path.
    pub tag: Option<String>,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: None,
            tag: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    fn endpoint_tag(&self) -> String {
        if let Some(tag) = &self.tag {
            return tag.clone();
        }
        url::Url::parse(&self.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| self.url.clone())
    }

    fn approx_size(&self) -> usize {
        // request line + headers + blank line + body
        let mut size = self.method.as_str().len() + 1 + self.url.len() + 11;
        for (k, v) in &self.headers {
            size += k.as_str().len() + 2 + v.len() + 2;
        }
        size + 2 + self.body.len()
    }
}

/// Full response plus the sample describing it. Failed requests carry an
/// empty body and no headers.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub sample: RequestSample,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn status(&self) -> Option<u16> {
        self.sample.status
    }

    pub fn duration(&self) -> Duration {
        self.sample.duration
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

type BoxError = Box<dyn StdError + Send + Sync>;

/// Shared HTTP executor. Cloning is cheap and every clone uses the same
/// connection pool.
#[derive(Clone)]
pub struct HttpExecutor {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    default_timeout: Duration,
}

impl HttpExecutor {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_pool_and_workers(2000, 1000, DEFAULT_TIMEOUT)
    }

    /// pool_size: maximum idle connections per host.
    /// At high worker counts (>5K), use smaller HTTP/2 windows to reduce memory.
    pub fn with_pool_and_workers(
        pool_size: usize,
        total_workers: usize,
        default_timeout: Duration,
    ) -> anyhow::Result<Self> {
        // Only the ring provider is compiled in; installing twice is harmless.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let (conn_window, stream_window) = if total_workers > 5000 {
            (128 * 1024, 64 * 1024)
        } else if total_workers > 2000 {
            (256 * 1024, 128 * 1024)
        } else {
            (512 * 1024, 256 * 1024)
        };

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_size)
            .http2_initial_connection_window_size(conn_window)
            .http2_initial_stream_window_size(stream_window)
            .build(https);

        Ok(Self {
            client,
            default_timeout,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Perform the request and describe the outcome. Never fails: DNS errors,
    /// refused connections and timeouts come back as a sample with no status
    /// and the error set. The duration spans dispatch to the last body byte.
    // Must be called inside a Tokio Runtime
    pub async fn execute(&self, spec: RequestSpec) -> HttpResponse {
        let endpoint_tag = spec.endpoint_tag();
        let bytes_sent = spec.approx_size();
        let method = spec.method.to_string();
        let timeout = spec.timeout.unwrap_or(self.default_timeout);

        let started_at = Utc::now();
        let start = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.send(spec)).await;
        let duration = start.elapsed();

        let mut sample = RequestSample {
            endpoint_tag,
            method,
            started_at,
            duration,
            status: None,
            error: None,
            bytes_sent,
            bytes_received: 0,
        };

        match outcome {
            Ok(Ok((parts, body))) => {
                // Status line: HTTP/1.1 STATUS REASON\r\n (approx 15 chars)
                let mut received = 15 + body.len() + 2;
                for (k, v) in &parts.headers {
                    received += k.as_str().len() + 2 + v.len() + 2;
                }
                sample.status = Some(parts.status.as_u16());
                sample.bytes_received = received;
                HttpResponse {
                    sample,
                    headers: parts.headers,
                    body,
                }
            }
            Ok(Err(err)) => {
                sample.error = Some(describe(err.as_ref()));
                failed(sample)
            }
            Err(_) => {
                sample.error = Some(format!("request timeout after {:?}", timeout));
                failed(sample)
            }
        }
    }

    async fn send(&self, spec: RequestSpec) -> Result<(http::response::Parts, Bytes), BoxError> {
        let mut builder = Request::builder().method(spec.method).uri(spec.url);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(spec.headers);
        }
        let req = builder.body(Full::new(spec.body))?;

        let response = self.client.request(req).await?;
        let (parts, body) = response.into_parts();
        // Always read the body to completion so the connection can be reused.
        let body = body.collect().await?.to_bytes();
        Ok((parts, body))
    }
}

fn failed(sample: RequestSample) -> HttpResponse {
    HttpResponse {
        sample,
        headers: HeaderMap::new(),
        body: Bytes::new(),
    }
}

/// Flatten an error and its sources into one line. hyper's top-level
/// messages ("client error (Connect)") are useless without the chain.
fn describe(err: &(dyn StdError + 'static)) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !msg.contains(&text) {
            msg.push_str(": ");
            msg.push_str(&text);
        }
        source = cause.source();
    }
    msg
}
