//! Instrumented HTTP client capability handed to scenario tasks.
//!
//! Every request made through an [`HttpSession`] is bracketed with a monotonic
//! timer and emits exactly one [`RequestMetric`] into the worker's ring
//! buffer, whether the attempt succeeded or failed. The first use of each
//! logical endpoint name also registers its label on the shared label channel
//! so the aggregator can translate hashes back to printable names.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Response};

use crate::metrics::{fnv1a_hash, EndpointLabel, ErrorCategory, MethodCode, RequestMetric};
use crate::ring::RingProducer;
use crate::throttle::Throttle;
use crate::util;
use crate::ForgeError;

/// A failed request attempt, carrying the transport category recorded in the
/// metric emitted for the attempt.
#[derive(Debug)]
pub enum RequestError {
    /// The transport failed before a response arrived.
    Transport {
        category: ErrorCategory,
        source: reqwest::Error,
    },
    /// A scenario hook or task failed for a non-transport reason.
    Custom(String),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Transport { category, source } => {
                write!(f, "transport error ({:?}): {}", category, source)
            }
            RequestError::Custom(detail) => write!(f, "{}", detail),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RequestError::Transport { source, .. } => Some(source),
            RequestError::Custom(_) => None,
        }
    }
}

/// Map a reqwest failure onto the wire error categories.
pub(crate) fn categorize_error(error: &reqwest::Error) -> ErrorCategory {
    if error.is_timeout() {
        ErrorCategory::Timeout
    } else if error.is_connect() {
        if mentions_tls(error) {
            ErrorCategory::Tls
        } else {
            ErrorCategory::Connect
        }
    } else if error.is_body() || error.is_decode() {
        ErrorCategory::Read
    } else if error.is_request() {
        ErrorCategory::Write
    } else {
        ErrorCategory::Other
    }
}

// reqwest does not expose a TLS predicate; inspect the error chain.
fn mentions_tls(error: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(current) = source {
        let message = current.to_string().to_lowercase();
        if message.contains("tls") || message.contains("ssl") || message.contains("certificate") {
            return true;
        }
        source = current.source();
    }
    false
}

/// Where a session delivers metrics and label registrations. Shared by all
/// sessions of one worker, on that worker's thread.
pub(crate) struct MetricSink {
    producer: Rc<RingProducer>,
    labels: flume::Sender<EndpointLabel>,
    /// Endpoint names this worker has already registered.
    registered: Rc<RefCell<HashSet<u64>>>,
    /// Registrations lost to a full label channel, surfaced in diagnostics.
    dropped_labels: Arc<AtomicU64>,
}

impl MetricSink {
    pub(crate) fn new(
        producer: Rc<RingProducer>,
        labels: flume::Sender<EndpointLabel>,
        registered: Rc<RefCell<HashSet<u64>>>,
        dropped_labels: Arc<AtomicU64>,
    ) -> MetricSink {
        MetricSink {
            producer,
            labels,
            registered,
            dropped_labels,
        }
    }

    fn emit(&self, metric: &RequestMetric) {
        self.producer.push(metric);
    }

    fn register_label(&self, name: &str, method: MethodCode) {
        let hash = fnv1a_hash(name);
        if self.registered.borrow_mut().insert(hash) {
            // Labels are rare; a full channel drops the registration and the
            // aggregator falls back to displaying the hash.
            if self.labels.try_send(EndpointLabel::new(name, method)).is_err() {
                debug!("label channel full, dropping registration for {}", name);
                self.dropped_labels.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// An instrumented HTTP client bound to one virtual user.
///
/// Each session keeps its own cookie store, so users can log in and hold
/// sessions independently, while timing and metrics emission are uniform.
pub struct HttpSession {
    client: Client,
    base_url: String,
    worker_id: u8,
    /// Shared start instant all request timestamps are measured from.
    epoch: Instant,
    sink: MetricSink,
    throttle: Option<Rc<Throttle>>,
}

impl HttpSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        base_url: &str,
        default_headers: &std::collections::BTreeMap<String, String>,
        worker_id: u8,
        epoch: Instant,
        sink: MetricSink,
        throttle: Option<Rc<Throttle>>,
        request_timeout: Duration,
    ) -> Result<HttpSession, ForgeError> {
        let mut headers = HeaderMap::new();
        for (name, value) in default_headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ForgeError::InvalidOption {
                    option: "default_headers".to_string(),
                    value: name.clone(),
                    detail: e.to_string(),
                }
            })?;
            let header_value =
                HeaderValue::from_str(value).map_err(|e| ForgeError::InvalidOption {
                    option: "default_headers".to_string(),
                    value: value.clone(),
                    detail: e.to_string(),
                })?;
            headers.insert(header_name, header_value);
        }

        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .cookie_store(true)
            .pool_max_idle_per_host(100)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ForgeError::ClientBuild {
                detail: e.to_string(),
            })?;

        Ok(HttpSession {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            worker_id,
            epoch,
            sink,
            throttle,
        })
    }

    /// The absolute URL a request path resolves to.
    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub async fn get(&self, path: &str, name: &str) -> Result<Response, RequestError> {
        let builder = self.client.get(self.build_url(path));
        self.send(builder, MethodCode::Get, name).await
    }

    pub async fn post<B: Into<reqwest::Body>>(
        &self,
        path: &str,
        name: &str,
        body: B,
    ) -> Result<Response, RequestError> {
        let builder = self.client.post(self.build_url(path)).body(body);
        self.send(builder, MethodCode::Post, name).await
    }

    pub async fn put<B: Into<reqwest::Body>>(
        &self,
        path: &str,
        name: &str,
        body: B,
    ) -> Result<Response, RequestError> {
        let builder = self.client.put(self.build_url(path)).body(body);
        self.send(builder, MethodCode::Put, name).await
    }

    pub async fn patch<B: Into<reqwest::Body>>(
        &self,
        path: &str,
        name: &str,
        body: B,
    ) -> Result<Response, RequestError> {
        let builder = self.client.patch(self.build_url(path)).body(body);
        self.send(builder, MethodCode::Patch, name).await
    }

    pub async fn delete(&self, path: &str, name: &str) -> Result<Response, RequestError> {
        let builder = self.client.delete(self.build_url(path));
        self.send(builder, MethodCode::Delete, name).await
    }

    pub async fn head(&self, path: &str, name: &str) -> Result<Response, RequestError> {
        let builder = self.client.head(self.build_url(path));
        self.send(builder, MethodCode::Head, name).await
    }

    /// Build a request manually for per-request options, then execute it with
    /// [`HttpSession::send`].
    pub fn request_builder(&self, method: MethodCode, path: &str) -> RequestBuilder {
        let url = self.build_url(path);
        match method {
            MethodCode::Get => self.client.get(url),
            MethodCode::Post => self.client.post(url),
            MethodCode::Put => self.client.put(url),
            MethodCode::Patch => self.client.patch(url),
            MethodCode::Delete => self.client.delete(url),
            MethodCode::Head => self.client.head(url),
        }
    }

    /// Execute a request, timing it and emitting exactly one metric for the
    /// attempt. Responses are returned to the caller regardless of status
    /// code; only transport failures are errors.
    pub async fn send(
        &self,
        request_builder: RequestBuilder,
        method: MethodCode,
        name: &str,
    ) -> Result<Response, RequestError> {
        if let Some(throttle) = &self.throttle {
            throttle.acquire().await;
        }
        self.sink.register_label(name, method);

        let timestamp = util::monotonic_seconds(self.epoch);
        let started = Instant::now();
        let result = request_builder.send().await;
        let latency_ms = started.elapsed().as_secs_f64() as f32 * 1_000.0;

        match result {
            Ok(response) => {
                let status_code = response.status().as_u16();
                self.sink.emit(&RequestMetric {
                    timestamp,
                    name_hash: fnv1a_hash(name),
                    method,
                    status_code,
                    latency_ms,
                    content_length: response.content_length().unwrap_or(0) as u32,
                    worker_id: self.worker_id,
                    error_category: ErrorCategory::from_status(status_code),
                });
                Ok(response)
            }
            Err(error) => {
                let category = categorize_error(&error);
                debug!("{} {}: {:?}: {}", method, name, category, error);
                self.sink.emit(&RequestMetric {
                    timestamp,
                    name_hash: fnv1a_hash(name),
                    method,
                    status_code: 0,
                    latency_ms,
                    content_length: 0,
                    worker_id: self.worker_id,
                    error_category: category,
                });
                Err(RequestError::Transport {
                    category,
                    source: error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ring_channel;
    use std::collections::BTreeMap;

    fn build_session(base_url: &str) -> HttpSession {
        let (producer, _consumer, _monitor) = ring_channel(0, 0.0);
        let (label_sender, _label_receiver) = flume::bounded(16);
        let sink = MetricSink::new(
            Rc::new(producer),
            label_sender,
            Rc::new(RefCell::new(HashSet::new())),
            Arc::new(AtomicU64::new(0)),
        );
        HttpSession::new(
            base_url,
            &BTreeMap::new(),
            0,
            Instant::now(),
            sink,
            None,
            Duration::from_secs(30),
        )
        .expect("failed to build session")
    }

    #[test]
    fn url_building() {
        let session = build_session("http://127.0.0.1:5000");
        assert_eq!(session.build_url("/about"), "http://127.0.0.1:5000/about");
        assert_eq!(session.build_url("about"), "http://127.0.0.1:5000/about");
        assert_eq!(
            session.build_url("https://example.com/x"),
            "https://example.com/x"
        );

        // Trailing slashes on the base URL don't double up.
        let session = build_session("http://127.0.0.1:5000/");
        assert_eq!(session.build_url("/about"), "http://127.0.0.1:5000/about");
    }

    #[test]
    fn labels_registered_once() {
        let (producer, _consumer, _monitor) = ring_channel(0, 0.0);
        let (label_sender, label_receiver) = flume::bounded(16);
        let sink = MetricSink::new(
            Rc::new(producer),
            label_sender,
            Rc::new(RefCell::new(HashSet::new())),
            Arc::new(AtomicU64::new(0)),
        );
        sink.register_label("index", MethodCode::Get);
        sink.register_label("index", MethodCode::Get);
        sink.register_label("about", MethodCode::Get);
        let labels: Vec<EndpointLabel> = label_receiver.drain().collect();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].name, "index");
        assert_eq!(labels[1].name, "about");
    }
}
