//! Outbound HTTP for guest `fetch()`.
//!
//! The layers, outermost first:
//!
//! - [`InstrumentedFetcher`] records one [`NetworkLogEntry`] per request into
//!   the invocation's trace channel, including requests aborted by teardown.
//! - [`HostLoopFetcher`] moves the actual I/O onto the host's tokio runtime
//!   and aborts it when the context drops the future.
//! - [`HttpFetcher`] performs the request with `reqwest`, enforcing the
//!   [`NetworkPolicy`] (allowed hosts, private address blocking, timeouts,
//!   response size) on the initial URL and on every redirect. With private
//!   blocking on, names are resolved through [`PublicResolver`] so a public
//!   name pointing at internal space is refused as well.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::Client;
use scriptbox_error::FetchError;
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

use crate::types::NetworkLogEntry;
use crate::Fetcher;

/// Methods accepted from guest code.
pub const ALLOWED_METHODS: &[&str] = &["GET", "HEAD", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"];

const MAX_REDIRECTS: usize = 10;

/// A request as issued by the guest, after validation by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Upper-case HTTP method.
    pub method: String,
    /// Absolute http(s) URL.
    pub url: String,
    /// Request headers in guest order.
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub body: Option<String>,
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Canonical reason phrase, empty when unknown.
    pub status_text: String,
    /// Final URL after redirects.
    pub url: String,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

/// Which destinations guest code may reach.
#[derive(Debug, Clone)]
pub struct NetworkPolicy {
    /// Host patterns: exact (`api.example.com`), wildcard subdomain
    /// (`*.example.com`), or everything (`*`).
    pub allowed_hosts: Vec<String>,
    /// Refuse loopback, private, link-local and cloud metadata destinations.
    pub block_private_addresses: bool,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Maximum buffered response body.
    pub max_response_size: usize,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            allowed_hosts: vec!["*".to_string()],
            block_private_addresses: true,
            request_timeout: Duration::from_secs(30),
            max_response_size: 10 * 1024 * 1024,
        }
    }
}

impl NetworkPolicy {
    /// A policy that allows nothing.
    pub fn deny_all() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            ..Self::default()
        }
    }

    /// Allow every host, including local ones. For tests and local tooling.
    pub fn permissive() -> Self {
        Self {
            allowed_hosts: vec!["*".to_string()],
            block_private_addresses: false,
            ..Self::default()
        }
    }

    /// Check a parsed URL against this policy.
    pub fn check(&self, url: &Url) -> Result<(), FetchError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidRequest(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        let Some(host) = url.host_str() else {
            return Err(FetchError::InvalidRequest("URL has no host".into()));
        };
        let host = host.trim_end_matches('.').to_lowercase();

        if !self.is_host_allowed(&host) {
            return Err(FetchError::Blocked {
                host,
                reason: "host is not in the allowed list".into(),
            });
        }
        if self.block_private_addresses && is_private_address(url) {
            return Err(FetchError::Blocked {
                host,
                reason: "private or internal address".into(),
            });
        }
        Ok(())
    }

    fn is_host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts
            .iter()
            .any(|pattern| matches_pattern(pattern, host))
    }
}

fn matches_pattern(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_lowercase();
    if pattern == "*" {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(apex) => host == apex || host.ends_with(&format!(".{apex}")),
        None => pattern == host,
    }
}

/// Whether the URL points at loopback, private, link-local or metadata space.
///
/// Only looks at the host as written. Names are checked again after
/// resolution by [`PublicResolver`].
pub fn is_private_address(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(IpAddr::V6(v6)),
        Some(url::Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_lowercase();
            domain == "localhost"
                || domain.ends_with(".localhost")
                || domain == "metadata.google.internal"
        }
        None => false,
    }
}

/// Whether an address is loopback, private, link-local or otherwise not
/// publicly routable.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
                // 100.64.0.0/10 carrier-grade NAT
                || (a == 100 && (b & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Every address a name resolved to was private.
#[derive(Debug, thiserror::Error)]
#[error("'{host}' resolves to a private or internal address")]
pub struct PrivateResolution {
    /// The name that was looked up.
    pub host: String,
}

/// DNS resolver that drops private addresses.
///
/// Every connection, including redirect hops, resolves through it, so a
/// public-looking name cannot be used to reach internal space.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublicResolver;

impl Resolve for PublicResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs = resolve_public(&host).await?;
            Ok::<Addrs, BoxError>(Box::new(addrs.into_iter()))
        })
    }
}

/// Resolve `host` and keep only its public addresses.
pub async fn resolve_public(host: &str) -> Result<Vec<SocketAddr>, BoxError> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host, 0)).await?.collect();
    let public: Vec<SocketAddr> = resolved
        .iter()
        .copied()
        .filter(|addr| !is_private_ip(addr.ip()))
        .collect();
    if public.is_empty() && !resolved.is_empty() {
        tracing::warn!(host, "name resolves only to private addresses");
        return Err(Box::new(PrivateResolution {
            host: host.to_string(),
        }));
    }
    Ok(public)
}

fn private_resolution(err: &reqwest::Error) -> Option<&PrivateResolution> {
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if let Some(found) = e.downcast_ref::<PrivateResolution>() {
            return Some(found);
        }
        source = e.source();
    }
    None
}

/// Parse and validate a guest URL.
pub fn parse_url(raw: &str) -> Result<Url, FetchError> {
    Url::parse(raw).map_err(|e| FetchError::InvalidRequest(format!("invalid URL '{raw}': {e}")))
}

/// Validate and normalize a guest method.
pub fn normalize_method(raw: &str) -> Result<String, FetchError> {
    let method = raw.to_ascii_uppercase();
    if ALLOWED_METHODS.contains(&method.as_str()) {
        Ok(method)
    } else {
        Err(FetchError::InvalidRequest(format!(
            "unsupported HTTP method '{raw}'"
        )))
    }
}

/// `reqwest`-backed fetcher enforcing a [`NetworkPolicy`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    policy: Arc<NetworkPolicy>,
}

impl HttpFetcher {
    /// Build a fetcher with a connection-pooled client.
    pub fn new(policy: NetworkPolicy) -> Result<Self, FetchError> {
        let policy = Arc::new(policy);
        let redirect_policy = {
            let policy = Arc::clone(&policy);
            reqwest::redirect::Policy::custom(move |attempt| {
                if attempt.previous().len() >= MAX_REDIRECTS {
                    return attempt.error(format!("more than {MAX_REDIRECTS} redirects"));
                }
                match policy.check(attempt.url()) {
                    Ok(()) => attempt.follow(),
                    Err(e) => attempt.error(e.to_string()),
                }
            })
        };
        let mut builder = Client::builder()
            .timeout(policy.request_timeout)
            .connect_timeout(policy.request_timeout.min(Duration::from_secs(10)))
            .pool_max_idle_per_host(10)
            .redirect(redirect_policy)
            .user_agent(concat!("scriptbox/", env!("CARGO_PKG_VERSION")));
        if policy.block_private_addresses {
            builder = builder.dns_resolver(Arc::new(PublicResolver));
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::Internal(anyhow::Error::new(e).context("building HTTP client")))?;
        Ok(Self { client, policy })
    }

    /// The policy this fetcher enforces.
    pub fn policy(&self) -> &NetworkPolicy {
        &self.policy
    }

    fn map_error(&self, err: reqwest::Error) -> FetchError {
        if let Some(refused) = private_resolution(&err) {
            FetchError::Blocked {
                host: refused.host.clone(),
                reason: "resolves to a private or internal address".into(),
            }
        } else if err.is_timeout() {
            FetchError::Timeout {
                timeout_ms: u64::try_from(self.policy.request_timeout.as_millis())
                    .unwrap_or(u64::MAX),
            }
        } else if err.is_redirect() {
            FetchError::Blocked {
                host: err
                    .url()
                    .and_then(|u| u.host_str())
                    .unwrap_or_default()
                    .to_string(),
                reason: "redirect target refused".into(),
            }
        } else if err.is_builder() {
            FetchError::InvalidRequest(err.to_string())
        } else {
            FetchError::Connection(err.to_string())
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = parse_url(&request.url)?;
        self.policy.check(&url)?;
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let mut response = builder.send().await.map_err(|e| self.map_error(e))?;

        let max = self.policy.max_response_size;
        if response
            .content_length()
            .is_some_and(|len| len > max as u64)
        {
            return Err(FetchError::BodyTooLarge { max });
        }

        let status = response.status();
        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.map_error(e))? {
            if body.len() + chunk.len() > max {
                return Err(FetchError::BodyTooLarge { max });
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(
            status = status.as_u16(),
            body_size = body.len(),
            "fetch completed"
        );

        Ok(FetchResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            url: final_url,
            headers,
            body,
        })
    }
}

/// Runs an inner fetcher on the host runtime.
///
/// Context threads run their own single-threaded runtime. Spawning the I/O
/// onto the host runtime keeps connection pools shared, and aborting the task
/// on drop means a disposed context leaves no request running.
pub struct HostLoopFetcher {
    inner: Arc<dyn Fetcher>,
    handle: tokio::runtime::Handle,
}

impl HostLoopFetcher {
    /// Wrap `inner`, spawning its futures on `handle`.
    pub fn new(inner: Arc<dyn Fetcher>, handle: tokio::runtime::Handle) -> Self {
        Self { inner, handle }
    }
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait::async_trait]
impl Fetcher for HostLoopFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let inner = Arc::clone(&self.inner);
        let task = self.handle.spawn(async move { inner.fetch(request).await });
        let _abort = AbortOnDrop(task.abort_handle());
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(FetchError::Aborted),
            Err(e) => Err(FetchError::Internal(anyhow::anyhow!("fetch task failed: {e}"))),
        }
    }
}

/// A trace entry tagged with its issue order.
#[derive(Debug)]
pub struct TraceRecord {
    /// Position in issue order.
    pub seq: u64,
    /// The completed entry.
    pub entry: NetworkLogEntry,
}

/// Records every request into the invocation's network trace.
pub struct InstrumentedFetcher {
    inner: Arc<dyn Fetcher>,
    trace: UnboundedSender<TraceRecord>,
    next_seq: AtomicU64,
}

impl InstrumentedFetcher {
    /// Wrap `inner`, sending one record per request into `trace`.
    pub fn new(inner: Arc<dyn Fetcher>, trace: UnboundedSender<TraceRecord>) -> Self {
        Self {
            inner,
            trace,
            next_seq: AtomicU64::new(0),
        }
    }
}

/// Sends a record when dropped. A request whose future is dropped before
/// completion is recorded as aborted.
struct PendingTrace {
    seq: u64,
    entry: Option<NetworkLogEntry>,
    started: Instant,
    trace: UnboundedSender<TraceRecord>,
}

impl PendingTrace {
    fn complete(&mut self, result: &Result<FetchResponse, FetchError>) {
        if let Some(entry) = self.entry.as_mut() {
            entry.duration_ms = elapsed_ms(self.started);
            match result {
                Ok(resp) => {
                    entry.status = Some(resp.status);
                    entry.response_headers = resp.headers.clone();
                }
                Err(e) => entry.error = Some(e.to_string()),
            }
        }
    }
}

impl Drop for PendingTrace {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            if entry.status.is_none() && entry.error.is_none() {
                entry.duration_ms = elapsed_ms(self.started);
                entry.error = Some(FetchError::Aborted.to_string());
            }
            // Receiver gone means nobody collects this trace anymore.
            let _ = self.trace.send(TraceRecord {
                seq: self.seq,
                entry,
            });
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[async_trait::async_trait]
impl Fetcher for InstrumentedFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let started_at: DateTime<Utc> = Utc::now();
        let mut pending = PendingTrace {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            entry: Some(NetworkLogEntry {
                method: request.method.clone(),
                url: request.url.clone(),
                request_headers: request.headers.clone(),
                status: None,
                response_headers: Vec::new(),
                started_at,
                duration_ms: 0,
                error: None,
            }),
            started: Instant::now(),
            trace: self.trace.clone(),
        };
        let result = self.inner.fetch(request).await;
        pending.complete(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn wildcard_patterns() {
        assert!(matches_pattern("*", "anything.io"));
        assert!(matches_pattern("*.example.com", "api.example.com"));
        assert!(matches_pattern("*.example.com", "example.com"));
        assert!(!matches_pattern("*.example.com", "badexample.com"));
        assert!(matches_pattern("API.example.com", "api.example.com"));
    }

    #[test]
    fn private_addresses_are_detected() {
        for u in [
            "http://127.0.0.1/",
            "http://10.1.2.3/",
            "http://192.168.0.10:8080/",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/",
            "http://[fd00::1]/",
            "http://localhost:3000/",
            "http://localhost.:3000/",
            "http://100.64.0.1/",
            "http://metadata.google.internal/",
        ] {
            assert!(is_private_address(&url(u)), "{u}");
        }
        assert!(!is_private_address(&url("https://example.com/")));
        assert!(!is_private_address(&url("https://93.184.216.34/")));
    }

    #[test]
    fn policy_blocks_private_and_unlisted_hosts() {
        let policy = NetworkPolicy {
            allowed_hosts: vec!["*.example.com".into()],
            ..NetworkPolicy::default()
        };
        assert!(policy.check(&url("https://api.example.com/x")).is_ok());
        assert_eq!(
            policy.check(&url("https://evil.io/")).unwrap_err().code(),
            "BLOCKED"
        );
        let open = NetworkPolicy::default();
        assert_eq!(
            open.check(&url("http://127.0.0.1:9/")).unwrap_err().code(),
            "BLOCKED"
        );
        assert!(NetworkPolicy::permissive()
            .check(&url("http://127.0.0.1:9/"))
            .is_ok());
    }

    #[tokio::test]
    async fn names_resolving_to_loopback_are_refused() {
        let err = resolve_public("localhost").await.unwrap_err();
        let refused = err.downcast_ref::<PrivateResolution>().unwrap();
        assert_eq!(refused.host, "localhost");
    }

    #[tokio::test]
    async fn fetcher_maps_private_resolution_to_blocked() {
        let fetcher = HttpFetcher::new(NetworkPolicy::default()).unwrap();
        // Bypasses the name check so only the resolver stands in the way.
        let err = fetcher
            .client
            .get("http://localhost:9/")
            .send()
            .await
            .unwrap_err();
        let mapped = fetcher.map_error(err);
        assert_eq!(mapped.code(), "BLOCKED", "{mapped}");
        assert!(mapped.to_string().contains("private"), "{mapped}");
    }

    #[test]
    fn trailing_dot_does_not_bypass_host_rules() {
        let policy = NetworkPolicy {
            allowed_hosts: vec!["api.example.com".into()],
            ..NetworkPolicy::default()
        };
        assert!(policy.check(&url("https://api.example.com./v1")).is_ok());
        assert_eq!(
            NetworkPolicy::default()
                .check(&url("http://localhost./"))
                .unwrap_err()
                .code(),
            "BLOCKED"
        );
    }

    #[test]
    fn policy_rejects_non_http_schemes() {
        let err = NetworkPolicy::permissive()
            .check(&url("file:///etc/passwd"))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[test]
    fn deny_all_blocks_everything() {
        assert!(NetworkPolicy::deny_all()
            .check(&url("https://example.com/"))
            .is_err());
    }

    #[test]
    fn methods_are_normalized() {
        assert_eq!(normalize_method("post").unwrap(), "POST");
        assert!(normalize_method("CONNECT").is_err());
        assert!(normalize_method("TRACE").is_err());
    }

    struct Canned;

    #[async_trait::async_trait]
    impl Fetcher for Canned {
        async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
            if request.url.contains("fail") {
                return Err(FetchError::Connection("refused".into()));
            }
            Ok(FetchResponse {
                status: 201,
                status_text: "Created".into(),
                url: request.url,
                headers: vec![("x-test".into(), "1".into())],
                body: b"ok".to_vec(),
            })
        }
    }

    struct Hang;

    #[async_trait::async_trait]
    impl Fetcher for Hang {
        async fn fetch(&self, _request: FetchRequest) -> Result<FetchResponse, FetchError> {
            std::future::pending().await
        }
    }

    fn get(url: &str) -> FetchRequest {
        FetchRequest {
            method: "GET".into(),
            url: url.into(),
            headers: vec![],
            body: None,
        }
    }

    #[tokio::test]
    async fn instrumented_fetcher_records_success_and_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fetcher = InstrumentedFetcher::new(Arc::new(Canned), tx);

        fetcher.fetch(get("https://a.test/ok")).await.unwrap();
        fetcher.fetch(get("https://a.test/fail")).await.unwrap_err();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(first.entry.status, Some(201));
        assert_eq!(first.entry.response_headers.len(), 1);

        let second = rx.try_recv().unwrap();
        assert_eq!(second.seq, 1);
        assert!(second.entry.status.is_none());
        assert!(second.entry.error.unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn dropped_request_is_recorded_as_aborted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fetcher = InstrumentedFetcher::new(Arc::new(Hang), tx);

        let res =
            tokio::time::timeout(Duration::from_millis(20), fetcher.fetch(get("https://slow.test/"))).await;
        assert!(res.is_err());

        let record = rx.try_recv().unwrap();
        assert_eq!(record.entry.error.as_deref(), Some("request aborted"));
    }

    #[tokio::test]
    async fn host_loop_fetcher_forwards_results() {
        let fetcher = HostLoopFetcher::new(Arc::new(Canned), tokio::runtime::Handle::current());
        let resp = fetcher.fetch(get("https://a.test/")).await.unwrap();
        assert_eq!(resp.body, b"ok");
    }
}
