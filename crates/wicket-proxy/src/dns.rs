//! Message-driven DNS resolver agent.
//!
//! The agent owns a [`LocalCache`] and a waiting list, and serializes all
//! state changes on its own task. Clients talk to it through a
//! [`DnsHandle`] and receive replies on a channel they supply.
//!
//! # Resolution Flow
//!
//! ```text
//! ResolveRequest
//!      |
//!      v
//! cache hit? -- yes --> ResolveReply(Success)
//!      |
//!      no
//!      |
//!      v
//! append to waiting list for the name
//!      |
//!      +-- first waiter --> spawn one system lookup
//!      +-- otherwise ----> coalesce onto the lookup in flight
//!
//! lookup completion --> cache.add_records --> answer every waiter
//!                       in arrival order, each with its own family
//! ```
//!
//! At most one system lookup is in flight per hostname; every request is
//! answered exactly once while the agent lives. Cache entries expire
//! after [`RESOLVE_INFO_TTL`] and are swept on a periodic tick.

use crate::dns_cache::{resolve_address_from_list, IpVersion, LocalCache};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace};

/// How long a cached resolution stays valid.
pub const RESOLVE_INFO_TTL: Duration = Duration::from_secs(30);

/// Identifier correlating a [`ResolveRequest`] with its reply.
pub type ResolveReqId = u64;

/// A resolution request delivered to the agent.
#[derive(Debug)]
pub struct ResolveRequest {
    /// Correlation id, echoed in the reply.
    pub req_id: ResolveReqId,

    /// Hostname to resolve (exact, case-sensitive).
    pub name: String,

    /// Address family the requester can use.
    pub ip_version: IpVersion,

    /// Where the reply goes.
    pub reply_to: mpsc::UnboundedSender<ResolveReply>,

    /// Opaque requester state, echoed in the reply.
    pub completion_token: u64,
}

/// Outcome of one resolution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// First resolved address matching the requested family.
    Resolved(IpAddr),
    /// Human-readable failure description, identical for every waiter of
    /// a failed lookup.
    Failed(String),
}

/// Reply sent on the requester-supplied channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveReply {
    pub req_id: ResolveReqId,
    pub completion_token: u64,
    pub outcome: ResolveOutcome,
}

/// Monotonic resolver counters.
#[derive(Debug, Default)]
pub struct DnsStats {
    cache_hits: AtomicU64,
    successful_lookups: AtomicU64,
    failed_lookups: AtomicU64,
}

impl DnsStats {
    /// Requests answered straight from the cache.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// System lookups that produced addresses.
    pub fn successful_lookups(&self) -> u64 {
        self.successful_lookups.load(Ordering::Relaxed)
    }

    /// System lookups that failed.
    pub fn failed_lookups(&self) -> u64 {
        self.failed_lookups.load(Ordering::Relaxed)
    }
}

/// The system-lookup seam, so tests can script resolutions.
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Resolve `name` to its addresses, in resolver order.
    async fn resolve(&self, name: &str) -> io::Result<Vec<IpAddr>>;
}

/// [`NameResolver`] backed by the operating system's resolver.
pub struct SystemResolver;

#[async_trait]
impl NameResolver for SystemResolver {
    async fn resolve(&self, name: &str) -> io::Result<Vec<IpAddr>> {
        // The numeric port keeps getaddrinfo from doing a service-name
        // lookup; every endpoint it returns is surfaced in order.
        // IPv4-mapped handling follows the platform's getaddrinfo defaults.
        let addrs = tokio::net::lookup_host((name, 0u16)).await?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }
}

/// Messages accepted by the agent.
enum DnsMessage {
    Resolve(ResolveRequest),
    UpdateParams { cache_cleanup_period: Duration },
}

/// Client-side handle to the resolver agent. Cheap to clone.
#[derive(Clone)]
pub struct DnsHandle {
    tx: mpsc::UnboundedSender<DnsMessage>,
}

impl DnsHandle {
    /// Submit a resolution request. The reply arrives on
    /// `request.reply_to`; if the agent is gone the request is dropped
    /// and no reply will come.
    pub fn resolve(&self, request: ResolveRequest) {
        let _ = self.tx.send(DnsMessage::Resolve(request));
    }

    /// Adopt a new cache-eviction period at the next re-arm. The tick
    /// already in flight keeps its original deadline.
    pub fn update_params(&self, cache_cleanup_period: Duration) {
        let _ = self.tx.send(DnsMessage::UpdateParams {
            cache_cleanup_period,
        });
    }

    /// A handle with no agent behind it; every request is silently
    /// dropped. Useful where a context is needed but resolution is not.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// Result of one spawned system lookup, posted back to the agent.
type LookupCompletion = (String, io::Result<Vec<IpAddr>>);

/// The resolver agent. Construct and start with [`DnsResolver::spawn`].
pub struct DnsResolver {
    cache: LocalCache,
    waiting: HashMap<String, Vec<ResolveRequest>>,
    stats: Arc<DnsStats>,
    resolver: Arc<dyn NameResolver>,
    cache_cleanup_period: Duration,
    rx: mpsc::UnboundedReceiver<DnsMessage>,
    completion_tx: mpsc::UnboundedSender<LookupCompletion>,
    completion_rx: mpsc::UnboundedReceiver<LookupCompletion>,
}

impl DnsResolver {
    /// Start the agent on its own task.
    ///
    /// The agent runs until every [`DnsHandle`] clone is dropped. Requests
    /// still waiting at that point are abandoned; requesters observe their
    /// reply channel closing.
    pub fn spawn(
        resolver: Arc<dyn NameResolver>,
        cache_cleanup_period: Duration,
    ) -> (DnsHandle, Arc<DnsStats>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(DnsStats::default());
        let agent = Self {
            cache: LocalCache::new(),
            waiting: HashMap::new(),
            stats: Arc::clone(&stats),
            resolver,
            cache_cleanup_period,
            rx,
            completion_tx,
            completion_rx,
        };
        let join = tokio::spawn(agent.run());
        (DnsHandle { tx }, stats, join)
    }

    async fn run(mut self) {
        info!("dns resolver started");
        let mut cleanup = Box::pin(sleep(self.cache_cleanup_period));
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(DnsMessage::Resolve(request)) => self.on_resolve(request),
                    Some(DnsMessage::UpdateParams { cache_cleanup_period }) => {
                        trace!(period = ?cache_cleanup_period, "update dns params");
                        self.cache_cleanup_period = cache_cleanup_period;
                    }
                    None => break,
                },
                Some((name, result)) = self.completion_rx.recv() => {
                    self.on_lookup_completion(name, result);
                }
                () = &mut cleanup => {
                    let removed = self.cache.remove_outdated_records(RESOLVE_INFO_TTL);
                    trace!(removed, "dns cache cleaned up");
                    cleanup
                        .as_mut()
                        .reset(Instant::now() + self.cache_cleanup_period);
                }
            }
        }
        info!("dns resolver shutdown completed");
    }

    fn on_resolve(&mut self, request: ResolveRequest) {
        debug!(
            req_id = request.req_id,
            name = %request.name,
            ip_version = %request.ip_version,
            "resolve request"
        );

        if let Some(address) = self.cache.resolve(&request.name, request.ip_version) {
            debug!(
                req_id = request.req_id,
                name = %request.name,
                %address,
                "request resolved from cache"
            );
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            send_reply(&request, ResolveOutcome::Resolved(address));
        } else {
            self.add_to_waiting_and_resolve(request);
        }
    }

    fn add_to_waiting_and_resolve(&mut self, request: ResolveRequest) {
        trace!(req_id = request.req_id, "request added to waiting list");
        let name = request.name.clone();
        let waiters = self.waiting.entry(name.clone()).or_default();
        let need_lookup = waiters.is_empty();
        waiters.push(request);

        if need_lookup {
            let resolver = Arc::clone(&self.resolver);
            let completion_tx = self.completion_tx.clone();
            tokio::spawn(async move {
                let result = resolver.resolve(&name).await;
                let _ = completion_tx.send((name, result));
            });
        }
    }

    fn on_lookup_completion(&mut self, name: String, result: io::Result<Vec<IpAddr>>) {
        let waiters = self.waiting.remove(&name).unwrap_or_default();
        match result {
            Ok(addresses) => {
                self.stats.successful_lookups.fetch_add(1, Ordering::Relaxed);
                debug!(name = %name, ?addresses, "domain resolved");
                self.cache.add_records(name, addresses.clone());
                for request in waiters {
                    let outcome =
                        match resolve_address_from_list(&addresses, request.ip_version) {
                            Some(address) => ResolveOutcome::Resolved(address),
                            None => ResolveOutcome::Failed(
                                "no matching address family".to_string(),
                            ),
                        };
                    send_reply(&request, outcome);
                }
            }
            Err(e) => {
                self.stats.failed_lookups.fetch_add(1, Ordering::Relaxed);
                let description = error_description(&e);
                debug!(name = %name, error = %description, "domain resolution failed");
                for request in waiters {
                    send_reply(&request, ResolveOutcome::Failed(description.clone()));
                }
            }
        }
    }
}

fn send_reply(request: &ResolveRequest, outcome: ResolveOutcome) {
    let reply = ResolveReply {
        req_id: request.req_id,
        completion_token: request.completion_token,
        outcome,
    };
    if request.reply_to.send(reply).is_ok() {
        trace!(req_id = request.req_id, "resolve reply sent");
    } else {
        trace!(req_id = request.req_id, "resolve reply dropped: requester gone");
    }
}

fn error_description(e: &io::Error) -> String {
    format!("{}({})", e, e.raw_os_error().unwrap_or(-1))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Scripted resolver: returns the configured result after a short
    /// delay, counting how many lookups were issued.
    struct FakeResolver {
        result: io::Result<Vec<IpAddr>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FakeResolver {
        fn ok(addresses: Vec<IpAddr>) -> Arc<Self> {
            Arc::new(Self {
                result: Ok(addresses),
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(30),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                result: Err(io::Error::new(io::ErrorKind::NotFound, message.to_string())),
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(10),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl NameResolver for FakeResolver {
        async fn resolve(&self, _name: &str) -> io::Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            sleep(self.delay).await;
            match &self.result {
                Ok(addresses) => Ok(addresses.clone()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            }
        }
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn request(
        req_id: u64,
        name: &str,
        ip_version: IpVersion,
        reply_to: &mpsc::UnboundedSender<ResolveReply>,
    ) -> ResolveRequest {
        ResolveRequest {
            req_id,
            name: name.to_string(),
            ip_version,
            reply_to: reply_to.clone(),
            completion_token: req_id * 10,
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce_into_one_lookup() {
        let resolver = FakeResolver::ok(vec![addr("10.0.0.1"), addr("10.0.0.2")]);
        let (handle, stats, _join) =
            DnsResolver::spawn(resolver.clone(), Duration::from_secs(30));

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        for req_id in 1..=3 {
            handle.resolve(request(req_id, "example.test", IpVersion::V4, &reply_tx));
        }

        // All three waiters are answered from a single lookup, in
        // arrival order, with the first matching address.
        for expected_id in 1..=3 {
            let reply = reply_rx.recv().await.unwrap();
            assert_eq!(reply.req_id, expected_id);
            assert_eq!(reply.completion_token, expected_id * 10);
            assert_eq!(reply.outcome, ResolveOutcome::Resolved(addr("10.0.0.1")));
        }
        assert_eq!(resolver.calls(), 1);
        assert_eq!(stats.cache_hits(), 0);
        assert_eq!(stats.successful_lookups(), 1);
    }

    #[tokio::test]
    async fn test_cached_name_answers_without_lookup() {
        let resolver = FakeResolver::ok(vec![addr("10.0.0.1")]);
        let (handle, stats, _join) =
            DnsResolver::spawn(resolver.clone(), Duration::from_secs(30));

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        handle.resolve(request(1, "example.test", IpVersion::V4, &reply_tx));
        reply_rx.recv().await.unwrap();

        handle.resolve(request(2, "example.test", IpVersion::V4, &reply_tx));
        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(reply.outcome, ResolveOutcome::Resolved(addr("10.0.0.1")));
        assert_eq!(resolver.calls(), 1);
        assert_eq!(stats.cache_hits(), 1);
    }

    #[tokio::test]
    async fn test_waiters_pick_their_own_family() {
        let resolver = FakeResolver::ok(vec![addr("10.0.0.1"), addr("::1")]);
        let (handle, _stats, _join) = DnsResolver::spawn(resolver, Duration::from_secs(30));

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        handle.resolve(request(1, "dual.test", IpVersion::V4, &reply_tx));
        handle.resolve(request(2, "dual.test", IpVersion::V6, &reply_tx));

        let first = reply_rx.recv().await.unwrap();
        let second = reply_rx.recv().await.unwrap();
        assert_eq!(first.outcome, ResolveOutcome::Resolved(addr("10.0.0.1")));
        assert_eq!(second.outcome, ResolveOutcome::Resolved(addr("::1")));
    }

    #[tokio::test]
    async fn test_family_miss_on_cached_name_triggers_new_lookup() {
        let resolver = FakeResolver::ok(vec![addr("10.0.0.1")]);
        let (handle, _stats, _join) =
            DnsResolver::spawn(resolver.clone(), Duration::from_secs(30));

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        handle.resolve(request(1, "v4only.test", IpVersion::V4, &reply_tx));
        reply_rx.recv().await.unwrap();

        // The name is cached, but holds no IPv6 address: the cache misses
        // and a fresh lookup runs. Its results are v4-only again, so the
        // waiter gets a family failure.
        handle.resolve(request(2, "v4only.test", IpVersion::V6, &reply_tx));
        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(
            reply.outcome,
            ResolveOutcome::Failed("no matching address family".to_string())
        );
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_lookup_fans_out_same_description() {
        let resolver = FakeResolver::failing("lookup failed");
        let (handle, stats, _join) =
            DnsResolver::spawn(resolver.clone(), Duration::from_secs(30));

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        handle.resolve(request(1, "missing.test", IpVersion::V4, &reply_tx));
        handle.resolve(request(2, "missing.test", IpVersion::V4, &reply_tx));

        let first = reply_rx.recv().await.unwrap();
        let second = reply_rx.recv().await.unwrap();
        match (&first.outcome, &second.outcome) {
            (ResolveOutcome::Failed(a), ResolveOutcome::Failed(b)) => {
                assert_eq!(a, b);
                assert!(a.contains("lookup failed"), "unexpected description: {a}");
            }
            other => panic!("expected two failures, got {other:?}"),
        }
        assert_eq!(resolver.calls(), 1);
        assert_eq!(stats.failed_lookups(), 1);
        assert_eq!(stats.successful_lookups(), 0);
    }

    #[tokio::test]
    async fn test_update_params_keeps_agent_serving() {
        let resolver = FakeResolver::ok(vec![addr("10.0.0.1")]);
        let (handle, _stats, _join) = DnsResolver::spawn(resolver, Duration::from_secs(30));

        handle.update_params(Duration::from_millis(50));

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        handle.resolve(request(1, "example.test", IpVersion::V4, &reply_tx));
        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(reply.outcome, ResolveOutcome::Resolved(addr("10.0.0.1")));
    }

    #[tokio::test]
    async fn test_agent_stops_when_handles_drop() {
        let resolver = FakeResolver::ok(vec![addr("10.0.0.1")]);
        let (handle, _stats, join) = DnsResolver::spawn(resolver, Duration::from_secs(30));
        drop(handle);
        // With every handle gone the agent's loop ends.
        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("agent did not stop")
            .unwrap();
    }

    #[test]
    fn test_error_description_format() {
        let e = io::Error::new(io::ErrorKind::NotFound, "host not found");
        let description = error_description(&e);
        assert!(description.starts_with("host not found"));
        assert!(description.ends_with("(-1)"));
    }
}
