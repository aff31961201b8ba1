//! Domain table routing
//!
//! Queries are routed by the longest domain suffix of their first question.
//! The table is rebuilt from a [`DomainsSource`] and swapped in whole, so a
//! query sees either the old table or the new one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::cluster::normalize;
use super::error::DnsResult;
use super::handler::{ArpaHandler, CustomHandler, ForwardHandler, Handler, Reply, Request};
use super::resolver::IpResolver;

/// Interval between domain table refreshes
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Supplies the authoritative domains
#[async_trait]
pub trait DomainsSource: Send + Sync {
    /// Current domain to resolver map; domains need not be fully qualified
    ///
    /// # Errors
    ///
    /// Any error aborts the refresh and keeps the previous table.
    async fn domains(&self) -> DnsResult<BTreeMap<String, IpResolver>>;
}

/// A fixed domain map
pub struct StaticDomains(pub BTreeMap<String, IpResolver>);

#[async_trait]
impl DomainsSource for StaticDomains {
    async fn domains(&self) -> DnsResult<BTreeMap<String, IpResolver>> {
        Ok(self.0.clone())
    }
}

/// Called after a refresh changed the set of domains
pub type DomainsChanged = Arc<dyn Fn() + Send + Sync>;

struct DomainTable {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl DomainTable {
    /// Longest registered suffix of `name`; `.` always matches
    fn route(&self, name: &str) -> Option<&Arc<dyn Handler>> {
        let mut candidate = name;
        loop {
            if let Some(handler) = self.handlers.get(candidate) {
                return Some(handler);
            }
            match candidate.split_once('.') {
                Some((_, "")) | None => return self.handlers.get("."),
                Some((_, rest)) => candidate = rest,
            }
        }
    }
}

/// Routes queries through a refreshable domain table
pub struct DomainsMux {
    table: ArcSwap<DomainTable>,
    forward: Arc<dyn Handler>,
    arpa: Arc<dyn Handler>,
    source: Arc<dyn DomainsSource>,
    on_changed: Option<DomainsChanged>,
    registered: Mutex<BTreeSet<String>>,
}

impl DomainsMux {
    pub fn new(forward: Arc<ForwardHandler>, source: Arc<dyn DomainsSource>) -> Self {
        let forward: Arc<dyn Handler> = forward;
        let arpa: Arc<dyn Handler> = Arc::new(ArpaHandler::new(forward.clone()));
        let mux = Self {
            table: ArcSwap::from_pointee(DomainTable {
                handlers: BTreeMap::new(),
            }),
            forward,
            arpa,
            source,
            on_changed: None,
            registered: Mutex::new(BTreeSet::new()),
        };
        mux.table.store(Arc::new(mux.build_table(BTreeMap::new())));
        mux
    }

    #[must_use]
    pub fn with_on_changed(mut self, on_changed: DomainsChanged) -> Self {
        self.on_changed = Some(on_changed);
        self
    }

    /// Domains currently answered authoritatively
    #[must_use]
    pub fn domains(&self) -> Vec<String> {
        self.registered.lock().iter().cloned().collect()
    }

    fn build_table(&self, custom: BTreeMap<String, Arc<dyn Handler>>) -> DomainTable {
        let mut handlers = custom;
        handlers.insert("arpa.".into(), self.arpa.clone());
        handlers.insert(".".into(), self.forward.clone());
        DomainTable { handlers }
    }

    /// Fetch the domains once and swap in the new table
    ///
    /// Returns whether the set of domains changed.
    ///
    /// # Errors
    ///
    /// Returns the source's error; the previous table stays in place.
    pub async fn update_once(&self) -> DnsResult<bool> {
        let domains = self.source.domains().await?;
        debug!(count = domains.len(), "Updating DNS domain handlers");

        let mut custom: BTreeMap<String, Arc<dyn Handler>> = BTreeMap::new();
        let mut resolvers = BTreeMap::new();
        for (domain, resolver) in domains {
            let domain = normalize(&domain);
            custom.insert(
                domain.clone(),
                Arc::new(CustomHandler::new(resolver.clone())),
            );
            resolvers.insert(domain, resolver);
        }

        let changed = {
            let mut registered = self.registered.lock();
            let mut changed = false;

            for (domain, resolver) in &resolvers {
                if !registered.contains(domain) {
                    info!("Registering {}->{}", domain, resolver);
                    changed = true;
                }
            }
            for domain in registered.iter() {
                if !resolvers.contains_key(domain) {
                    info!("Unregistering {}", domain);
                    changed = true;
                }
            }

            self.table.store(Arc::new(self.build_table(custom)));
            *registered = resolvers.into_keys().collect();
            changed
        };

        if changed {
            if let Some(on_changed) = &self.on_changed {
                // The callback shells out to flush OS caches
                let on_changed = Arc::clone(on_changed);
                if let Err(e) = tokio::task::spawn_blocking(move || on_changed()).await {
                    warn!(error = %e, "Domains changed callback failed");
                }
            }
        }
        Ok(changed)
    }

    /// Refresh every [`REFRESH_INTERVAL`] until `shutdown` fires
    pub async fn update_continuously(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.update_once().await {
                        debug!(error = %e, "Failed updating DNS domain handlers");
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }
}

#[async_trait]
impl Handler for DomainsMux {
    async fn handle(&self, request: &Request) -> Reply {
        let table = self.table.load_full();
        let handler = match request.question() {
            Some(q) => table.route(&normalize(&q.name().to_ascii())),
            None => table.handlers.get("."),
        };

        match handler {
            Some(handler) => handler.handle(request).await,
            None => self.forward.handle(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::error::DnsError;
    use crate::dns::handler::tests::{query, request};
    use crate::dns::handler::Transport;
    use crate::dns::pool::FailoverRecursorPool;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::RecordType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        rounds: Mutex<Vec<DnsResult<BTreeMap<String, IpResolver>>>>,
    }

    #[async_trait]
    impl DomainsSource for Scripted {
        async fn domains(&self) -> DnsResult<BTreeMap<String, IpResolver>> {
            self.rounds.lock().remove(0)
        }
    }

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, IpResolver> {
        entries
            .iter()
            .map(|(d, ip)| ((*d).to_string(), IpResolver::Static(ip.parse().unwrap())))
            .collect()
    }

    fn forward() -> Arc<ForwardHandler> {
        Arc::new(ForwardHandler::new(Arc::new(FailoverRecursorPool::new(&[])))
            .with_timeout(Duration::from_millis(50)))
    }

    async fn answer(mux: &DomainsMux, name: &str) -> hickory_proto::op::Message {
        let req = request(&query(name, RecordType::A), Transport::Udp);
        mux.handle(&req).await.to_message().unwrap()
    }

    // ========================================================================
    // Routing
    // ========================================================================

    #[tokio::test]
    async fn test_longest_suffix_wins() {
        let source = StaticDomains(map(&[("test", "127.0.0.1"), ("api.test.", "127.0.0.2")]));
        let mux = DomainsMux::new(forward(), Arc::new(source));
        mux.update_once().await.unwrap();

        let resp = answer(&mux, "web.test.").await;
        assert_eq!(resp.answers()[0].data().unwrap().to_string(), "127.0.0.1");

        let resp = answer(&mux, "v1.API.test.").await;
        assert_eq!(resp.answers()[0].data().unwrap().to_string(), "127.0.0.2");

        let resp = answer(&mux, "test.").await;
        assert_eq!(resp.answers()[0].data().unwrap().to_string(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_unmatched_names_are_forwarded() {
        let mux = DomainsMux::new(forward(), Arc::new(StaticDomains(map(&[]))));
        mux.update_once().await.unwrap();

        // No recursors configured: the forward handler fails the query
        let resp = answer(&mux, "example.com.").await;
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert!(!resp.authoritative());
    }

    #[test]
    fn test_fixed_routes_are_always_present() {
        let mux = DomainsMux::new(forward(), Arc::new(StaticDomains(map(&[]))));
        let table = mux.table.load();
        assert!(table.handlers.contains_key("arpa."));
        assert!(table.handlers.contains_key("."));
        assert!(table.route("4.3.2.1.in-addr.arpa.").is_some());
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    #[tokio::test]
    async fn test_refresh_diffs_and_fires_changed_callback() {
        let source = Scripted {
            rounds: Mutex::new(vec![
                Ok(map(&[("a.", "10.0.0.1")])),
                Ok(map(&[("a.", "10.0.0.9")])),
                Ok(map(&[("b.", "10.0.0.2")])),
                Err(DnsError::resolve("map-exec", "boom")),
            ]),
        };
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mux = DomainsMux::new(forward(), Arc::new(source))
            .with_on_changed(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        assert!(mux.update_once().await.unwrap());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Same domain, new resolver: handler replaced, set unchanged
        assert!(!mux.update_once().await.unwrap());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let resp = answer(&mux, "x.a.").await;
        assert_eq!(resp.answers()[0].data().unwrap().to_string(), "10.0.0.9");

        assert!(mux.update_once().await.unwrap());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(mux.domains(), vec!["b.".to_string()]);

        // A failing source keeps the previous table
        assert!(mux.update_once().await.is_err());
        assert_eq!(mux.domains(), vec!["b.".to_string()]);
        let resp = answer(&mux, "x.b.").await;
        assert_eq!(resp.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_callback_runs_off_runtime_thread() {
        let source = StaticDomains(map(&[("a.", "10.0.0.1")]));
        let seen = Arc::new(Mutex::new(None));
        let record = seen.clone();
        let mux = DomainsMux::new(forward(), Arc::new(source)).with_on_changed(Arc::new(move || {
            *record.lock() = Some(std::thread::current().id());
        }));

        assert!(mux.update_once().await.unwrap());
        let callback_thread = (*seen.lock()).expect("callback did not run");
        assert_ne!(callback_thread, std::thread::current().id());
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl DomainsSource for Counting {
        async fn domains(&self) -> DnsResult<BTreeMap<String, IpResolver>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(map(&[("a.", "10.0.0.1")]))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_every_interval() {
        let source = Arc::new(Counting(AtomicUsize::new(0)));
        let mux = Arc::new(DomainsMux::new(forward(), source.clone()));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let refresh = tokio::spawn(Arc::clone(&mux).update_continuously(shutdown_rx));

        // The loop skips the immediate tick; refreshes land at 30s and 60s
        tokio::time::sleep(REFRESH_INTERVAL * 2 + Duration::from_secs(1)).await;
        assert_eq!(source.0.load(Ordering::SeqCst), 2);
        assert_eq!(mux.domains(), vec!["a.".to_string()]);

        shutdown_tx.send(()).unwrap();
        refresh.await.unwrap();
    }
}
