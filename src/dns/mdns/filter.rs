//! Source filter for multicast queries
//!
//! Only queries sent from one of our own interface addresses are answered.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::ifaces::interface_addrs;

/// Interval between interface enumerations
pub const IFACE_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

type Enumerate = Box<dyn Fn() -> std::io::Result<Vec<IpAddr>> + Send + Sync>;

/// Accepts messages from local interface addresses
pub struct LocalIfaceFilter {
    addrs: RwLock<Option<BTreeSet<IpAddr>>>,
    enumerate: Enumerate,
}

impl Default for LocalIfaceFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalIfaceFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_enumerator(Box::new(interface_addrs))
    }

    fn with_enumerator(enumerate: Enumerate) -> Self {
        Self {
            addrs: RwLock::new(None),
            enumerate,
        }
    }

    /// Re-read the interface addresses
    ///
    /// # Errors
    ///
    /// Returns the enumeration error; the previous set stays in place.
    pub fn update_once(&self) -> std::io::Result<()> {
        let fresh: BTreeSet<IpAddr> = (self.enumerate)()?.into_iter().collect();

        let mut addrs = self.addrs.write();
        if addrs.as_ref() != Some(&fresh) {
            debug!(addrs = ?fresh, "Iface addrs changed");
            *addrs = Some(fresh);
        }
        Ok(())
    }

    /// Refresh every [`IFACE_REFRESH_INTERVAL`] until `shutdown` fires
    pub async fn update_continuously(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(IFACE_REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.update_once() {
                        debug!(error = %e, "Failed updating ifaces");
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    /// Whether a message from `src` should be answered
    ///
    /// Everything is accepted until the first successful enumeration.
    #[must_use]
    pub fn accept(&self, src: IpAddr) -> bool {
        if self.addrs.read().is_none() {
            if let Err(e) = self.update_once() {
                debug!(error = %e, "Failed updating ifaces");
            }
        }

        match self.addrs.read().as_ref() {
            Some(addrs) => addrs.contains(&src),
            None => true,
        }
    }
}
