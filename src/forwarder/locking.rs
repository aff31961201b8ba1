//! Shared, swappable forwarder handle

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;

use super::Forwarder;
use crate::error::ForwarderError;

/// Serializes access to the session's forwarder
///
/// The forwarder is only known once the proxies have bound their ports, so it
/// is installed later with [`LockingForwarder::set_forwarder`]. The handle is
/// replaced as a whole; its fields are never updated in place.
#[derive(Clone, Default)]
pub struct LockingForwarder {
    inner: Arc<Mutex<Option<Box<dyn Forwarder>>>>,
}

impl LockingForwarder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current forwarder
    pub fn set_forwarder(&self, forwarder: Box<dyn Forwarder>) {
        *self.inner.lock() = Some(forwarder);
    }

    /// Whether a forwarder has been installed
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// # Errors
    ///
    /// Returns [`ForwarderError::NotInitialized`] before a forwarder is set.
    pub fn check_prereqs(&self) -> Result<(), ForwarderError> {
        match self.inner.lock().as_ref() {
            Some(f) => f.check_prereqs(),
            None => Err(ForwarderError::NotInitialized),
        }
    }

    /// # Errors
    ///
    /// Returns [`ForwarderError::NotInitialized`] before a forwarder is set.
    pub fn add(&self, subnets: &[IpNet], dns_ips: &[IpAddr]) -> Result<(), ForwarderError> {
        match self.inner.lock().as_mut() {
            Some(f) => f.add(subnets, dns_ips),
            None => Err(ForwarderError::NotInitialized),
        }
    }

    /// Resetting before a forwarder is set is a no-op
    ///
    /// # Errors
    ///
    /// Returns the forwarder's accumulated cleanup errors.
    pub fn reset(&self) -> Result<(), ForwarderError> {
        match self.inner.lock().as_mut() {
            Some(f) => f.reset(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingForwarder {
        resets: Arc<AtomicUsize>,
    }

    impl Forwarder for CountingForwarder {
        fn check_prereqs(&self) -> Result<(), ForwarderError> {
            Ok(())
        }

        fn add(&mut self, _: &[IpNet], _: &[IpAddr]) -> Result<(), ForwarderError> {
            Ok(())
        }

        fn reset(&mut self) -> Result<(), ForwarderError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_reset_without_forwarder_is_noop() {
        let locking = LockingForwarder::new();
        assert!(locking.reset().is_ok());
        assert!(matches!(
            locking.add(&[], &[]),
            Err(ForwarderError::NotInitialized)
        ));
    }

    #[test]
    fn test_delegates_after_set() {
        let resets = Arc::new(AtomicUsize::new(0));
        let locking = LockingForwarder::new();
        locking.set_forwarder(Box::new(CountingForwarder {
            resets: resets.clone(),
        }));

        assert!(locking.is_set());
        locking.check_prereqs().unwrap();
        locking.add(&[], &[]).unwrap();
        locking.clone().reset().unwrap();
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }
}
