//! Flushing the operating system's DNS cache
//!
//! macOS caches negative answers in mDNSResponder for a long time, so names
//! looked up before the bridge started would keep failing after it took
//! over. Other platforms are left alone.

use std::sync::Arc;

use tracing::debug;

use crate::forwarder::{CmdExecutor, OsCmdExecutor};

/// Clears the OS resolver cache
pub struct OsDnsCache {
    exec: Arc<dyn CmdExecutor>,
}

impl Default for OsDnsCache {
    fn default() -> Self {
        Self::new(Arc::new(OsCmdExecutor))
    }
}

impl OsDnsCache {
    pub fn new(exec: Arc<dyn CmdExecutor>) -> Self {
        Self { exec }
    }

    /// Best effort; failures are only logged
    pub fn flush(&self) {
        if cfg!(target_os = "macos") {
            self.flush_macos();
        } else {
            debug!("Skipping clearing of OS DNS cache");
        }
    }

    fn flush_macos(&self) {
        let args = ["-HUP".to_string(), "mDNSResponder".to_string()];
        match self.exec.combined_output("killall", &args, None) {
            Ok(_) => {
                debug!("Successfully cleared via mDNSResponder");
                return;
            }
            Err(e) => debug!(error = %e, "Failed clearing mDNSResponder cache"),
        }

        let args = ["udnsflushcaches".to_string()];
        match self.exec.combined_output("discoveryutil", &args, None) {
            Ok(_) => debug!("Successfully cleared via discoveryutil"),
            Err(e) => debug!(error = %e, "Failed clearing via discoveryutil"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::cmd::fake::FakeCmdExecutor;

    #[test]
    fn test_macos_falls_back_to_discoveryutil() {
        let exec = Arc::new(FakeCmdExecutor::default());
        exec.set_failure("killall -HUP mDNSResponder", "no such process");
        let cache = OsDnsCache::new(exec.clone());

        cache.flush_macos();

        assert_eq!(
            exec.take_cmds(),
            vec![
                vec!["killall".to_string(), "-HUP".into(), "mDNSResponder".into()],
                vec!["discoveryutil".to_string(), "udnsflushcaches".into()],
            ]
        );
    }

    #[test]
    fn test_macos_stops_after_killall() {
        let exec = Arc::new(FakeCmdExecutor::default());
        let cache = OsDnsCache::new(exec.clone());
        cache.flush_macos();
        assert_eq!(exec.take_cmds().len(), 1);
    }

    #[test]
    fn test_flush_elsewhere_runs_nothing() {
        let exec = Arc::new(FakeCmdExecutor::default());
        let cache = OsDnsCache::new(exec.clone());
        cache.flush();
        if cfg!(target_os = "macos") {
            assert!(!exec.take_cmds().is_empty());
        } else {
            assert!(exec.take_cmds().is_empty());
        }
    }
}
