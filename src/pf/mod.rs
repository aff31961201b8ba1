//! macOS packet filter (`/dev/pf`) control interface
//!
//! pfctl has no command for adding an anchor reference to the main ruleset or
//! for looking up NAT state, so both are done with raw ioctls against
//! `/dev/pf`. The request structs mirror the kernel ABI byte for byte; their
//! sizes are checked by [`verify_layouts`] before the device is used.
//!
//! All pointer handling stays in [`PfDevice::ioctl`]. Callers only see typed
//! operations: [`PfDevice::look_up_nat`], [`PfDevice::add_anchor_if_not_exist`]
//! and [`PfDevice::delete_anchor_if_exists`].

mod natlook;
mod rule;
mod ruleset;

use std::fs::File;
use std::net::SocketAddrV4;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::PfError;

pub use natlook::{PfiocNatlook, PFIOC_NATLOOK_SIZE};
pub use rule::{
    ChangeAction, PfiocPooladdr, PfiocRule, RuleAction, PFIOC_POOLADDR_SIZE, PFIOC_RULE_SIZE,
};
pub use ruleset::{PfiocRuleset, PFIOC_RULESET_SIZE};

/// Path of the packet filter device
pub const PF_DEVICE_PATH: &str = "/dev/pf";

/// `MAXPATHLEN` on Darwin
pub const MAXPATHLEN: usize = 1024;

const IOCPARM_MASK: u32 = 0x1fff;
const IOC_OUT: u32 = 0x4000_0000;
const IOC_IN: u32 = 0x8000_0000;
const IOC_INOUT: u32 = IOC_IN | IOC_OUT;
const IOC_GROUP_D: u32 = b'D' as u32;

/// Direction value for outbound state lookups
pub const PF_OUT: u8 = 2;

/// Encode an ioctl request number the way `<sys/ioccom.h>` does
#[must_use]
pub const fn ioc(inout: u32, group: u32, num: u32, len: u32) -> u32 {
    inout | ((len & IOCPARM_MASK) << 16) | (group << 8) | num
}

#[allow(clippy::cast_possible_truncation)]
const fn ioc_d(num: u32, len: usize) -> u32 {
    ioc(IOC_INOUT, IOC_GROUP_D, num, len as u32)
}

pub const DIOCNATLOOK: u32 = ioc_d(23, PFIOC_NATLOOK_SIZE);
pub const DIOCCHANGERULE: u32 = ioc_d(26, PFIOC_RULE_SIZE);
pub const DIOCBEGINADDRS: u32 = ioc_d(51, PFIOC_POOLADDR_SIZE);
pub const DIOCGETRULESETS: u32 = ioc_d(58, PFIOC_RULESET_SIZE);
pub const DIOCGETRULESET: u32 = ioc_d(59, PFIOC_RULESET_SIZE);

type LayoutMismatch = (&'static str, usize, usize);

/// First request struct whose size differs from the kernel ABI
fn find_layout_mismatch() -> Option<LayoutMismatch> {
    let checks: [LayoutMismatch; 4] = [
        (
            "pfioc_natlook",
            PFIOC_NATLOOK_SIZE,
            std::mem::size_of::<PfiocNatlook>(),
        ),
        ("pfioc_rule", PFIOC_RULE_SIZE, std::mem::size_of::<PfiocRule>()),
        (
            "pfioc_pooladdr",
            PFIOC_POOLADDR_SIZE,
            std::mem::size_of::<PfiocPooladdr>(),
        ),
        (
            "pfioc_ruleset",
            PFIOC_RULESET_SIZE,
            std::mem::size_of::<PfiocRuleset>(),
        ),
    ];

    checks.into_iter().find(|(_, expected, actual)| expected != actual)
}

/// Computed on first use, shared by every later check
static LAYOUT_MISMATCH: Lazy<Option<LayoutMismatch>> = Lazy::new(find_layout_mismatch);

/// Check that every request struct matches the kernel ABI size
///
/// The sizes are compared once per process; later calls reuse the result.
///
/// # Errors
///
/// Returns [`PfError::LayoutMismatch`] naming the first struct whose size differs.
pub fn verify_layouts() -> Result<(), PfError> {
    match *LAYOUT_MISMATCH {
        Some((name, expected, actual)) => Err(PfError::LayoutMismatch {
            name,
            expected,
            actual,
        }),
        None => Ok(()),
    }
}

/// Open handle to `/dev/pf`
#[derive(Debug)]
pub struct PfDevice {
    file: File,
}

impl PfDevice {
    /// Open the packet filter device after checking struct layouts
    ///
    /// # Errors
    ///
    /// Returns [`PfError::LayoutMismatch`] or [`PfError::Open`].
    pub fn open() -> Result<Self, PfError> {
        verify_layouts()?;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(PF_DEVICE_PATH)
            .map_err(|e| PfError::Open {
                path: PF_DEVICE_PATH.into(),
                reason: e.to_string(),
            })?;

        Ok(Self { file })
    }

    /// Look up the pre-NAT destination of a redirected TCP connection
    ///
    /// `src` is the client's address and `dst` the local address it was
    /// redirected to, as observed on the accepted socket.
    ///
    /// # Errors
    ///
    /// Returns [`PfError::Ioctl`] if no matching state exists.
    pub fn look_up_nat(&self, src: SocketAddrV4, dst: SocketAddrV4) -> Result<SocketAddrV4, PfError> {
        let mut natlook = PfiocNatlook::for_tcp_out(src, dst);
        self.ioctl(DIOCNATLOOK, "natlook", &mut natlook)?;
        Ok(natlook.redirected_dst())
    }

    /// Append an anchor reference of the given kind to the main ruleset
    ///
    /// # Errors
    ///
    /// Returns [`PfError`] if the name is too long or an ioctl fails.
    pub fn add_anchor_if_not_exist(&self, name: &str, action: RuleAction) -> Result<(), PfError> {
        let mut pooladdr = PfiocPooladdr::zeroed();
        self.ioctl(DIOCBEGINADDRS, "begin addrs", &mut pooladdr)?;

        let mut rule = PfiocRule::zeroed();
        rule.set_action(ChangeAction::GetTicket);
        rule.set_pool_ticket(&pooladdr);
        rule.set_anchor_call(name)?;
        rule.set_rule_action(action);

        self.ioctl(DIOCCHANGERULE, "change rule (get ticket)", &mut rule)?;

        rule.set_action(ChangeAction::AddTail);
        self.ioctl(DIOCCHANGERULE, "change rule (add tail)", &mut rule)?;

        debug!(anchor = %name, ?action, "Added pf anchor");
        Ok(())
    }

    /// Remove anchor references of the given kinds, if the anchor exists
    ///
    /// A missing anchor is not an error, so this can be retried safely.
    ///
    /// # Errors
    ///
    /// Returns [`PfError::Ioctl`] if any ioctl fails.
    pub fn delete_anchor_if_exists(&self, name: &str, actions: &[RuleAction]) -> Result<(), PfError> {
        let Some(ruleset) = self.find_anchor_ruleset(name)? else {
            debug!(anchor = %name, "pf anchor not found, nothing to delete");
            return Ok(());
        };

        for &action in actions {
            let mut rule = PfiocRule::zeroed();
            rule.nr = ruleset.nr;
            rule.set_action(ChangeAction::GetTicket);
            rule.set_rule_action(action);

            self.ioctl(DIOCCHANGERULE, "change rule (get ticket)", &mut rule)?;

            rule.set_action(ChangeAction::Remove);
            self.ioctl(DIOCCHANGERULE, "change rule (remove)", &mut rule)?;

            debug!(anchor = %name, ?action, "Removed pf anchor");
        }

        Ok(())
    }

    fn find_anchor_ruleset(&self, name: &str) -> Result<Option<PfiocRuleset>, PfError> {
        let mut all = PfiocRuleset::zeroed();
        self.ioctl(DIOCGETRULESETS, "get rulesets", &mut all)?;

        for i in 0..all.nr {
            let mut ruleset = PfiocRuleset::zeroed();
            ruleset.nr = i;
            self.ioctl(DIOCGETRULESET, "get ruleset", &mut ruleset)?;

            if ruleset.name_string() == name {
                return Ok(Some(ruleset));
            }
        }

        Ok(None)
    }

    #[cfg(target_os = "macos")]
    fn ioctl<T>(&self, request: u32, name: &'static str, arg: &mut T) -> Result<(), PfError> {
        use std::os::unix::io::AsRawFd;

        // SAFETY: `arg` is a live, exclusively borrowed #[repr(C)] request struct
        // whose size is encoded in `request` and checked by verify_layouts().
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                libc::c_ulong::from(request),
                std::ptr::from_mut(arg).cast::<libc::c_void>(),
            )
        };
        if ret < 0 {
            return Err(PfError::ioctl(name, &std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    fn ioctl<T>(&self, _request: u32, _name: &'static str, _arg: &mut T) -> Result<(), PfError> {
        let _ = &self.file;
        Err(PfError::Unsupported)
    }
}

/// Anchor management seam used by the pfctl forwarder
pub trait AnchorControl: Send + Sync {
    /// Add an anchor reference of the given kind
    ///
    /// # Errors
    ///
    /// Returns [`PfError`] on device failures.
    fn add_anchor_if_not_exist(&self, name: &str, action: RuleAction) -> Result<(), PfError>;

    /// Remove anchor references of the given kinds, if present
    ///
    /// # Errors
    ///
    /// Returns [`PfError`] on device failures.
    fn delete_anchor_if_exists(&self, name: &str, actions: &[RuleAction]) -> Result<(), PfError>;
}

/// [`AnchorControl`] that opens `/dev/pf` for each operation
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceAnchors;

impl AnchorControl for DeviceAnchors {
    fn add_anchor_if_not_exist(&self, name: &str, action: RuleAction) -> Result<(), PfError> {
        PfDevice::open()?.add_anchor_if_not_exist(name, action)
    }

    fn delete_anchor_if_exists(&self, name: &str, actions: &[RuleAction]) -> Result<(), PfError> {
        PfDevice::open()?.delete_anchor_if_exists(name, actions)
    }
}
