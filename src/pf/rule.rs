//! `struct pfioc_rule` and `struct pfioc_pooladdr`
//!
//! Only the header fields are modelled. The embedded `struct pf_rule` is kept
//! as opaque bytes apart from its action byte.

use crate::error::PfError;

use super::MAXPATHLEN;

/// Size of `struct pfioc_rule` on Darwin
pub const PFIOC_RULE_SIZE: usize = 3104;

/// Size of `struct pfioc_pooladdr` on Darwin
pub const PFIOC_POOLADDR_SIZE: usize = 1136;

const PF_RULE_SIZE: usize = 1040;
const PF_RULE_ACTION_OFFSET: usize = 1004;
const POOLADDR_TAIL_SIZE: usize = 1117;

/// `PF_CHANGE_*` operation for `DIOCCHANGERULE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChangeAction {
    AddTail = 2,
    Remove = 5,
    GetTicket = 6,
}

/// `pf_rule.action` values used for anchor references
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuleAction {
    /// `anchor "name"`
    Pass = 0,
    /// `rdr-anchor "name"`
    Rdr = 8,
}

impl RuleAction {
    /// Keyword pfctl prints for this anchor kind in `pfctl -s all`
    #[must_use]
    pub const fn anchor_keyword(self) -> &'static str {
        match self {
            Self::Pass => "anchor",
            Self::Rdr => "rdr-anchor",
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PfiocRule {
    pub action: u32,
    pub ticket: u32,
    pub pool_ticket: u32,
    pub nr: u32,
    pub anchor: [u8; MAXPATHLEN],
    pub anchor_call: [u8; MAXPATHLEN],
    pub rule: [u8; PF_RULE_SIZE],
}

impl PfiocRule {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            action: 0,
            ticket: 0,
            pool_ticket: 0,
            nr: 0,
            anchor: [0; MAXPATHLEN],
            anchor_call: [0; MAXPATHLEN],
            rule: [0; PF_RULE_SIZE],
        }
    }

    pub fn set_action(&mut self, action: ChangeAction) {
        self.action = action as u32;
    }

    pub fn set_pool_ticket(&mut self, pooladdr: &PfiocPooladdr) {
        self.pool_ticket = pooladdr.ticket;
    }

    pub fn set_rule_action(&mut self, action: RuleAction) {
        self.rule[PF_RULE_ACTION_OFFSET] = action as u8;
    }

    #[must_use]
    pub const fn rule_action(&self) -> u8 {
        self.rule[PF_RULE_ACTION_OFFSET]
    }

    /// Set the called anchor name; it must leave room for a trailing NUL
    ///
    /// # Errors
    ///
    /// Returns [`PfError::NameTooLong`] if the name does not fit.
    pub fn set_anchor_call(&mut self, name: &str) -> Result<(), PfError> {
        copy_name(&mut self.anchor_call, name)
    }

    /// Set the enclosing anchor path
    ///
    /// # Errors
    ///
    /// Returns [`PfError::NameTooLong`] if the name does not fit.
    pub fn set_anchor(&mut self, name: &str) -> Result<(), PfError> {
        copy_name(&mut self.anchor, name)
    }
}

fn copy_name(dst: &mut [u8], name: &str) -> Result<(), PfError> {
    let bytes = name.as_bytes();
    if bytes.len() > dst.len() - 1 {
        return Err(PfError::NameTooLong(name.to_string()));
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    dst[bytes.len()..].fill(0);
    Ok(())
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PfiocPooladdr {
    pub action: u32,
    pub ticket: u32,
    pub nr: u32,
    pub r_num: u32,
    pub r_action: u8,
    pub r_last: u8,
    pub af: u8,
    pub tail: [u8; POOLADDR_TAIL_SIZE],
}

impl PfiocPooladdr {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            action: 0,
            ticket: 0,
            nr: 0,
            r_num: 0,
            r_action: 0,
            r_last: 0,
            af: 0,
            tail: [0; POOLADDR_TAIL_SIZE],
        }
    }
}
