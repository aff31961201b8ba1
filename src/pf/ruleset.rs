//! `struct pfioc_ruleset`

use super::MAXPATHLEN;

/// Size of `struct pfioc_ruleset` on Darwin
pub const PFIOC_RULESET_SIZE: usize = 1092;

const PF_ANCHOR_NAME_SIZE: usize = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PfiocRuleset {
    pub nr: u32,
    pub path: [u8; MAXPATHLEN],
    pub name: [u8; PF_ANCHOR_NAME_SIZE],
}

impl PfiocRuleset {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            nr: 0,
            path: [0; MAXPATHLEN],
            name: [0; PF_ANCHOR_NAME_SIZE],
        }
    }

    /// Anchor name with NUL bytes dropped
    #[must_use]
    pub fn name_string(&self) -> String {
        self.name
            .iter()
            .filter(|&&b| b != 0)
            .map(|&b| char::from(b))
            .collect()
    }
}
