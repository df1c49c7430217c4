//! User identity.

use dctide_hash::{tth::TthContext, Tth};

/// A peer, identified across hubs by a 64-bit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub u64);

impl Uid {
    /// 16-hex-digit rendering, used for `fl/` filenames.
    #[must_use]
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    /// Parse the 16-hex-digit form back into an id.
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Uid> {
        if s.len() != 16 {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(Uid)
    }

    /// Pseudo-TTH keying a file-list download of this user: the Tiger
    /// tree hash of the 8 big-endian id bytes.
    #[must_use]
    pub fn list_tth(self) -> Tth {
        let mut ctx = TthContext::new();
        ctx.update(&self.0.to_be_bytes());
        ctx.finalize()
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}
