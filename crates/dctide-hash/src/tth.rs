//! Tiger tree (THEX) hashing.
//!
//! Files are hashed in 1024-byte segments. Each segment is a leaf,
//! `Tiger(0x00 || segment)`; adjacent subtrees combine as
//! `Tiger(0x01 || left || right)`, with an unpaired node promoted to the
//! next level unchanged. The 24-byte root of the whole tree is the TTH
//! by which files are identified across hubs; the serialized leaf row of
//! a chosen depth (the TTHL) lets a downloader verify the file block by
//! block.

use base32::Alphabet;
use digest::Digest;
use tiger::Tiger;

use crate::error::HashError;
use crate::{TTH_BASE32_LEN, TTH_BYTES, TTH_SEGMENT};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;
const B32: Alphabet = Alphabet::Rfc4648 { padding: false };

/// 24-byte Tiger tree root hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tth(pub [u8; TTH_BYTES]);

impl Tth {
    /// Parse the 39-character base32 text form.
    ///
    /// # Errors
    ///
    /// Rejects any input that is not exactly 39 characters of the
    /// RFC 4648 alphabet.
    pub fn from_base32(s: &str) -> Result<Self, HashError> {
        if s.len() != TTH_BASE32_LEN {
            return Err(HashError::TthLength(s.len()));
        }
        let bytes = base32::decode(B32, s).ok_or(HashError::TthAlphabet)?;
        let arr: [u8; TTH_BYTES] = bytes
            .try_into()
            .map_err(|_| HashError::TthLength(s.len()))?;
        Ok(Tth(arr))
    }

    /// Render the 39-character base32 text form.
    #[must_use]
    pub fn to_base32(&self) -> String {
        base32::encode(B32, &self.0)
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TTH_BYTES] {
        &self.0
    }
}

impl std::fmt::Display for Tth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl std::fmt::Debug for Tth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tth({})", self.to_base32())
    }
}

impl std::str::FromStr for Tth {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tth::from_base32(s)
    }
}

fn combine(left: &[u8; TTH_BYTES], right: &[u8; TTH_BYTES]) -> [u8; TTH_BYTES] {
    let mut h = Tiger::new();
    h.update([NODE_PREFIX]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

/// Streaming Tiger tree context.
///
/// Consumes an arbitrary byte stream and yields the root of the subtree
/// covering exactly the bytes consumed. The download path keeps one of
/// these per in-flight block; rehashing a partial block on resume
/// re-seeds it by replaying the bytes already on disk.
#[derive(Clone, Debug)]
pub struct TthContext {
    leaf: Tiger,
    leaf_len: usize,
    stack: Vec<[u8; TTH_BYTES]>,
    leaves: u64,
}

impl TthContext {
    /// Fresh context covering zero bytes.
    #[must_use]
    pub fn new() -> Self {
        TthContext {
            leaf: Tiger::new_with_prefix([LEAF_PREFIX]),
            leaf_len: 0,
            stack: Vec::new(),
            leaves: 0,
        }
    }

    /// Total bytes consumed so far.
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.leaves * TTH_SEGMENT as u64 + self.leaf_len as u64
    }

    /// Feed bytes.
    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (TTH_SEGMENT - self.leaf_len).min(data.len());
            self.leaf.update(&data[..take]);
            self.leaf_len += take;
            data = &data[take..];
            if self.leaf_len == TTH_SEGMENT {
                self.close_leaf();
            }
        }
    }

    fn close_leaf(&mut self) {
        let done = std::mem::replace(&mut self.leaf, Tiger::new_with_prefix([LEAF_PREFIX]));
        self.leaf_len = 0;
        self.push(done.finalize().into());
    }

    fn push(&mut self, mut hash: [u8; TTH_BYTES]) {
        let mut n = self.leaves;
        while n & 1 == 1 {
            let left = self.stack.pop().expect("stack tracks completed leaves");
            hash = combine(&left, &hash);
            n >>= 1;
        }
        self.stack.push(hash);
        self.leaves += 1;
    }

    /// Finish and return the subtree root.
    ///
    /// A context that consumed no bytes yields the empty-leaf hash,
    /// which is also the TTH of a zero-length file.
    #[must_use]
    pub fn finalize(mut self) -> Tth {
        if self.leaf_len > 0 || self.leaves == 0 {
            self.close_leaf();
        }
        let mut iter = self.stack.into_iter().rev();
        let mut acc = iter.next().expect("at least one subtree after close");
        for left in iter {
            acc = combine(&left, &acc);
        }
        Tth(acc)
    }
}

impl Default for TthContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Root of a row of leaves, combined pairwise with unpaired promotion.
///
/// An empty slice yields the empty-leaf hash.
#[must_use]
pub fn tth_root(leaves: &[[u8; TTH_BYTES]]) -> Tth {
    if leaves.is_empty() {
        return TthContext::new().finalize();
    }
    let mut level: Vec<[u8; TTH_BYTES]> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            next.push(if pair.len() == 2 {
                combine(&pair[0], &pair[1])
            } else {
                pair[0]
            });
        }
        level = next;
    }
    Tth(level[0])
}

/// Split a serialized TTHL blob into its 24-byte leaves.
///
/// # Errors
///
/// Fails when the blob is not a whole number of leaves.
pub fn leaves_from_blob(blob: &[u8]) -> Result<Vec<[u8; TTH_BYTES]>, HashError> {
    if blob.len() % TTH_BYTES != 0 {
        return Err(HashError::TthlLength(blob.len()));
    }
    Ok(blob
        .chunks_exact(TTH_BYTES)
        .map(|c| c.try_into().expect("chunks_exact"))
        .collect())
}

/// Serialize leaves back into a TTHL blob.
#[must_use]
pub fn leaves_to_blob(leaves: &[[u8; TTH_BYTES]]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(leaves.len() * TTH_BYTES);
    for leaf in leaves {
        blob.extend_from_slice(leaf);
    }
    blob
}

/// Native block size implied by a leaf count.
///
/// The smallest power-of-two multiple of the 1024-byte segment such that
/// `leaves` blocks cover `filesize` bytes.
#[must_use]
pub fn block_size(filesize: u64, leaves: u64) -> u64 {
    let mut bs = TTH_SEGMENT as u64;
    if leaves == 0 {
        return bs;
    }
    while bs.saturating_mul(leaves) < filesize {
        bs *= 2;
    }
    bs
}

#[cfg(test)]
mod tests {
    use super::*;

    // tthsum reference vectors
    const EMPTY: &str = "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ";
    const A1024: &str = "L66Q4YVNAFWVS23X2HJIRA5ZJ7WXR3F26RSASFA";
    const A1025: &str = "PZMRYHGY6LTBEH63ZWAHDORHSYTLO4LEFUIKHWY";

    fn hash_all(data: &[u8]) -> Tth {
        let mut ctx = TthContext::new();
        ctx.update(data);
        ctx.finalize()
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(hash_all(b"").to_base32(), EMPTY);
    }

    #[test]
    fn test_single_segment() {
        assert_eq!(hash_all(&[b'A'; 1024]).to_base32(), A1024);
    }

    #[test]
    fn test_segment_boundary_spill() {
        assert_eq!(hash_all(&[b'A'; 1025]).to_base32(), A1025);
    }

    #[test]
    fn test_update_split_invariance() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let whole = hash_all(&data);
        let mut ctx = TthContext::new();
        for chunk in data.chunks(37) {
            ctx.update(chunk);
        }
        assert_eq!(ctx.finalize(), whole);
    }

    #[test]
    fn test_consumed_counter() {
        let mut ctx = TthContext::new();
        ctx.update(&[0u8; 1500]);
        assert_eq!(ctx.consumed(), 1500);
        ctx.update(&[0u8; 700]);
        assert_eq!(ctx.consumed(), 2200);
    }

    #[test]
    fn test_root_matches_leaf_row() {
        // Hash 5 segments as one stream, then recombine the per-segment
        // leaves; both must agree.
        let data: Vec<u8> = (0..5 * 1024u32).map(|i| (i % 7) as u8).collect();
        let whole = hash_all(&data);

        let leaves: Vec<[u8; 24]> = data
            .chunks(1024)
            .map(|seg| {
                let mut ctx = TthContext::new();
                ctx.update(seg);
                ctx.finalize().0
            })
            .collect();
        assert_eq!(tth_root(&leaves), whole);
    }

    #[test]
    fn test_base32_roundtrip() {
        let t = hash_all(b"roundtrip");
        let text = t.to_base32();
        assert_eq!(text.len(), 39);
        assert_eq!(Tth::from_base32(&text).unwrap(), t);
    }

    #[test]
    fn test_base32_rejects_bad_input() {
        assert!(matches!(
            Tth::from_base32("SHORT"),
            Err(HashError::TthLength(5))
        ));
        let bad = "!".repeat(39);
        assert!(Tth::from_base32(&bad).is_err());
    }

    #[test]
    fn test_leaves_blob_roundtrip() {
        let leaves = vec![[1u8; 24], [2u8; 24], [3u8; 24]];
        let blob = leaves_to_blob(&leaves);
        assert_eq!(blob.len(), 72);
        assert_eq!(leaves_from_blob(&blob).unwrap(), leaves);
        assert!(leaves_from_blob(&blob[..70]).is_err());
    }

    #[test]
    fn test_block_size() {
        // 4 MiB file with 4 leaves: each leaf covers 1 MiB.
        assert_eq!(block_size(4 << 20, 4), 1 << 20);
        // One more byte forces the next power of two.
        assert_eq!(block_size((4 << 20) + 1, 4), 2 << 20);
        // Tiny files never go below one segment.
        assert_eq!(block_size(10, 4), 1024);
        assert_eq!(block_size(0, 0), 1024);
    }
}
