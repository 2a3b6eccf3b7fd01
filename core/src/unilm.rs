//! Unigram language model over byte-string pieces.
//!
//! A `UniLm` owns a byte pool, per-piece metadata, natural-log
//! probabilities, and a double-array trie mapping every piece's bytes to
//! its id (tagged on the terminator node). Training (EM + MDL pruning)
//! lives in [`crate::em`].

use crate::trie::{DaRead, DoubleArray, TERM_VALUE_MAX};
use crate::{utf8, Error, Result};

/// Piece flag: never pruned. Single-codepoint pieces are implicitly
/// mandatory regardless of this bit (coverage invariant).
pub const PIECE_MANDATORY: u8 = 1 << 0;

/// Piece metadata: a slice of the model's byte pool plus cached lengths.
#[derive(Debug, Clone, Copy)]
pub struct Piece {
    pub off: u32,
    pub len: u16,
    pub len_cp: u16,
    pub flags: u8,
}

/// Unigram piece model.
#[derive(Debug, Clone)]
pub struct UniLm {
    pool: Vec<u8>,
    pieces: Vec<Piece>,
    /// ln(probability) per piece id.
    pub logp: Vec<f64>,
    trie: DoubleArray,
}

impl UniLm {
    pub fn new() -> Self {
        Self::with_trie_capacity(256)
    }

    pub fn with_trie_capacity(da_capacity: usize) -> Self {
        Self {
            pool: Vec::new(),
            pieces: Vec::new(),
            logp: Vec::new(),
            trie: DoubleArray::new(da_capacity),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    pub fn trie(&self) -> &DoubleArray {
        &self.trie
    }

    pub fn piece(&self, id: usize) -> &Piece {
        &self.pieces[id]
    }

    pub fn piece_bytes(&self, id: usize) -> &[u8] {
        let p = &self.pieces[id];
        &self.pool[p.off as usize..p.off as usize + p.len as usize]
    }

    /// True when pruning must retain `id`.
    pub fn is_mandatory(&self, id: usize) -> bool {
        let p = &self.pieces[id];
        p.flags & PIECE_MANDATORY != 0 || p.len_cp <= 1
    }

    /// Drop all pieces; the trie keeps its capacity.
    pub fn clear(&mut self) {
        self.pool.clear();
        self.pieces.clear();
        self.logp.clear();
        self.trie.clear();
    }

    /// Look up the id of an exact piece key.
    pub fn find_id(&self, bytes: &[u8]) -> Option<u32> {
        if bytes.is_empty() {
            return None;
        }
        self.trie.get_term_value(bytes).map(u32::from)
    }

    /// Add a piece, deduplicating against an existing key (flags merge).
    /// Returns the piece id.
    pub fn add_piece(&mut self, bytes: &[u8], flags: u8) -> Result<u32> {
        if bytes.is_empty() {
            return Err(Error::BadArgument("empty piece"));
        }
        if bytes.len() > usize::from(u16::MAX) {
            return Err(Error::BadArgument("piece longer than 64KiB"));
        }
        if let Some(id) = self.find_id(bytes) {
            self.pieces[id as usize].flags |= flags;
            return Ok(id);
        }
        // Terminal values share the decoder's 16-bit id space.
        if self.pieces.len() >= usize::from(TERM_VALUE_MAX) {
            return Err(Error::Full("unigram vocabulary id space"));
        }

        let id = self.pieces.len() as u32;
        let off = self.pool.len() as u32;
        self.pool.extend_from_slice(bytes);
        self.pieces.push(Piece {
            off,
            len: bytes.len() as u16,
            len_cp: utf8::count_cps(bytes) as u16,
            flags,
        });
        // Initial logp is 0; callers normalize or run EM.
        self.logp.push(0.0);

        self.trie.set_term_value(bytes, id as u16)?;
        Ok(id)
    }

    pub fn set_logp(&mut self, id: u32, logp: f64) -> Result<()> {
        let slot = self
            .logp
            .get_mut(id as usize)
            .ok_or(Error::BadArgument("piece id out of range"))?;
        *slot = logp;
        Ok(())
    }

    /// Convert `logp` to probabilities, normalize to sum 1, floor at
    /// `min_prob`, then renormalize once more so the floor does not
    /// perturb the sum measurably.
    pub fn normalize(&mut self, min_prob: f64) -> Result<()> {
        if self.pieces.is_empty() {
            return Err(Error::BadArgument("normalize on empty vocabulary"));
        }
        let min_prob = if min_prob > 0.0 { min_prob } else { 1e-12 };

        for _pass in 0..2 {
            let mut sum = 0.0;
            for &lp in &self.logp {
                let p = lp.exp();
                if p > 0.0 {
                    sum += p;
                }
            }
            if !(sum > 0.0) {
                return Err(Error::Internal("probability mass vanished"));
            }
            let inv = 1.0 / sum;
            for lp in &mut self.logp {
                let p = (lp.exp() * inv).max(min_prob);
                *lp = p.ln();
            }
        }
        Ok(())
    }

    /// Rebuild the trie inserting pieces in lexicographic byte order.
    ///
    /// Training adds pieces in hash order; insertion order changes the
    /// double array's collision/relocation pattern, and deterministic
    /// lexicographic insertion keeps the shape stable on large
    /// vocabularies.
    pub fn rebuild_trie_sorted(&mut self) -> Result<()> {
        if self.pieces.is_empty() {
            self.trie.clear();
            return Ok(());
        }
        let mut ids: Vec<u32> = (0..self.pieces.len() as u32).collect();
        ids.sort_unstable_by(|&a, &b| {
            self.piece_bytes(a as usize)
                .cmp(self.piece_bytes(b as usize))
                .then(a.cmp(&b))
        });

        self.trie.clear();
        for &id in &ids {
            let p = self.pieces[id as usize];
            let (off, len) = (p.off as usize, p.len as usize);
            self.trie
                .set_term_value(&self.pool[off..off + len], id as u16)?;
        }
        tracing::debug!(vocab = self.pieces.len(), capacity = self.trie.capacity(), "rebuilt trie in lexicographic order");
        Ok(())
    }

    /// Retain exactly the pieces whose `keep` slot is true, compacting
    /// piece metadata and `logp` in place (kept order preserved, pool
    /// untouched), then rebuild the trie under the new ids.
    pub(crate) fn compact(&mut self, keep: &[bool]) -> Result<usize> {
        if keep.len() != self.pieces.len() {
            return Err(Error::BadArgument("keep mask length mismatch"));
        }
        let mut new_v = 0usize;
        for i in 0..self.pieces.len() {
            if keep[i] {
                self.pieces[new_v] = self.pieces[i];
                self.logp[new_v] = self.logp[i];
                new_v += 1;
            }
        }
        self.pieces.truncate(new_v);
        self.logp.truncate(new_v);

        self.trie.clear();
        for id in 0..new_v {
            let p = self.pieces[id];
            let (off, len) = (p.off as usize, p.len as usize);
            if len == 0 {
                return Err(Error::Internal("empty piece survived pruning"));
            }
            self.trie
                .set_term_value(&self.pool[off..off + len], id as u16)
                .map_err(|_| Error::Internal("trie re-insert failed during compaction"))?;
        }
        Ok(new_v)
    }
}

impl Default for UniLm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_find_dedup() {
        let mut m = UniLm::new();
        let a = m.add_piece("あ".as_bytes(), PIECE_MANDATORY).unwrap();
        let b = m.add_piece("あい".as_bytes(), 0).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(m.find_id("あ".as_bytes()), Some(0));
        assert_eq!(m.find_id("あい".as_bytes()), Some(1));
        assert_eq!(m.find_id("い".as_bytes()), None);

        // duplicate returns the same id and merges flags
        let again = m.add_piece("あい".as_bytes(), PIECE_MANDATORY).unwrap();
        assert_eq!(again, 1);
        assert!(m.piece(1).flags & PIECE_MANDATORY != 0);
        assert_eq!(m.vocab_size(), 2);
    }

    #[test]
    fn piece_lengths() {
        let mut m = UniLm::new();
        let id = m.add_piece("日本語".as_bytes(), 0).unwrap() as usize;
        assert_eq!(m.piece(id).len, 9);
        assert_eq!(m.piece(id).len_cp, 3);
        assert_eq!(m.piece_bytes(id), "日本語".as_bytes());
    }

    #[test]
    fn single_codepoints_are_mandatory() {
        let mut m = UniLm::new();
        let s = m.add_piece("x".as_bytes(), 0).unwrap() as usize;
        let w = m.add_piece("xy".as_bytes(), 0).unwrap() as usize;
        assert!(m.is_mandatory(s));
        assert!(!m.is_mandatory(w));
    }

    #[test]
    fn normalize_sums_to_one_with_floor() {
        let mut m = UniLm::new();
        for (i, k) in ["a", "b", "c", "d"].iter().enumerate() {
            let id = m.add_piece(k.as_bytes(), 0).unwrap();
            m.set_logp(id, -(i as f64)).unwrap();
        }
        m.normalize(1e-9).unwrap();
        let sum: f64 = m.logp.iter().map(|lp| lp.exp()).sum();
        assert!((sum - 1.0).abs() < 1e-9, "sum = {sum}");
        assert!(m.logp.iter().all(|&lp| lp >= (1e-9f64).ln() - 1e-12));
    }

    #[test]
    fn rebuild_sorted_preserves_ids() {
        let mut m = UniLm::new();
        // insert out of lexicographic order
        let keys = ["zz", "a", "mm", "ab", "z"];
        let ids: Vec<u32> = keys
            .iter()
            .map(|k| m.add_piece(k.as_bytes(), 0).unwrap())
            .collect();
        m.rebuild_trie_sorted().unwrap();
        for (k, id) in keys.iter().zip(ids) {
            assert_eq!(m.find_id(k.as_bytes()), Some(id));
        }
    }

    #[test]
    fn compact_renumbers_and_rebuilds() {
        let mut m = UniLm::new();
        for k in ["a", "bb", "c", "dd"] {
            m.add_piece(k.as_bytes(), 0).unwrap();
        }
        for id in 0..4 {
            m.set_logp(id, -1.0).unwrap();
        }
        let kept = m.compact(&[true, false, true, true]).unwrap();
        assert_eq!(kept, 3);
        assert_eq!(m.find_id(b"a"), Some(0));
        assert_eq!(m.find_id(b"bb"), None);
        assert_eq!(m.find_id(b"c"), Some(1));
        assert_eq!(m.find_id(b"dd"), Some(2));
    }
}
