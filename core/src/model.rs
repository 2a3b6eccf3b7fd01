//! Decode-time model bundle: dictionary trie, unigram/bigram tables, CRF
//! weights and global flags.
//!
//! Combined edge scoring is `crf_score + lambda0 * lm_score`, everything
//! Q8.8. Word ids are 16-bit; `0xFFFF` means "no dictionary entry" and
//! `0xFFFE` is the synthetic BOS id.

use crate::charclass::CcConfig;
use crate::crf::CrfParams;
use crate::trie::DoubleArray;

/// Id for spans with no dictionary entry (OOV).
pub const ID_NONE: u16 = 0xFFFF;
/// Synthetic beginning-of-sentence id.
pub const ID_BOS: u16 = 0xFFFE;

/// Lossless whitespace substitution was active at training time; drivers
/// should encode/decode accordingly.
pub const FLAG_LOSSLESS_WS: u32 = 1 << 0;
pub const FLAG_CC_ASCII: u32 = 1 << 8;
pub const FLAG_CC_UTF8LEN: u32 = 1 << 9;
pub const FLAG_CC_RANGES: u32 = 1 << 10;
pub const FLAG_CC_COMPAT: u32 = 1 << 11;

/// Dictionary language model: trie-indexed unigram log-probabilities with
/// an optional bigram table and a length-linear unknown-word penalty.
#[derive(Debug, Clone)]
pub struct LmParams {
    /// Byte-keyed index; terminal values are word ids.
    pub trie: DoubleArray,
    /// Unigram log-probabilities (Q8.8), indexed by word id.
    pub logp_uni: Vec<i16>,
    /// Sorted bigram keys `(prev_id << 16) | curr_id`.
    pub bigram_key: Vec<u32>,
    /// Bigram log-probabilities (Q8.8), parallel to `bigram_key`.
    pub logp_bi: Vec<i16>,
    /// Unknown-word base penalty (Q8.8).
    pub unk_base: i16,
    /// Unknown-word per-codepoint penalty (Q8.8, typically negative).
    pub unk_per_cp: i16,
}

impl LmParams {
    /// Unigram log-probability of `id`, or the unknown-word penalty
    /// `unk_base + unk_per_cp * len_cp` for OOV/BOS spans.
    #[inline]
    pub fn unigram_logp(&self, id: u16, len_cp: u16) -> i16 {
        if id != ID_NONE && id != ID_BOS {
            if let Some(&lp) = self.logp_uni.get(usize::from(id)) {
                return lp;
            }
        }
        let v = i32::from(self.unk_base) + i32::from(self.unk_per_cp) * i32::from(len_cp);
        v.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
    }

    /// Bigram log-probability of `prev -> curr`, backing off to
    /// `curr_backoff` (the caller's unigram score for the span) when the
    /// pair is absent or either side is OOV.
    #[inline]
    pub fn bigram_logp(&self, prev: u16, curr: u16, curr_backoff: i16) -> i16 {
        if self.bigram_key.is_empty() || prev == ID_NONE || curr == ID_NONE {
            return curr_backoff;
        }
        let key = (u32::from(prev) << 16) | u32::from(curr);
        match self.bigram_key.binary_search(&key) {
            Ok(i) => self.logp_bi[i],
            Err(_) => curr_backoff,
        }
    }
}

/// Complete decode-time model.
#[derive(Debug, Clone)]
pub struct Model {
    pub crf: CrfParams,
    pub lm: LmParams,
    /// Weight of the generative LM in the combined edge score (Q8.8).
    pub lambda0: i16,
    /// Maximum word length in codepoints; bounds the lattice.
    pub max_word_len: u16,
    pub flags: u32,
    pub cc: CcConfig,
}

impl Model {
    pub fn lossless_ws(&self) -> bool {
        self.flags & FLAG_LOSSLESS_WS != 0
    }
}
