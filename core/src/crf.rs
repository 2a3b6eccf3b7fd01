//! Two-label markov CRF parameters.
//!
//! Labels: 1 = word start, 0 = word internal. Transition weights are
//! observation-independent constants named `trans{yp}{yc}` (previous label
//! to current label). Emission weights live in a key-sorted table looked
//! up by binary search; a missing key contributes zero.
//!
//! Emission features are five templates over the character classes around
//! a position, packed into a 32-bit key:
//! `(template_id << 24) | (label << 16) | (v1 << 8) | v2`
//!
//! - 0: current class
//! - 1: previous class
//! - 2: next class
//! - 3: (previous, current) pair
//! - 4: (current, next) pair

use crate::charclass::{
    CC_ALPHA, CC_BOS, CC_DIGIT, CC_EOS, CC_FULLWIDTH, CC_HIRAGANA, CC_KANJI, CC_KATAKANA,
    CC_OTHER, CC_SPACE, CC_SYMBOL,
};
use crate::score::q88_from_f64;

/// Pack an emission feature key.
#[inline]
pub fn feat_key(template_id: u8, label: u8, v1: u8, v2: u8) -> u32 {
    (u32::from(template_id) << 24) | (u32::from(label) << 16) | (u32::from(v1) << 8) | u32::from(v2)
}

/// CRF weight tables (all Q8.8).
#[derive(Debug, Clone, Default)]
pub struct CrfParams {
    /// internal -> internal
    pub trans00: i16,
    /// internal -> start
    pub trans01: i16,
    /// start -> internal
    pub trans10: i16,
    /// start -> start
    pub trans11: i16,
    /// BOS -> first label (always 1)
    pub bos_to1: i16,
    /// Emission keys, sorted ascending.
    pub feat_key: Vec<u32>,
    /// Emission weights, parallel to `feat_key`.
    pub feat_w: Vec<i16>,
}

impl CrfParams {
    /// Weight for `key`; zero when absent.
    #[inline]
    pub fn lookup_weight(&self, key: u32) -> i16 {
        match self.feat_key.binary_search(&key) {
            Ok(i) => self.feat_w[i],
            Err(_) => 0,
        }
    }

    /// Table index of `key` (trainer-side: gradients accumulate per index).
    #[inline]
    pub fn find_index(&self, key: u32) -> Option<usize> {
        self.feat_key.binary_search(&key).ok()
    }

    /// Emission score at one position: the sum of the five template
    /// weights, clamped to the i16 range.
    pub fn emit_pos(&self, label: u8, prev_c: u8, cur_c: u8, next_c: u8) -> i16 {
        let mut sum = 0i32;
        sum += i32::from(self.lookup_weight(feat_key(0, label, cur_c, 0)));
        sum += i32::from(self.lookup_weight(feat_key(1, label, prev_c, 0)));
        sum += i32::from(self.lookup_weight(feat_key(2, label, next_c, 0)));
        sum += i32::from(self.lookup_weight(feat_key(3, label, prev_c, cur_c)));
        sum += i32::from(self.lookup_weight(feat_key(4, label, cur_c, next_c)));
        sum.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
    }

    /// The full feature-key space over the concrete classes plus BOS/EOS
    /// sentinels, with a small set of non-zero starting weights and the
    /// default transitions. Everything else starts at zero and is meant to
    /// be learned (supervised/pseudo-label training) or overridden from a
    /// config file.
    pub fn basic_preset() -> Self {
        const CUR: [u8; 9] = [
            CC_OTHER, CC_SPACE, CC_DIGIT, CC_ALPHA, CC_HIRAGANA, CC_KATAKANA, CC_KANJI,
            CC_FULLWIDTH, CC_SYMBOL,
        ];
        const PREV: [u8; 10] = [
            CC_BOS, CC_OTHER, CC_SPACE, CC_DIGIT, CC_ALPHA, CC_HIRAGANA, CC_KATAKANA, CC_KANJI,
            CC_FULLWIDTH, CC_SYMBOL,
        ];
        const NEXT: [u8; 10] = [
            CC_OTHER, CC_SPACE, CC_DIGIT, CC_ALPHA, CC_HIRAGANA, CC_KATAKANA, CC_KANJI,
            CC_FULLWIDTH, CC_SYMBOL, CC_EOS,
        ];

        let mut keys = Vec::new();
        for label in 0..=1u8 {
            for &c in &CUR {
                keys.push(feat_key(0, label, c, 0));
            }
            for &p in &PREV {
                keys.push(feat_key(1, label, p, 0));
            }
            for &n in &NEXT {
                keys.push(feat_key(2, label, n, 0));
            }
            for &p in &PREV {
                for &c in &CUR {
                    keys.push(feat_key(3, label, p, c));
                }
            }
            for &c in &CUR {
                for &n in &NEXT {
                    keys.push(feat_key(4, label, c, n));
                }
            }
        }
        keys.sort_unstable();

        let mut weights = vec![0i16; keys.len()];
        let init: [(u8, u8, u8, u8, f64); 15] = [
            // previous class -> start
            (1, 1, CC_BOS, 0, 2.0),
            (1, 1, CC_SPACE, 0, 1.5),
            (1, 1, CC_SYMBOL, 0, 1.2),
            (1, 1, CC_FULLWIDTH, 0, 1.2),
            // current class -> start
            (0, 1, CC_SPACE, 0, 1.5),
            (0, 1, CC_SYMBOL, 0, 1.5),
            (0, 1, CC_FULLWIDTH, 0, 1.5),
            // current class -> internal
            (0, 0, CC_SPACE, 0, -2.0),
            (0, 0, CC_SYMBOL, 0, -2.0),
            (0, 0, CC_FULLWIDTH, 0, -2.0),
            (0, 0, CC_KANJI, 0, 0.4),
            (0, 0, CC_KATAKANA, 0, 0.4),
            (0, 0, CC_ALPHA, 0, 0.2),
            (0, 0, CC_DIGIT, 0, 0.2),
            (0, 0, CC_HIRAGANA, 0, 0.1),
        ];
        for &(tid, label, v1, v2, w) in &init {
            let key = feat_key(tid, label, v1, v2);
            if let Ok(i) = keys.binary_search(&key) {
                weights[i] = q88_from_f64(w);
            }
        }

        Self {
            trans00: q88_from_f64(0.2),
            trans01: q88_from_f64(-0.4),
            trans10: q88_from_f64(0.0),
            trans11: q88_from_f64(-0.6),
            bos_to1: q88_from_f64(0.5),
            feat_key: keys,
            feat_w: weights,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_packing() {
        assert_eq!(feat_key(0, 0, 0, 0), 0);
        assert_eq!(feat_key(3, 1, CC_KANJI, CC_HIRAGANA), 0x0301_0604);
        assert_eq!(feat_key(4, 1, 0xAB, 0xCD), 0x0401_ABCD);
    }

    #[test]
    fn preset_is_sorted_and_unique() {
        let crf = CrfParams::basic_preset();
        assert!(!crf.feat_key.is_empty());
        assert!(crf.feat_key.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(crf.feat_key.len(), crf.feat_w.len());
        // 2 labels * (9 + 10 + 10 + 10*9 + 9*10) = 2 * 209
        assert_eq!(crf.feat_key.len(), 418);
    }

    #[test]
    fn lookup_missing_is_zero() {
        let crf = CrfParams::basic_preset();
        assert_eq!(crf.lookup_weight(feat_key(0, 1, 200, 0)), 0);
        // a seeded weight
        assert_eq!(
            crf.lookup_weight(feat_key(1, 1, CC_BOS, 0)),
            q88_from_f64(2.0)
        );
    }

    #[test]
    fn emit_sums_templates() {
        let mut crf = CrfParams::default();
        crf.feat_key = vec![
            feat_key(0, 1, CC_KANJI, 0),
            feat_key(1, 1, CC_BOS, 0),
            feat_key(3, 1, CC_BOS, CC_KANJI),
        ];
        crf.feat_w = vec![256, 128, 64];
        // keys must be sorted for binary search
        let mut kv: Vec<(u32, i16)> = crf
            .feat_key
            .iter()
            .copied()
            .zip(crf.feat_w.iter().copied())
            .collect();
        kv.sort_by_key(|e| e.0);
        crf.feat_key = kv.iter().map(|e| e.0).collect();
        crf.feat_w = kv.iter().map(|e| e.1).collect();

        let e = crf.emit_pos(1, CC_BOS, CC_KANJI, CC_EOS);
        assert_eq!(e, 256 + 128 + 64);
        // different label hits nothing
        assert_eq!(crf.emit_pos(0, CC_BOS, CC_KANJI, CC_EOS), 0);
    }
}
