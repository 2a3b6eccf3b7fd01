//! Character-class resolver.
//!
//! Class ids feed directly into CRF feature keys, so the training tools
//! and the decoder must agree on them exactly. The resolver is a tagged
//! enum with a `classify` method rather than a function pointer so the hot
//! path inlines.

use std::fmt;
use std::path::Path;

use crate::{lossless, Error, Result};

pub const CC_OTHER: u8 = 0;
pub const CC_SPACE: u8 = 1;
pub const CC_DIGIT: u8 = 2;
pub const CC_ALPHA: u8 = 3;
pub const CC_HIRAGANA: u8 = 4;
pub const CC_KATAKANA: u8 = 5;
pub const CC_KANJI: u8 = 6;
pub const CC_FULLWIDTH: u8 = 7;
pub const CC_SYMBOL: u8 = 8;
/// Non-ASCII bucketed by encoded length (UTF8LEN mode).
pub const CC_UTF8_2BYTE: u8 = 9;
pub const CC_UTF8_3BYTE: u8 = 10;
pub const CC_UTF8_4BYTE: u8 = 11;
/// Sentinel classes for the virtual sentence edges.
pub const CC_BOS: u8 = 250;
pub const CC_EOS: u8 = 251;

/// Classification mode for non-ASCII codepoints. ASCII is always
/// classified the same way regardless of mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CcMode {
    /// Non-ASCII maps to `OTHER`.
    Ascii = 0,
    /// Bucket non-ASCII by encoded byte length (classes 9/10/11).
    Utf8Len = 1,
    /// Binary-search a user-supplied sorted disjoint range table.
    Ranges = 2,
    /// Built-in Japanese ranges (hiragana/katakana/kanji/fullwidth).
    Compat = 3,
}

impl CcMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Ascii),
            1 => Some(Self::Utf8Len),
            2 => Some(Self::Ranges),
            3 => Some(Self::Compat),
            _ => None,
        }
    }
}

impl fmt::Display for CcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ascii => "ascii",
            Self::Utf8Len => "utf8len",
            Self::Ranges => "ranges",
            Self::Compat => "compat",
        };
        f.write_str(s)
    }
}

/// One `[lo, hi]` (inclusive) codepoint range mapped to a class id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcRange {
    pub lo: u32,
    pub hi: u32,
    pub class_id: u8,
}

/// Resolver configuration carried inside the model.
#[derive(Debug, Clone)]
pub struct CcConfig {
    pub mode: CcMode,
    /// Fallback for RANGES mode when no range matches: `Utf8Len` or
    /// `Ascii` (anything else behaves as `OTHER`).
    pub fallback: CcMode,
    /// Sorted ascending by `lo`, disjoint. Empty unless mode is RANGES.
    pub ranges: Vec<CcRange>,
}

impl Default for CcConfig {
    fn default() -> Self {
        Self {
            mode: CcMode::Compat,
            fallback: CcMode::Utf8Len,
            ranges: Vec::new(),
        }
    }
}

#[inline]
fn ascii_class(cp: u32) -> u8 {
    match cp {
        0x20 | 0x09 | 0x0A | 0x0D => CC_SPACE,
        0x30..=0x39 => CC_DIGIT,
        0x41..=0x5A | 0x61..=0x7A => CC_ALPHA,
        _ => CC_SYMBOL,
    }
}

#[inline]
fn utf8len_class(cp: u32) -> u8 {
    if cp <= 0x7F {
        ascii_class(cp)
    } else if cp <= 0x7FF {
        CC_UTF8_2BYTE
    } else if cp <= 0xFFFF {
        CC_UTF8_3BYTE
    } else {
        CC_UTF8_4BYTE
    }
}

#[inline]
fn compat_class(cp: u32) -> u8 {
    match cp {
        0x3040..=0x309F => CC_HIRAGANA,
        0x30A0..=0x30FF => CC_KATAKANA,
        0x4E00..=0x9FFF => CC_KANJI,
        0xFF00..=0xFFEF => CC_FULLWIDTH,
        _ => CC_OTHER,
    }
}

fn ranges_class(ranges: &[CcRange], cp: u32) -> u8 {
    // Small tables are cheaper to scan linearly.
    if ranges.len() <= 8 {
        for r in ranges {
            if cp >= r.lo && cp <= r.hi {
                return r.class_id;
            }
        }
        return CC_OTHER;
    }
    let mut lo = 0usize;
    let mut hi = ranges.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let r = &ranges[mid];
        if cp < r.lo {
            hi = mid;
        } else if cp > r.hi {
            lo = mid + 1;
        } else {
            return r.class_id;
        }
    }
    CC_OTHER
}

impl CcConfig {
    /// Map a codepoint to its class id.
    #[inline]
    pub fn classify(&self, cp: u32) -> u8 {
        // Lossless meta-codepoints stand for whitespace wherever they occur.
        if lossless::is_meta(cp) {
            return CC_SPACE;
        }
        if cp <= 0x7F {
            return ascii_class(cp);
        }
        match self.mode {
            CcMode::Ascii => CC_OTHER,
            CcMode::Utf8Len => utf8len_class(cp),
            CcMode::Compat => compat_class(cp),
            CcMode::Ranges => {
                let cls = ranges_class(&self.ranges, cp);
                if cls != CC_OTHER {
                    cls
                } else if self.fallback == CcMode::Utf8Len {
                    utf8len_class(cp)
                } else {
                    CC_OTHER
                }
            }
        }
    }

    /// Load a range table from a `lo hi class_id` file (see `parse_ranges`).
    pub fn load_ranges<P: AsRef<Path>>(path: P) -> Result<Vec<CcRange>> {
        let text = std::fs::read_to_string(path)?;
        parse_ranges(&text)
    }
}

/// Parse a cc_ranges table: one `lo hi class_id` triple per line, decimal
/// or `0x`-prefixed hex, `#` comments, blank lines ignored. Ranges are
/// sorted ascending by `lo` and must be disjoint; `class_id` in [0, 255].
pub fn parse_ranges(text: &str) -> Result<Vec<CcRange>> {
    fn parse_u32(tok: &str, line_no: usize, what: &str) -> Result<u32> {
        let parsed = if let Some(hex) = tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16)
        } else {
            tok.parse::<u32>()
        };
        parsed.map_err(|_| Error::Parse(format!("cc_ranges line {line_no}: invalid {what} '{tok}'")))
    }

    let mut ranges = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut it = line.split_whitespace();
        let (lo_tok, hi_tok, cid_tok) = match (it.next(), it.next(), it.next()) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => {
                return Err(Error::Parse(format!(
                    "cc_ranges line {line_no}: expected 'lo hi class_id'"
                )))
            }
        };
        let lo = parse_u32(lo_tok, line_no, "start")?;
        let hi = parse_u32(hi_tok, line_no, "end")?;
        let cid = parse_u32(cid_tok, line_no, "class_id")?;
        if lo > hi {
            return Err(Error::Parse(format!(
                "cc_ranges line {line_no}: start {lo:#x} > end {hi:#x}"
            )));
        }
        if hi > 0x10FFFF {
            return Err(Error::Parse(format!(
                "cc_ranges line {line_no}: value out of Unicode range"
            )));
        }
        if cid > 255 {
            return Err(Error::Parse(format!(
                "cc_ranges line {line_no}: class_id must be 0-255"
            )));
        }
        ranges.push(CcRange {
            lo,
            hi,
            class_id: cid as u8,
        });
    }

    ranges.sort_by_key(|r| r.lo);
    for w in ranges.windows(2) {
        if w[1].lo <= w[0].hi {
            return Err(Error::Parse(format!(
                "cc_ranges overlap: [{:#x}-{:#x}] and [{:#x}-{:#x}]",
                w[0].lo, w[0].hi, w[1].lo, w[1].hi
            )));
        }
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_is_mode_independent() {
        for mode in [CcMode::Ascii, CcMode::Utf8Len, CcMode::Ranges, CcMode::Compat] {
            let cc = CcConfig {
                mode,
                ..CcConfig::default()
            };
            assert_eq!(cc.classify(u32::from(b' ')), CC_SPACE);
            assert_eq!(cc.classify(u32::from(b'\t')), CC_SPACE);
            assert_eq!(cc.classify(u32::from(b'7')), CC_DIGIT);
            assert_eq!(cc.classify(u32::from(b'Q')), CC_ALPHA);
            assert_eq!(cc.classify(u32::from(b'!')), CC_SYMBOL);
        }
    }

    #[test]
    fn compat_japanese_ranges() {
        let cc = CcConfig::default();
        assert_eq!(cc.classify(0x3042), CC_HIRAGANA); // あ
        assert_eq!(cc.classify(0x30A2), CC_KATAKANA); // ア
        assert_eq!(cc.classify(0x6F22), CC_KANJI); // 漢
        assert_eq!(cc.classify(0xFF01), CC_FULLWIDTH); // ！
        assert_eq!(cc.classify(0x0416), CC_OTHER); // Ж
    }

    #[test]
    fn utf8len_buckets() {
        let cc = CcConfig {
            mode: CcMode::Utf8Len,
            ..CcConfig::default()
        };
        assert_eq!(cc.classify(0xA2), CC_UTF8_2BYTE);
        assert_eq!(cc.classify(0x3042), CC_UTF8_3BYTE);
        assert_eq!(cc.classify(0x1F600), CC_UTF8_4BYTE);
    }

    #[test]
    fn lossless_meta_is_space() {
        for cp in 0x2580..=0x2584 {
            let cc = CcConfig::default();
            assert_eq!(cc.classify(cp), CC_SPACE);
        }
    }

    #[test]
    fn ranges_with_fallback() {
        let cc = CcConfig {
            mode: CcMode::Ranges,
            fallback: CcMode::Utf8Len,
            ranges: vec![
                CcRange { lo: 0x0400, hi: 0x04FF, class_id: 12 },
                CcRange { lo: 0x0530, hi: 0x058F, class_id: 13 },
            ],
        };
        assert_eq!(cc.classify(0x0416), 12);
        assert_eq!(cc.classify(0x0561), 13);
        // unmatched falls through to utf8len
        assert_eq!(cc.classify(0x3042), CC_UTF8_3BYTE);
    }

    #[test]
    fn parse_ranges_formats() {
        let text = "# Cyrillic\n0x400 0x4FF 12\n\n1328 0x58F 13\n";
        let r = parse_ranges(text).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r[0], CcRange { lo: 0x400, hi: 0x4FF, class_id: 12 });
        assert_eq!(r[1], CcRange { lo: 0x530, hi: 0x58F, class_id: 13 });
    }

    #[test]
    fn parse_ranges_rejects_overlap_and_garbage() {
        assert!(parse_ranges("10 20 1\n15 30 2\n").is_err());
        assert!(parse_ranges("20 10 1\n").is_err());
        assert!(parse_ranges("1 2\n").is_err());
        assert!(parse_ranges("0x110000 0x110001 1\n").is_err());
        assert!(parse_ranges("1 2 300\n").is_err());
    }
}
