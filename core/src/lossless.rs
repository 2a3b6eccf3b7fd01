//! Lossless whitespace codec.
//!
//! Tokenizing on ASCII space destroys the original whitespace; this codec
//! substitutes whitespace with private meta-codepoints before tokenization
//! so that concatenating the emitted tokens and decoding reproduces the
//! input byte-for-byte:
//!
//! space ↔ U+2581, tab ↔ U+2582, LF ↔ U+2583, CR ↔ U+2584, and U+2580
//! escapes any meta-codepoint that appears literally in the input.

use crate::utf8;

pub const META_ESCAPE: u32 = 0x2580;
pub const META_SPACE: u32 = 0x2581;
pub const META_TAB: u32 = 0x2582;
pub const META_LF: u32 = 0x2583;
pub const META_CR: u32 = 0x2584;

/// True for any of the five meta-codepoints.
#[inline]
pub fn is_meta(cp: u32) -> bool {
    (META_ESCAPE..=META_CR).contains(&cp)
}

fn push_cp(out: &mut Vec<u8>, cp: u32) {
    let mut buf = [0u8; 4];
    let n = utf8::encode_cp(cp, &mut buf);
    out.extend_from_slice(&buf[..n]);
}

/// Substitute whitespace with meta-codepoints. When `include_newlines` is
/// false, LF and CR pass through untouched (per-line drivers keep line
/// structure themselves). Invalid UTF-8 bytes are copied verbatim.
pub fn encode(src: &[u8], include_newlines: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + src.len() / 4);
    let mut pos = 0;
    while pos < src.len() {
        let Some((cp, adv)) = utf8::decode_cp(src, pos) else {
            out.push(src[pos]);
            pos += 1;
            continue;
        };
        match cp {
            0x20 => push_cp(&mut out, META_SPACE),
            0x09 => push_cp(&mut out, META_TAB),
            0x0A if include_newlines => push_cp(&mut out, META_LF),
            0x0D if include_newlines => push_cp(&mut out, META_CR),
            _ if is_meta(cp) => {
                push_cp(&mut out, META_ESCAPE);
                push_cp(&mut out, cp);
            }
            _ => out.extend_from_slice(&src[pos..pos + adv]),
        }
        pos += adv;
    }
    out
}

/// Inverse of [`encode`]. Unknown content and invalid UTF-8 pass through;
/// a dangling escape at end of input is emitted literally.
pub fn decode(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut pos = 0;
    while pos < src.len() {
        let Some((cp, adv)) = utf8::decode_cp(src, pos) else {
            out.push(src[pos]);
            pos += 1;
            continue;
        };
        pos += adv;
        match cp {
            META_SPACE => out.push(b' '),
            META_TAB => out.push(b'\t'),
            META_LF => out.push(b'\n'),
            META_CR => out.push(b'\r'),
            META_ESCAPE => {
                if let Some((next_cp, next_adv)) = utf8::decode_cp(src, pos) {
                    push_cp(&mut out, next_cp);
                    pos += next_adv;
                } else {
                    push_cp(&mut out, META_ESCAPE);
                }
            }
            _ => push_cp(&mut out, cp),
        }
    }
    out
}

/// Concatenate a token stream (dropping nothing) and decode the result.
/// The ASCII-space separators a tokenizer printed between tokens must not
/// be included in `tokens`.
pub fn detokenize<'a, I>(tokens: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut joined = Vec::new();
    for t in tokens {
        joined.extend_from_slice(t);
    }
    decode(&joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(s: &[u8], include_newlines: bool) {
        let enc = encode(s, include_newlines);
        assert_eq!(decode(&enc), s, "round trip failed for {s:?}");
    }

    #[test]
    fn whitespace_round_trips() {
        round_trip(b"hello world", true);
        round_trip(b" \t leading and trailing \t ", true);
        round_trip(b"line1\nline2\r\n", true);
        round_trip("日本語 と スペース".as_bytes(), true);
        round_trip(b"", true);
    }

    #[test]
    fn literal_meta_codepoints_are_escaped() {
        // ▁ (U+2581) literally in the input must survive
        let s = "a▁b▀c▄d".as_bytes();
        round_trip(s, true);
        let enc = encode(s, true);
        // the encoded form must not contain a bare meta that decodes wrong
        assert_ne!(enc, s);
    }

    #[test]
    fn newlines_pass_through_when_disabled() {
        let s = b"a\nb";
        let enc = encode(s, false);
        assert!(enc.contains(&b'\n'));
        assert_eq!(decode(&enc), s);
    }

    #[test]
    fn spaces_become_single_codepoints() {
        let enc = encode(b"a b", true);
        // 'a' + U+2581 (3 bytes) + 'b'
        assert_eq!(enc.len(), 5);
        assert_eq!(&enc[1..4], "▁".as_bytes());
    }

    #[test]
    fn detokenize_joins_then_decodes() {
        let src = b"foo bar\tbaz";
        let enc = encode(src, true);
        // split the encoded stream into arbitrary token slices
        let (a, rest) = enc.split_at(4);
        let (b, c) = rest.split_at(3);
        assert_eq!(detokenize([a, b, c]), src);
    }

    #[test]
    fn invalid_utf8_passes_through() {
        let s = b"ok\xFF\xFEok ";
        round_trip(s, true);
    }

    #[test]
    fn dangling_escape_is_literal() {
        let mut enc = Vec::new();
        push_cp(&mut enc, META_ESCAPE);
        assert_eq!(decode(&enc), "▀".as_bytes());
    }
}
