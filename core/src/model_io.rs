//! Versioned binary model serialization.
//!
//! All multi-byte integers are little-endian. Two magics are understood:
//! `MMJPv1\0\0` (legacy, no flags / character-class section) and
//! `MMJPv2\0\0` (current). Layout after the 8-byte magic:
//!
//! ```text
//! u32 version             (1 or 2, must match the magic)
//! u32 da_index_bytes      (must be 4)
//! u32 da_capacity
//! u32 vocab_size
//! u32 max_word_len
//! i16 unk_base, unk_per_cp, lambda0
//! i16 trans00, trans01, trans10, trans11, bos_to1
//! u32 feat_count
//! u32 bigram_size
//! -- v2 only --
//! u32 flags
//! u8  cc_mode, cc_fallback, pad[2]
//! u32 cc_range_count
//! -- arrays --
//! i32 base[da_capacity]; i32 check[da_capacity]
//! i16 logp_uni[vocab_size]
//! u32 bigram_key[bigram_size]; i16 logp_bi[bigram_size]
//! u32 feat_key[feat_count];   i16 feat_w[feat_count]
//! -- v2 only --
//! { u32 lo; u32 hi; u8 class_id; u8 pad[3] } x cc_range_count
//! ```
//!
//! A v1 file loads with `flags = 0` and the COMPAT character classes.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::charclass::{CcConfig, CcMode, CcRange};
use crate::crf::CrfParams;
use crate::model::{LmParams, Model};
use crate::trie::{DaIndex, DoubleArray, ROOT};
use crate::{Error, Result};

pub const MAGIC_V1: &[u8; 8] = b"MMJPv1\0\0";
pub const MAGIC_V2: &[u8; 8] = b"MMJPv2\0\0";
pub const VERSION_V1: u32 = 1;
pub const VERSION_V2: u32 = 2;
const DA_INDEX_BYTES: u32 = 4;

fn wr_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn wr_i16<W: Write>(w: &mut W, v: i16) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn rd_u32<R: Read>(r: &mut R, field: &str) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)
        .map_err(|_| Error::ModelInvalid(format!("truncated reading {field}")))?;
    Ok(u32::from_le_bytes(b))
}

fn rd_i16<R: Read>(r: &mut R, field: &str) -> Result<i16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)
        .map_err(|_| Error::ModelInvalid(format!("truncated reading {field}")))?;
    Ok(i16::from_le_bytes(b))
}

/// Serialize `m` in the current (v2) format.
pub fn save_to<W: Write>(w: &mut W, m: &Model) -> Result<()> {
    let da_cap = m.lm.trie.capacity();
    if da_cap < 2 {
        return Err(Error::BadArgument("model trie is empty"));
    }
    if m.lm.logp_uni.is_empty() {
        return Err(Error::BadArgument("model vocabulary is empty"));
    }
    if m.lm.bigram_key.len() != m.lm.logp_bi.len() {
        return Err(Error::BadArgument("bigram arrays length mismatch"));
    }
    if m.crf.feat_key.len() != m.crf.feat_w.len() {
        return Err(Error::BadArgument("feature arrays length mismatch"));
    }

    w.write_all(MAGIC_V2)?;
    wr_u32(w, VERSION_V2)?;
    wr_u32(w, DA_INDEX_BYTES)?;
    wr_u32(w, da_cap as u32)?;
    wr_u32(w, m.lm.logp_uni.len() as u32)?;
    wr_u32(w, u32::from(m.max_word_len))?;

    wr_i16(w, m.lm.unk_base)?;
    wr_i16(w, m.lm.unk_per_cp)?;
    wr_i16(w, m.lambda0)?;

    wr_i16(w, m.crf.trans00)?;
    wr_i16(w, m.crf.trans01)?;
    wr_i16(w, m.crf.trans10)?;
    wr_i16(w, m.crf.trans11)?;
    wr_i16(w, m.crf.bos_to1)?;

    wr_u32(w, m.crf.feat_key.len() as u32)?;
    wr_u32(w, m.lm.bigram_key.len() as u32)?;

    wr_u32(w, m.flags)?;
    w.write_all(&[m.cc.mode as u8, m.cc.fallback as u8, 0, 0])?;
    wr_u32(w, m.cc.ranges.len() as u32)?;

    use crate::trie::DaRead;
    for &v in m.lm.trie.base() {
        wr_u32(w, v as u32)?;
    }
    for &v in m.lm.trie.check() {
        wr_u32(w, v as u32)?;
    }
    for &v in &m.lm.logp_uni {
        wr_i16(w, v)?;
    }
    for &k in &m.lm.bigram_key {
        wr_u32(w, k)?;
    }
    for &v in &m.lm.logp_bi {
        wr_i16(w, v)?;
    }
    for &k in &m.crf.feat_key {
        wr_u32(w, k)?;
    }
    for &v in &m.crf.feat_w {
        wr_i16(w, v)?;
    }
    for r in &m.cc.ranges {
        wr_u32(w, r.lo)?;
        wr_u32(w, r.hi)?;
        w.write_all(&[r.class_id, 0, 0, 0])?;
    }
    Ok(())
}

pub fn save<P: AsRef<Path>>(path: P, m: &Model) -> Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);
    save_to(&mut w, m)?;
    w.flush()?;
    Ok(())
}

/// Load a v1 or v2 model, validating every field.
pub fn load_from<R: Read>(r: &mut R) -> Result<Model> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)
        .map_err(|_| Error::ModelInvalid("truncated magic".into()))?;
    let is_v1 = if magic == *MAGIC_V2 {
        false
    } else if magic == *MAGIC_V1 {
        true
    } else {
        return Err(Error::ModelInvalid("bad magic".into()));
    };

    let version = rd_u32(r, "version")?;
    let expect = if is_v1 { VERSION_V1 } else { VERSION_V2 };
    if version != expect {
        return Err(Error::ModelInvalid(format!(
            "version {version} does not match magic (expected {expect})"
        )));
    }
    let da_index_bytes = rd_u32(r, "da_index_bytes")?;
    if da_index_bytes != DA_INDEX_BYTES {
        return Err(Error::ModelInvalid(format!(
            "unsupported da_index_bytes {da_index_bytes}"
        )));
    }
    let da_cap = rd_u32(r, "da_capacity")? as usize;
    let vocab = rd_u32(r, "vocab_size")? as usize;
    let max_word_len = rd_u32(r, "max_word_len")?;
    if da_cap < 2 {
        return Err(Error::ModelInvalid("da_capacity below 2".into()));
    }
    if vocab == 0 {
        return Err(Error::ModelInvalid("empty vocabulary".into()));
    }
    if max_word_len == 0 || max_word_len > 255 {
        return Err(Error::ModelInvalid(format!(
            "max_word_len {max_word_len} out of range (1..=255)"
        )));
    }

    let unk_base = rd_i16(r, "unk_base")?;
    let unk_per_cp = rd_i16(r, "unk_per_cp")?;
    let lambda0 = rd_i16(r, "lambda0")?;
    let trans00 = rd_i16(r, "trans00")?;
    let trans01 = rd_i16(r, "trans01")?;
    let trans10 = rd_i16(r, "trans10")?;
    let trans11 = rd_i16(r, "trans11")?;
    let bos_to1 = rd_i16(r, "bos_to1")?;
    let feat_count = rd_u32(r, "feat_count")? as usize;
    let bigram_size = rd_u32(r, "bigram_size")? as usize;

    let (flags, cc_mode, cc_fallback, cc_range_count) = if is_v1 {
        (0u32, CcMode::Compat, CcMode::Utf8Len, 0usize)
    } else {
        let flags = rd_u32(r, "flags")?;
        let mut b4 = [0u8; 4];
        r.read_exact(&mut b4)
            .map_err(|_| Error::ModelInvalid("truncated cc_mode".into()))?;
        let mode = CcMode::from_u8(b4[0])
            .ok_or_else(|| Error::ModelInvalid(format!("unknown cc_mode {}", b4[0])))?;
        let fallback = CcMode::from_u8(b4[1])
            .ok_or_else(|| Error::ModelInvalid(format!("unknown cc_fallback {}", b4[1])))?;
        let count = rd_u32(r, "cc_range_count")? as usize;
        (flags, mode, fallback, count)
    };

    let mut base = Vec::with_capacity(da_cap);
    for _ in 0..da_cap {
        base.push(rd_u32(r, "trie base")? as i32 as DaIndex);
    }
    let mut check = Vec::with_capacity(da_cap);
    for _ in 0..da_cap {
        check.push(rd_u32(r, "trie check")? as i32 as DaIndex);
    }
    if base[ROOT as usize] != 1 || check[ROOT as usize] != ROOT {
        return Err(Error::ModelInvalid("trie root marker missing".into()));
    }

    let mut logp_uni = Vec::with_capacity(vocab);
    for _ in 0..vocab {
        logp_uni.push(rd_i16(r, "logp_uni")?);
    }

    let mut bigram_key = Vec::with_capacity(bigram_size);
    for _ in 0..bigram_size {
        bigram_key.push(rd_u32(r, "bigram_key")?);
    }
    if bigram_key.windows(2).any(|w| w[0] >= w[1]) {
        return Err(Error::ModelInvalid("bigram keys not strictly sorted".into()));
    }
    let mut logp_bi = Vec::with_capacity(bigram_size);
    for _ in 0..bigram_size {
        logp_bi.push(rd_i16(r, "logp_bi")?);
    }

    let mut feat_key = Vec::with_capacity(feat_count);
    for _ in 0..feat_count {
        feat_key.push(rd_u32(r, "feat_key")?);
    }
    if feat_key.windows(2).any(|w| w[0] >= w[1]) {
        return Err(Error::ModelInvalid("feature keys not strictly sorted".into()));
    }
    let mut feat_w = Vec::with_capacity(feat_count);
    for _ in 0..feat_count {
        feat_w.push(rd_i16(r, "feat_w")?);
    }

    let mut ranges = Vec::with_capacity(cc_range_count);
    for _ in 0..cc_range_count {
        let lo = rd_u32(r, "cc_range lo")?;
        let hi = rd_u32(r, "cc_range hi")?;
        let mut b4 = [0u8; 4];
        r.read_exact(&mut b4)
            .map_err(|_| Error::ModelInvalid("truncated cc_range class".into()))?;
        if lo > hi || hi > 0x10FFFF {
            return Err(Error::ModelInvalid(format!(
                "cc_range [{lo:#x}, {hi:#x}] invalid"
            )));
        }
        ranges.push(CcRange {
            lo,
            hi,
            class_id: b4[0],
        });
    }
    if ranges.windows(2).any(|w| w[1].lo <= w[0].hi) {
        return Err(Error::ModelInvalid("cc_ranges overlap or unsorted".into()));
    }

    Ok(Model {
        crf: CrfParams {
            trans00,
            trans01,
            trans10,
            trans11,
            bos_to1,
            feat_key,
            feat_w,
        },
        lm: LmParams {
            trie: DoubleArray::from_parts(base, check)?,
            logp_uni,
            bigram_key,
            logp_bi,
            unk_base,
            unk_per_cp,
        },
        lambda0,
        max_word_len: max_word_len as u16,
        flags,
        cc: CcConfig {
            mode: cc_mode,
            fallback: cc_fallback,
            ranges,
        },
    })
}

pub fn load<P: AsRef<Path>>(path: P) -> Result<Model> {
    let file = File::open(path)?;
    let mut r = BufReader::new(file);
    load_from(&mut r)
}
