//! Semi-Markov lattice decoding: Viterbi, forward-filter backward-sample
//! (FFBS), and N-best, over combined CRF + dictionary-LM scores in Q8.8
//! fixed point.
//!
//! The DP state is `(position, last_word_length)`. Viterbi keeps only the
//! last `L+1` positions of scores in a ring buffer (`O(L)` memory in the
//! word length); the back-pointer table is the only full-length storage.
//! FFBS and N-best trade that frugality for their extra tables, which the
//! workspace grows on demand.

use crate::charclass::{CC_BOS, CC_EOS};
use crate::model::{Model, ID_BOS, ID_NONE};
use crate::score::{q88_mul, q88_to_f64, Score, NEG_INF};
use crate::trie::{DaRead, ROOT};
use crate::{utf8, Error, Result};

/// Hard cap on N-best candidates per call.
pub const NBEST_MAX: usize = 64;

/// Reusable decode buffers for sentences of up to `max_n_cp` codepoints
/// and words of up to `max_word_len` codepoints.
pub struct Workspace {
    max_n_cp: usize,
    max_word_len: usize,
    cp_off: Vec<u32>,
    emit0: Vec<i16>,
    emit1: Vec<i16>,
    pref_emit0: Vec<i32>,
    span_id: Vec<u16>,
    span_luni: Vec<i16>,
    bp_prevlen: Vec<u8>,
    dp_ring: Vec<Score>,
    // FFBS / N-best tables, grown on first use.
    alpha: Vec<f64>,
    nb_dp: Vec<Score>,
    nb_len: Vec<u8>,
    nb_rank: Vec<u8>,
}

impl Workspace {
    /// `max_word_len` is bounded by 255 (back-pointers are bytes).
    pub fn new(max_n_cp: usize, max_word_len: usize) -> Result<Self> {
        if max_n_cp == 0 || max_word_len == 0 || max_word_len > 255 {
            return Err(Error::BadArgument("workspace dimensions"));
        }
        let ncp1 = max_n_cp + 1;
        let l1 = max_word_len + 1;
        let span_n = ncp1 * l1;
        Ok(Self {
            max_n_cp,
            max_word_len,
            cp_off: vec![0; ncp1],
            emit0: vec![0; max_n_cp],
            emit1: vec![0; max_n_cp],
            pref_emit0: vec![0; ncp1],
            span_id: vec![ID_NONE; span_n],
            span_luni: vec![0; span_n],
            bp_prevlen: vec![0; span_n],
            dp_ring: vec![NEG_INF; l1 * l1],
            alpha: Vec::new(),
            nb_dp: Vec::new(),
            nb_len: Vec::new(),
            nb_rank: Vec::new(),
        })
    }

    pub fn max_n_cp(&self) -> usize {
        self.max_n_cp
    }

    pub fn max_word_len(&self) -> usize {
        self.max_word_len
    }

    /// Codepoint offsets of the last decoded sentence (valid through
    /// index `n_cp`); the bridge from boundary indices to byte indices.
    pub fn cp_offsets(&self) -> &[u32] {
        &self.cp_off
    }
}

/// Exact byte footprint of the core decode tables for given limits, for
/// sizing on constrained targets.
pub fn workbuf_bytes(max_n_cp: usize, max_word_len: usize) -> usize {
    let ncp1 = max_n_cp + 1;
    let l1 = max_word_len + 1;
    let span_n = ncp1 * l1;
    ncp1 * 4                    // cp_off
        + max_n_cp * 2 * 2      // emit0 + emit1
        + ncp1 * 4              // pref_emit0
        + span_n * 2            // span_id
        + span_n * 2            // span_luni
        + span_n                // bp_prevlen
        + l1 * l1 * 4 // dp_ring
}

/// Additional bytes FFBS needs on top of [`workbuf_bytes`].
pub fn samplebuf_bytes(max_n_cp: usize, max_word_len: usize) -> usize {
    (max_n_cp + 1) * (max_word_len + 1) * std::mem::size_of::<f64>()
}

/// Additional bytes N-best needs on top of [`workbuf_bytes`].
pub fn nbestbuf_bytes(max_n_cp: usize, max_word_len: usize, nbest: usize) -> usize {
    let states = (max_n_cp + 1) * (max_word_len + 1);
    states * nbest * (4 + 1 + 1)
}

/// Convert codepoint boundaries to byte boundaries through the offset
/// table: `b_bytes[i] = cp_off[b_cp[i]]`.
pub fn boundaries_cp_to_bytes(cp_off: &[u32], b_cp: &[u32]) -> Vec<u32> {
    b_cp.iter().map(|&b| cp_off[b as usize]).collect()
}

#[inline]
fn span_index(end_pos: usize, len: usize, l: usize) -> usize {
    end_pos * (l + 1) + len
}

/// xorshift32; a zero seed is remapped to a fixed non-zero state.
struct XorShift32 {
    s: u32,
}

impl XorShift32 {
    fn new(seed: u32) -> Self {
        Self {
            s: if seed == 0 { 0x1234_5678 } else { seed },
        }
    }

    #[inline]
    fn next_u32(&mut self) -> u32 {
        let mut x = self.s;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.s = x;
        x
    }

    /// Uniform in [0, 1) from the top 24 bits.
    #[inline]
    fn next_f64(&mut self) -> f64 {
        f64::from(self.next_u32() >> 8) * (1.0 / 16_777_216.0)
    }
}

/// Build offsets, emissions, prefix sums and span tables for `input`.
/// Returns the codepoint count.
fn precompute(m: &Model, input: &[u8], wk: &mut Workspace) -> Result<usize> {
    let l = usize::from(m.max_word_len);
    if l == 0 {
        return Err(Error::BadArgument("model max_word_len is zero"));
    }
    if l > wk.max_word_len {
        return Err(Error::BadArgument("workspace max_word_len too small"));
    }

    let n_cp = utf8::make_offsets(input, &mut wk.cp_off)?;

    // Emission scores per position, with BOS/EOS sentinels at the edges.
    let mut classes_prev = CC_BOS;
    let mut cur_cp = if n_cp > 0 {
        let (cp, _) = utf8::decode_cp(input, wk.cp_off[0] as usize).ok_or(Error::Utf8)?;
        Some(cp)
    } else {
        None
    };
    for i in 0..n_cp {
        let cur = m.cc.classify(cur_cp.ok_or(Error::Utf8)?);
        let next_cp = if i + 1 < n_cp {
            let (cp, _) =
                utf8::decode_cp(input, wk.cp_off[i + 1] as usize).ok_or(Error::Utf8)?;
            Some(cp)
        } else {
            None
        };
        let next = match next_cp {
            Some(cp) => m.cc.classify(cp),
            None => CC_EOS,
        };
        wk.emit0[i] = m.crf.emit_pos(0, classes_prev, cur, next);
        wk.emit1[i] = m.crf.emit_pos(1, classes_prev, cur, next);
        classes_prev = cur;
        cur_cp = next_cp;
    }

    // Prefix sums: Σ emit0[s+1..t) = pref[t] - pref[s+1].
    wk.pref_emit0[0] = 0;
    for i in 0..n_cp {
        wk.pref_emit0[i + 1] = wk.pref_emit0[i] + i32::from(wk.emit0[i]);
    }

    // Span tables.
    let span_n = (n_cp + 1) * (l + 1);
    for slot in wk.span_id[..span_n].iter_mut() {
        *slot = ID_NONE;
    }
    for slot in wk.span_luni[..span_n].iter_mut() {
        *slot = 0;
    }
    for slot in wk.bp_prevlen[..span_n].iter_mut() {
        *slot = 0;
    }
    wk.span_id[span_index(0, 0, l)] = ID_BOS;

    // Known-word ids: walk the trie from every start position.
    let trie = &m.lm.trie;
    for start_cp in 0..n_cp {
        let max_l = l.min(n_cp - start_cp);
        let mut node = ROOT;
        for len in 1..=max_l {
            let cp_i = start_cp + len - 1;
            let b0 = wk.cp_off[cp_i] as usize;
            let b1 = wk.cp_off[cp_i + 1] as usize;
            for &byte in &input[b0..b1] {
                node = trie.next(node, byte);
                if node == 0 {
                    break;
                }
            }
            if node == 0 {
                break;
            }
            if let Some(id) = trie.term_value_at(node) {
                wk.span_id[span_index(start_cp + len, len, l)] = id;
            }
        }
    }

    // Unigram / OOV log-probabilities for every span.
    for end_cp in 1..=n_cp {
        let max_l = l.min(end_cp);
        for len in 1..=max_l {
            let idx = span_index(end_cp, len, l);
            let id = wk.span_id[idx];
            wk.span_luni[idx] = m.lm.unigram_logp(id, len as u16);
        }
    }

    Ok(n_cp)
}

/// CRF score of the word span `[s, t)`: label sequence `1, 0, ..., 0`
/// followed by the next word's start.
///
/// `k = 1`: `emit1[s] + trans11`;
/// `k >= 2`: `emit1[s] + trans10 + Σ emit0[s+1..t) + (k-2)·trans00 + trans01`.
#[inline]
fn crf_seg_score(m: &Model, wk: &Workspace, s: usize, t: usize) -> Score {
    let k = t - s;
    if k == 0 {
        return 0;
    }
    if k == 1 {
        return Score::from(wk.emit1[s]) + Score::from(m.crf.trans11);
    }
    let mut score = Score::from(wk.emit1[s]) + Score::from(m.crf.trans10);
    score += wk.pref_emit0[t] - wk.pref_emit0[s + 1];
    score += i32::from(m.crf.trans00) * (k as i32 - 2);
    score += Score::from(m.crf.trans01);
    score
}

/// Combined LM contribution for the edge into span `(t, k)` from the span
/// `(s, j)` (ids already resolved).
#[inline]
fn edge_lm(m: &Model, prev_id: u16, curr_id: u16, curr_luni: i16) -> Score {
    let lm = m.lm.bigram_logp(prev_id, curr_id, curr_luni);
    q88_mul(Score::from(m.lambda0), Score::from(lm))
}

/// Maximum-score segmentation. `out_b` receives the boundary codepoint
/// indices `[0, b1, ..., n_cp]`; the best path score is returned.
pub fn decode(m: &Model, input: &[u8], wk: &mut Workspace, out_b: &mut Vec<u32>) -> Result<Score> {
    let n_cp = precompute(m, input, wk)?;
    let l = usize::from(m.max_word_len);
    let l1 = l + 1;

    out_b.clear();
    if n_cp == 0 {
        out_b.extend_from_slice(&[0, 0]);
        return Ok(Score::from(m.crf.bos_to1));
    }

    wk.dp_ring.fill(NEG_INF);
    wk.dp_ring[0] = Score::from(m.crf.bos_to1);

    for pos in 1..=n_cp {
        let row = pos % l1;
        for k in 0..=l {
            wk.dp_ring[row * l1 + k] = NEG_INF;
        }

        let kmax = l.min(pos);
        for k in 1..=kmax {
            let start = pos - k;
            let seg = crf_seg_score(m, wk, start, pos);
            let idx_curr = span_index(pos, k, l);
            let curr_id = wk.span_id[idx_curr];
            let curr_luni = wk.span_luni[idx_curr];

            let prev_row = start % l1;
            let mut best = NEG_INF;
            let mut best_j = 0u8;

            // j = 0 is the BOS state, admissible only at position 0.
            if start == 0 {
                let prev_score = wk.dp_ring[prev_row * l1];
                if prev_score != NEG_INF {
                    let cand = prev_score + seg + edge_lm(m, ID_BOS, curr_id, curr_luni);
                    best = cand;
                    best_j = 0;
                }
            }

            let jmax = l.min(start);
            for j in 1..=jmax {
                let prev_score = wk.dp_ring[prev_row * l1 + j];
                if prev_score == NEG_INF {
                    continue;
                }
                let prev_id = wk.span_id[span_index(start, j, l)];
                let cand = prev_score + seg + edge_lm(m, prev_id, curr_id, curr_luni);
                // Strict comparison: on ties the smaller j (first writer) wins.
                if cand > best {
                    best = cand;
                    best_j = j as u8;
                }
            }

            wk.dp_ring[row * l1 + k] = best;
            wk.bp_prevlen[span_index(pos, k, l)] = best_j;
        }
    }

    // Best final state.
    let end_row = n_cp % l1;
    let mut best_final = NEG_INF;
    let mut best_k = 0usize;
    for k in 1..=l.min(n_cp) {
        let v = wk.dp_ring[end_row * l1 + k];
        if v > best_final {
            best_final = v;
            best_k = k;
        }
    }
    if best_k == 0 || best_final == NEG_INF {
        return Err(Error::Internal("unreachable final state"));
    }

    // Backtrack.
    let mut pos = n_cp;
    let mut k = best_k;
    loop {
        out_b.push(pos as u32);
        if pos == 0 {
            break;
        }
        let start = pos - k;
        let j = wk.bp_prevlen[span_index(pos, k, l)];
        pos = start;
        k = usize::from(j);
        if pos == 0 {
            out_b.push(0);
            break;
        }
        if k == 0 {
            return Err(Error::Internal("invalid back-pointer"));
        }
        if out_b.len() > n_cp + 1 {
            return Err(Error::Internal("backtrack exceeded sentence length"));
        }
    }
    out_b.reverse();

    if out_b.first() != Some(&0) || out_b.last() != Some(&(n_cp as u32)) {
        return Err(Error::Internal("boundary endpoints"));
    }
    Ok(best_final)
}

/// FFBS: sample one segmentation proportional to softened path weight.
///
/// Forward pass in natural-log double precision with every edge divided
/// by `temperature`; the returned score is the Q8.8 score of the sampled
/// path at temperature 1. Deterministic for a given `(seed, temperature)`.
pub fn decode_sample(
    m: &Model,
    input: &[u8],
    wk: &mut Workspace,
    temperature: f64,
    seed: u32,
    out_b: &mut Vec<u32>,
) -> Result<Score> {
    let temperature = if temperature.is_finite() && temperature > 0.0 {
        temperature
    } else {
        1.0
    };

    let n_cp = precompute(m, input, wk)?;
    let l = usize::from(m.max_word_len);
    let l1 = l + 1;

    out_b.clear();
    if n_cp == 0 {
        out_b.extend_from_slice(&[0, 0]);
        return Ok(Score::from(m.crf.bos_to1));
    }

    let states = (n_cp + 1) * l1;
    wk.alpha.clear();
    wk.alpha.resize(states, f64::NEG_INFINITY);
    wk.alpha[0] = q88_to_f64(Score::from(m.crf.bos_to1)) / temperature;

    // Forward, log-sum.
    for pos in 1..=n_cp {
        let kmax = l.min(pos);
        for k in 1..=kmax {
            let start = pos - k;
            let seg = crf_seg_score(m, wk, start, pos);
            let idx_curr = span_index(pos, k, l);
            let curr_id = wk.span_id[idx_curr];
            let curr_luni = wk.span_luni[idx_curr];

            let mut log_sum = f64::NEG_INFINITY;
            if start == 0 {
                let prev = wk.alpha[0];
                if prev.is_finite() {
                    let edge = q88_to_f64(seg + edge_lm(m, ID_BOS, curr_id, curr_luni))
                        / temperature;
                    log_sum = prev + edge;
                }
            } else {
                let jmax = l.min(start);
                for j in 1..=jmax {
                    let prev = wk.alpha[start * l1 + j];
                    if !prev.is_finite() {
                        continue;
                    }
                    let prev_id = wk.span_id[span_index(start, j, l)];
                    let edge = q88_to_f64(seg + edge_lm(m, prev_id, curr_id, curr_luni))
                        / temperature;
                    log_sum = crate::em::log_add(log_sum, prev + edge);
                }
            }
            wk.alpha[pos * l1 + k] = log_sum;
        }
    }

    // Sample the final word length from the normalized final row.
    let kmax_end = l.min(n_cp);
    let mut log_z = f64::NEG_INFINITY;
    for k in 1..=kmax_end {
        log_z = crate::em::log_add(log_z, wk.alpha[n_cp * l1 + k]);
    }
    if !log_z.is_finite() {
        return Err(Error::Internal("unreachable final state"));
    }

    let mut rng = XorShift32::new(seed);
    let u = rng.next_f64();
    let mut cdf = 0.0;
    let mut cur_k = 1usize;
    for k in 1..=kmax_end {
        let p = (wk.alpha[n_cp * l1 + k] - log_z).exp();
        cdf += p;
        if u <= cdf {
            cur_k = k;
            break;
        }
    }

    // Backward sampling of previous lengths.
    let mut pos = n_cp;
    let mut k = cur_k;
    loop {
        out_b.push(pos as u32);
        if pos == 0 {
            break;
        }
        let start = pos - k;
        if start == 0 {
            out_b.push(0);
            break;
        }

        let seg = crf_seg_score(m, wk, start, pos);
        let idx_curr = span_index(pos, k, l);
        let curr_id = wk.span_id[idx_curr];
        let curr_luni = wk.span_luni[idx_curr];
        let alpha_cur = wk.alpha[pos * l1 + k];
        let jmax = l.min(start);

        // Pass 1: max log-weight for stabilization.
        let mut maxlw = f64::NEG_INFINITY;
        let mut valid = 0usize;
        for j in 1..=jmax {
            let a_prev = wk.alpha[start * l1 + j];
            if !a_prev.is_finite() {
                continue;
            }
            let prev_id = wk.span_id[span_index(start, j, l)];
            let edge =
                q88_to_f64(seg + edge_lm(m, prev_id, curr_id, curr_luni)) / temperature;
            let lw = (a_prev + edge) - alpha_cur;
            if lw > maxlw {
                maxlw = lw;
            }
            valid += 1;
        }
        if valid == 0 || !maxlw.is_finite() {
            return Err(Error::Internal("no predecessor during backward sampling"));
        }

        // Pass 2: total shifted mass.
        let mut sum = 0.0;
        for j in 1..=jmax {
            let a_prev = wk.alpha[start * l1 + j];
            if !a_prev.is_finite() {
                continue;
            }
            let prev_id = wk.span_id[span_index(start, j, l)];
            let edge =
                q88_to_f64(seg + edge_lm(m, prev_id, curr_id, curr_luni)) / temperature;
            sum += ((a_prev + edge) - alpha_cur - maxlw).exp();
        }
        if !(sum > 0.0) || !sum.is_finite() {
            return Err(Error::Internal("degenerate sampling mass"));
        }

        // Pass 3: draw.
        let r = rng.next_f64() * sum;
        let mut acc = 0.0;
        let mut pick = 1usize;
        for j in 1..=jmax {
            let a_prev = wk.alpha[start * l1 + j];
            if !a_prev.is_finite() {
                continue;
            }
            let prev_id = wk.span_id[span_index(start, j, l)];
            let edge =
                q88_to_f64(seg + edge_lm(m, prev_id, curr_id, curr_luni)) / temperature;
            acc += ((a_prev + edge) - alpha_cur - maxlw).exp();
            pick = j;
            if r <= acc {
                break;
            }
        }

        pos = start;
        k = pick;
        if out_b.len() > n_cp + 1 {
            return Err(Error::Internal("backtrack exceeded sentence length"));
        }
    }
    out_b.reverse();
    if out_b.first() != Some(&0) || out_b.last() != Some(&(n_cp as u32)) {
        return Err(Error::Internal("boundary endpoints"));
    }

    // Q8.8 score of the sampled path (temperature 1).
    let mut total = Score::from(m.crf.bos_to1);
    for i in 1..out_b.len() {
        let s = out_b[i - 1] as usize;
        let t = out_b[i] as usize;
        let len = t - s;
        if len == 0 || len > l {
            continue;
        }
        let seg = crf_seg_score(m, wk, s, t);
        let idx = span_index(t, len, l);
        let curr_id = wk.span_id[idx];
        let curr_luni = wk.span_luni[idx];
        let prev_id = if i >= 2 {
            let plen = s - out_b[i - 2] as usize;
            if plen > 0 && plen <= l {
                wk.span_id[span_index(s, plen, l)]
            } else {
                ID_BOS
            }
        } else {
            ID_BOS
        };
        total += seg + edge_lm(m, prev_id, curr_id, curr_luni);
    }
    Ok(total)
}

/// N-best decoding. Each DP cell keeps its top `nbest` scores with
/// `(prev_len, prev_rank)` back-pointers, maintained by linear insertion
/// (N is small). Results are sorted by score descending; fewer than
/// `nbest` paths may exist on degenerate lattices.
pub fn decode_nbest(
    m: &Model,
    input: &[u8],
    wk: &mut Workspace,
    nbest: usize,
    out: &mut Vec<(Vec<u32>, Score)>,
) -> Result<usize> {
    if nbest == 0 || nbest > NBEST_MAX {
        return Err(Error::BadArgument("nbest out of range (1..=64)"));
    }

    let n_cp = precompute(m, input, wk)?;
    let l = usize::from(m.max_word_len);
    let l1 = l + 1;

    out.clear();
    if n_cp == 0 {
        out.push((vec![0, 0], Score::from(m.crf.bos_to1)));
        return Ok(1);
    }

    let states = (n_cp + 1) * l1;
    wk.nb_dp.clear();
    wk.nb_dp.resize(states * nbest, NEG_INF);
    wk.nb_len.clear();
    wk.nb_len.resize(states * nbest, 0);
    wk.nb_rank.clear();
    wk.nb_rank.resize(states * nbest, 0);

    wk.nb_dp[0] = Score::from(m.crf.bos_to1);

    let mut cand_s = [NEG_INF; NBEST_MAX];
    let mut cand_pl = [0u8; NBEST_MAX];
    let mut cand_pr = [0u8; NBEST_MAX];

    let insert =
        |s: &mut [Score], pl: &mut [u8], pr: &mut [u8], n: usize, cand: Score, j: u8, r: u8| {
            for t in 0..n {
                if cand > s[t] {
                    for u in (t + 1..n).rev() {
                        s[u] = s[u - 1];
                        pl[u] = pl[u - 1];
                        pr[u] = pr[u - 1];
                    }
                    s[t] = cand;
                    pl[t] = j;
                    pr[t] = r;
                    break;
                }
            }
        };

    for pos in 1..=n_cp {
        let kmax = l.min(pos);
        for k in 1..=kmax {
            let start = pos - k;
            let seg = crf_seg_score(m, wk, start, pos);
            let idx_curr = span_index(pos, k, l);
            let curr_id = wk.span_id[idx_curr];
            let curr_luni = wk.span_luni[idx_curr];

            cand_s[..nbest].fill(NEG_INF);
            cand_pl[..nbest].fill(0);
            cand_pr[..nbest].fill(0);

            if start == 0 {
                let edge = seg + edge_lm(m, ID_BOS, curr_id, curr_luni);
                for r in 0..nbest {
                    let prev = wk.nb_dp[r];
                    if prev == NEG_INF {
                        continue;
                    }
                    insert(
                        &mut cand_s,
                        &mut cand_pl,
                        &mut cand_pr,
                        nbest,
                        prev + edge,
                        0,
                        r as u8,
                    );
                }
            } else {
                let jmax = l.min(start);
                for j in 1..=jmax {
                    let prev_id = wk.span_id[span_index(start, j, l)];
                    let edge = seg + edge_lm(m, prev_id, curr_id, curr_luni);
                    let sid_prev = start * l1 + j;
                    for r in 0..nbest {
                        let prev = wk.nb_dp[sid_prev * nbest + r];
                        if prev == NEG_INF {
                            continue;
                        }
                        insert(
                            &mut cand_s,
                            &mut cand_pl,
                            &mut cand_pr,
                            nbest,
                            prev + edge,
                            j as u8,
                            r as u8,
                        );
                    }
                }
            }

            let sid = pos * l1 + k;
            for r in 0..nbest {
                wk.nb_dp[sid * nbest + r] = cand_s[r];
                wk.nb_len[sid * nbest + r] = cand_pl[r];
                wk.nb_rank[sid * nbest + r] = cand_pr[r];
            }
        }
    }

    // Global top-N over the final row.
    let mut top_s = [NEG_INF; NBEST_MAX];
    let mut top_k = [0usize; NBEST_MAX];
    let mut top_r = [0u8; NBEST_MAX];
    for k in 1..=l.min(n_cp) {
        let sid = n_cp * l1 + k;
        for r in 0..nbest {
            let s = wk.nb_dp[sid * nbest + r];
            if s == NEG_INF {
                continue;
            }
            for t in 0..nbest {
                if s > top_s[t] {
                    for u in (t + 1..nbest).rev() {
                        top_s[u] = top_s[u - 1];
                        top_k[u] = top_k[u - 1];
                        top_r[u] = top_r[u - 1];
                    }
                    top_s[t] = s;
                    top_k[t] = k;
                    top_r[t] = r as u8;
                    break;
                }
            }
        }
    }

    // Backtrack every surviving candidate.
    for i in 0..nbest {
        if top_s[i] == NEG_INF || top_k[i] == 0 {
            continue;
        }
        let mut boundaries = Vec::with_capacity(n_cp + 1);
        let mut pos = n_cp;
        let mut k = top_k[i];
        let mut r = usize::from(top_r[i]);
        loop {
            boundaries.push(pos as u32);
            if pos == 0 {
                break;
            }
            let start = pos - k;
            let sid = pos * l1 + k;
            let pl = wk.nb_len[sid * nbest + r];
            let pr = wk.nb_rank[sid * nbest + r];
            pos = start;
            k = usize::from(pl);
            r = usize::from(pr);
            if pos == 0 {
                boundaries.push(0);
                break;
            }
            if k == 0 {
                return Err(Error::Internal("invalid back-pointer"));
            }
            if boundaries.len() > n_cp + 1 {
                return Err(Error::Internal("backtrack exceeded sentence length"));
            }
        }
        boundaries.reverse();
        if boundaries.first() != Some(&0) || boundaries.last() != Some(&(n_cp as u32)) {
            return Err(Error::Internal("boundary endpoints"));
        }
        out.push((boundaries, top_s[i]));
    }

    Ok(out.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charclass::CcConfig;
    use crate::crf::CrfParams;
    use crate::model::LmParams;
    use crate::score::q88_from_f64;
    use crate::trie::DoubleArray;

    /// Model with vocabulary {"a": 0.5, "ab": 0.5}, zero CRF weights,
    /// lambda0 = 1, max_word_len = 2 (spec scenario 3 fixture).
    fn ab_model() -> Model {
        let mut trie = DoubleArray::new(64);
        trie.set_term_value(b"a", 0).unwrap();
        trie.set_term_value(b"ab", 1).unwrap();
        Model {
            crf: CrfParams::default(),
            lm: LmParams {
                trie,
                logp_uni: vec![q88_from_f64(0.5f64.ln()), q88_from_f64(0.5f64.ln())],
                bigram_key: Vec::new(),
                logp_bi: Vec::new(),
                unk_base: q88_from_f64(-5.0),
                unk_per_cp: q88_from_f64(-1.0),
            },
            lambda0: q88_from_f64(1.0),
            max_word_len: 2,
            flags: 0,
            cc: CcConfig::default(),
        }
    }

    #[test]
    fn empty_input() {
        let m = ab_model();
        let mut wk = Workspace::new(16, 2).unwrap();
        let mut b = Vec::new();
        let score = decode(&m, b"", &mut wk, &mut b).unwrap();
        assert_eq!(b, vec![0, 0]);
        assert_eq!(score, Score::from(m.crf.bos_to1));
    }

    #[test]
    fn longer_span_wins_on_lm_score() {
        // [ab] costs one log(0.5); [a b] costs two.
        let m = ab_model();
        let mut wk = Workspace::new(16, 2).unwrap();
        let mut b = Vec::new();
        let score = decode(&m, b"ab", &mut wk, &mut b).unwrap();
        assert_eq!(b, vec![0, 2]);
        let expected = Score::from(m.crf.bos_to1)
            + Score::from(m.crf.trans11)
            + q88_mul(
                Score::from(m.lambda0),
                Score::from(q88_from_f64(0.5f64.ln())),
            );
        assert_eq!(score, expected);
    }

    #[test]
    fn decode_is_deterministic() {
        let m = ab_model();
        let mut wk = Workspace::new(32, 2).unwrap();
        let mut first = Vec::new();
        let s1 = decode(&m, b"abab", &mut wk, &mut first).unwrap();
        for _ in 0..5 {
            let mut b = Vec::new();
            let s = decode(&m, b"abab", &mut wk, &mut b).unwrap();
            assert_eq!(b, first);
            assert_eq!(s, s1);
        }
    }

    #[test]
    fn oov_falls_back_to_char_spans() {
        let m = ab_model();
        let mut wk = Workspace::new(16, 2).unwrap();
        let mut b = Vec::new();
        // "xy" has no dictionary entries at all; the decoder must still
        // produce a valid boundary schema via OOV spans.
        decode(&m, b"xy", &mut wk, &mut b).unwrap();
        assert_eq!(b.first(), Some(&0));
        assert_eq!(b.last(), Some(&2));
        assert!(b.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn cp_offset_overflow_reported() {
        let m = ab_model();
        let mut wk = Workspace::new(3, 2).unwrap();
        let mut b = Vec::new();
        assert!(matches!(
            decode(&m, b"abababab", &mut wk, &mut b),
            Err(Error::CpOffsetOverflow)
        ));
    }

    #[test]
    fn seg_score_matches_naive_recomputation() {
        let mut m = ab_model();
        let mut crf = CrfParams::basic_preset();
        crf.trans00 = q88_from_f64(0.2);
        crf.trans01 = q88_from_f64(-0.4);
        crf.trans10 = q88_from_f64(0.1);
        crf.trans11 = q88_from_f64(-0.6);
        m.crf = crf;
        m.max_word_len = 5;

        let mut wk = Workspace::new(32, 5).unwrap();
        let input = "word9 and 漢字".as_bytes();
        let n_cp = precompute(&m, input, &mut wk).unwrap();

        for t in 1..=n_cp {
            for k in 2..=usize::from(m.max_word_len).min(t) {
                let s = t - k;
                let fast = crf_seg_score(&m, &wk, s, t);
                let mut naive = Score::from(wk.emit1[s]) + Score::from(m.crf.trans10);
                for i in s + 1..t {
                    naive += Score::from(wk.emit0[i]);
                }
                naive += i32::from(m.crf.trans00) * (k as i32 - 2);
                naive += Score::from(m.crf.trans01);
                assert_eq!(fast, naive, "span [{s}, {t})");
            }
        }
    }

    #[test]
    fn boundaries_map_to_bytes() {
        let m = ab_model();
        let mut wk = Workspace::new(16, 2).unwrap();
        let mut b = Vec::new();
        decode(&m, "aあb".as_bytes(), &mut wk, &mut b).unwrap();
        let bytes = boundaries_cp_to_bytes(wk.cp_offsets(), &b);
        for (i, &bb) in bytes.iter().enumerate() {
            assert_eq!(bb, wk.cp_offsets()[b[i] as usize]);
        }
        assert_eq!(*bytes.last().unwrap(), 5);
    }

    #[test]
    fn nbest_first_equals_viterbi() {
        let m = ab_model();
        let mut wk = Workspace::new(16, 2).unwrap();
        let mut viterbi = Vec::new();
        let v_score = decode(&m, b"ab", &mut wk, &mut viterbi).unwrap();

        let mut out = Vec::new();
        let n = decode_nbest(&m, b"ab", &mut wk, 2, &mut out).unwrap();
        assert_eq!(n, 2);
        assert_eq!(out[0].0, viterbi);
        assert_eq!(out[0].1, v_score);
        assert!(out[0].1 >= out[1].1);
        assert_eq!(out[1].0, vec![0, 1, 2]);
    }

    #[test]
    fn nbest_rejects_oversized_n() {
        let m = ab_model();
        let mut wk = Workspace::new(16, 2).unwrap();
        let mut out = Vec::new();
        assert!(matches!(
            decode_nbest(&m, b"ab", &mut wk, 65, &mut out),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn sample_respects_boundary_schema() {
        let m = ab_model();
        let mut wk = Workspace::new(16, 2).unwrap();
        let mut b = Vec::new();
        for seed in 1..50u32 {
            decode_sample(&m, b"abab", &mut wk, 1.0, seed, &mut b).unwrap();
            assert_eq!(b[0], 0);
            assert_eq!(*b.last().unwrap(), 4);
            assert!(b.windows(2).all(|w| w[1] > w[0] && w[1] - w[0] <= 2));
        }
    }

    #[test]
    fn sample_score_matches_path_recomputation() {
        let m = ab_model();
        let mut wk = Workspace::new(16, 2).unwrap();
        let mut b = Vec::new();
        let lm_half = q88_mul(
            Score::from(m.lambda0),
            Score::from(q88_from_f64(0.5f64.ln())),
        );
        for seed in 1..20u32 {
            let score = decode_sample(&m, b"ab", &mut wk, 2.0, seed, &mut b).unwrap();
            let expected = if b.len() == 2 {
                // [ab]
                Score::from(m.crf.bos_to1) + Score::from(m.crf.trans11) + lm_half
            } else {
                // [a, b]
                Score::from(m.crf.bos_to1)
                    + 2 * (Score::from(m.crf.trans11) + lm_half)
            };
            assert_eq!(score, expected);
        }
    }
}
