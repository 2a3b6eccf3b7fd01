//! Two-label linear-chain CRF training over codepoint positions.
//!
//! Labels: 1 = word start, 0 = word internal. `y[0]` is constrained to 1
//! and a virtual EOS label 1 adds a final transition from `y[n-1]`.
//! Training maximizes the L2-regularized log-likelihood with either a
//! per-epoch averaged SGD step or L-BFGS over
//! `f = -(ll - penalty) / total_positions`.
//!
//! Datasets come from a whitespace-segmented corpus (every gap marks a
//! label-1 position) or from pseudo labels produced by the LM-only
//! Viterbi tokenizer.

use serde::Deserialize;
use tracing::{info, warn};

use crate::charclass::{CcConfig, CC_BOS, CC_EOS};
use crate::crf::{feat_key, CrfParams};
use crate::em::{self, EmWorkspace, SentenceStream};
use crate::score::{q88_from_f64, q88_to_f64};
use crate::unilm::UniLm;
use crate::{lbfgs, utf8, Error, Result};

/// One training sentence: per-codepoint character classes and labels.
#[derive(Debug, Clone)]
pub struct CrfSentence {
    pub cls: Vec<u8>,
    pub y: Vec<u8>,
}

/// A labelled dataset.
#[derive(Debug, Clone, Default)]
pub struct CrfDataset {
    pub sentences: Vec<CrfSentence>,
    pub total_pos: usize,
}

impl CrfDataset {
    pub fn push(&mut self, sent: CrfSentence) {
        debug_assert_eq!(sent.cls.len(), sent.y.len());
        self.total_pos += sent.cls.len();
        self.sentences.push(sent);
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    /// Build from whitespace-tokenized text: tokens separated by
    /// spaces/tabs, one sentence per line. Lines that fail UTF-8 decoding
    /// or exceed `max_sentence_cp` codepoints are skipped.
    pub fn from_segmented_text(text: &str, max_sentence_cp: usize, cc: &CcConfig) -> Self {
        let mut ds = Self::default();
        for line in text.lines() {
            if let Some(sent) = parse_segmented_line(line.as_bytes(), max_sentence_cp, cc) {
                ds.push(sent);
            }
        }
        ds
    }

    pub fn from_segmented_file(
        path: &std::path::Path,
        max_sentence_cp: usize,
        cc: &CcConfig,
    ) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_segmented_text(&text, max_sentence_cp, cc))
    }

    /// Pseudo labels: run the LM-only Viterbi over raw sentences and mark
    /// every piece start as label 1. Sentences the tokenizer cannot cover
    /// fall back to character-level labels (every position a boundary).
    pub fn pseudo_labels(
        um: &UniLm,
        corpus: &mut dyn SentenceStream,
        wk: &mut EmWorkspace,
        max_piece_len_cp: usize,
        max_sentence_cp: usize,
        limit_sentences: usize,
        cc: &CcConfig,
    ) -> Result<Self> {
        let mut ds = Self::default();
        corpus.rewind()?;
        let mut sent = Vec::new();
        let mut ids: Vec<u32> = Vec::new();
        let mut n_ok = 0usize;
        let mut n_fallback = 0usize;

        while ds.sentences.len() < limit_sentences {
            if !corpus.next_sentence(&mut sent)? {
                break;
            }
            if sent.is_empty() {
                continue;
            }

            // Per-codepoint classes; invalid bytes advance one byte and
            // classify as their raw value.
            let mut cls = Vec::new();
            let mut cp_starts: Vec<usize> = Vec::new();
            let mut pos = 0;
            while pos < sent.len() {
                let (cp, adv) = match utf8::decode_cp(&sent, pos) {
                    Some(x) => x,
                    None => (u32::from(sent[pos]), 1),
                };
                cp_starts.push(pos);
                cls.push(cc.classify(cp));
                pos += adv;
            }
            let n_cp = cls.len();
            if n_cp == 0 || n_cp > max_sentence_cp {
                continue;
            }

            let mut y = vec![0u8; n_cp];
            match em::viterbi_tokenize(um, &sent, max_piece_len_cp, wk, &mut ids) {
                Ok(()) if !ids.is_empty() => {
                    n_ok += 1;
                    let mut byte_pos = 0usize;
                    let mut cp_idx = 0usize;
                    for &pid in &ids {
                        if cp_idx < n_cp {
                            y[cp_idx] = 1;
                        }
                        let plen = usize::from(um.piece(pid as usize).len);
                        byte_pos += plen;
                        while cp_idx < n_cp && cp_starts[cp_idx] < byte_pos {
                            cp_idx += 1;
                        }
                    }
                }
                _ => {
                    // Character-level fallback.
                    n_fallback += 1;
                    y.fill(1);
                }
            }
            y[0] = 1;
            ds.push(CrfSentence { cls, y });
        }

        info!(
            pushed = ds.sentences.len(),
            viterbi_ok = n_ok,
            char_fallback = n_fallback,
            "pseudo-label dataset built"
        );
        Ok(ds)
    }
}

/// Parse one whitespace-segmented line into classes and labels. Returns
/// `None` for empty, invalid, or over-long lines.
pub fn parse_segmented_line(
    line: &[u8],
    max_sentence_cp: usize,
    cc: &CcConfig,
) -> Option<CrfSentence> {
    let mut cls = Vec::new();
    let mut y = Vec::new();
    let mut pos = 0usize;
    let mut at_token_start = true;

    while pos < line.len() {
        let b = line[pos];
        if b == b' ' || b == b'\t' {
            pos += 1;
            at_token_start = true;
            continue;
        }
        let (cp, adv) = utf8::decode_cp(line, pos)?;
        pos += adv;
        if max_sentence_cp > 0 && cls.len() >= max_sentence_cp {
            return None;
        }
        cls.push(cc.classify(cp));
        y.push(u8::from(at_token_start));
        at_token_start = false;
    }

    if cls.is_empty() {
        return None;
    }
    y[0] = 1;
    Some(CrfSentence { cls, y })
}

/// Float-precision working copy of the CRF weights, parallel to a
/// [`CrfParams`] key table.
#[derive(Debug, Clone)]
pub struct CrfWeights {
    pub feat_w: Vec<f64>,
    pub trans00: f64,
    pub trans01: f64,
    pub trans10: f64,
    pub trans11: f64,
    pub bos_to1: f64,
}

impl CrfWeights {
    pub fn from_params(p: &CrfParams) -> Self {
        Self {
            feat_w: p.feat_w.iter().map(|&w| q88_to_f64(i32::from(w))).collect(),
            trans00: q88_to_f64(i32::from(p.trans00)),
            trans01: q88_to_f64(i32::from(p.trans01)),
            trans10: q88_to_f64(i32::from(p.trans10)),
            trans11: q88_to_f64(i32::from(p.trans11)),
            bos_to1: q88_to_f64(i32::from(p.bos_to1)),
        }
    }

    /// Quantize back into the Q8.8 tables.
    pub fn store_into(&self, p: &mut CrfParams) {
        p.feat_w = self.feat_w.iter().map(|&w| q88_from_f64(w)).collect();
        p.trans00 = q88_from_f64(self.trans00);
        p.trans01 = q88_from_f64(self.trans01);
        p.trans10 = q88_from_f64(self.trans10);
        p.trans11 = q88_from_f64(self.trans11);
        p.bos_to1 = q88_from_f64(self.bos_to1);
    }
}

#[inline]
fn logsumexp2(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// Emission score of one position under float weights.
fn emit_score(tbl: &CrfParams, w: &[f64], label: u8, prev_c: u8, cur_c: u8, next_c: u8) -> f64 {
    let mut s = 0.0;
    for key in [
        feat_key(0, label, cur_c, 0),
        feat_key(1, label, prev_c, 0),
        feat_key(2, label, next_c, 0),
        feat_key(3, label, prev_c, cur_c),
        feat_key(4, label, cur_c, next_c),
    ] {
        if let Some(i) = tbl.find_index(key) {
            s += w[i];
        }
    }
    s
}

/// Add `coeff` to the gradient slot of every template key at a position.
fn add_feat_grad(
    tbl: &CrfParams,
    grad: &mut [f64],
    coeff: f64,
    label: u8,
    prev_c: u8,
    cur_c: u8,
    next_c: u8,
) {
    for key in [
        feat_key(0, label, cur_c, 0),
        feat_key(1, label, prev_c, 0),
        feat_key(2, label, next_c, 0),
        feat_key(3, label, prev_c, cur_c),
        feat_key(4, label, cur_c, next_c),
    ] {
        if let Some(i) = tbl.find_index(key) {
            grad[i] += coeff;
        }
    }
}

/// Per-sentence scratch for forward/backward vectors.
#[derive(Default)]
struct ChainScratch {
    e0: Vec<f64>,
    e1: Vec<f64>,
    a0: Vec<f64>,
    a1: Vec<f64>,
    b0: Vec<f64>,
    b1: Vec<f64>,
}

impl ChainScratch {
    fn resize(&mut self, n: usize) {
        for v in [
            &mut self.e0, &mut self.e1, &mut self.a0, &mut self.a1, &mut self.b0, &mut self.b1,
        ] {
            v.clear();
            v.resize(n, 0.0);
        }
    }
}

/// Forward-backward for one sentence: adds the feature and transition
/// gradients of the maximization objective into `grad_feat` /
/// `grad_trans` (`[g00, g01, g10, g11]`) and returns the sentence
/// log-likelihood `score(y) - logZ`.
#[allow(clippy::too_many_arguments)]
fn sentence_grad(
    sent: &CrfSentence,
    tbl: &CrfParams,
    w: &CrfWeights,
    scratch: &mut ChainScratch,
    grad_feat: &mut [f64],
    grad_trans: &mut [f64; 4],
) -> f64 {
    let n = sent.cls.len();
    debug_assert!(n > 0);
    scratch.resize(n);
    let (t00, t01, t10, t11) = (w.trans00, w.trans01, w.trans10, w.trans11);

    for i in 0..n {
        let prev_c = if i == 0 { CC_BOS } else { sent.cls[i - 1] };
        let cur_c = sent.cls[i];
        let next_c = if i + 1 == n { CC_EOS } else { sent.cls[i + 1] };
        scratch.e0[i] = emit_score(tbl, &w.feat_w, 0, prev_c, cur_c, next_c);
        scratch.e1[i] = emit_score(tbl, &w.feat_w, 1, prev_c, cur_c, next_c);
    }

    // Forward: y[0] is fixed to 1 (bos_to1 is a path-independent constant
    // and cancels out of the likelihood).
    scratch.a0[0] = f64::NEG_INFINITY;
    scratch.a1[0] = scratch.e1[0];
    for i in 1..n {
        scratch.a0[i] =
            scratch.e0[i] + logsumexp2(scratch.a0[i - 1] + t00, scratch.a1[i - 1] + t10);
        scratch.a1[i] =
            scratch.e1[i] + logsumexp2(scratch.a0[i - 1] + t01, scratch.a1[i - 1] + t11);
    }
    // Virtual EOS label 1.
    let log_z = logsumexp2(scratch.a0[n - 1] + t01, scratch.a1[n - 1] + t11);

    // Backward.
    scratch.b0[n - 1] = t01;
    scratch.b1[n - 1] = t11;
    for i in (0..n.saturating_sub(1)).rev() {
        scratch.b0[i] = logsumexp2(
            t00 + scratch.e0[i + 1] + scratch.b0[i + 1],
            t01 + scratch.e1[i + 1] + scratch.b1[i + 1],
        );
        scratch.b1[i] = logsumexp2(
            t10 + scratch.e0[i + 1] + scratch.b0[i + 1],
            t11 + scratch.e1[i + 1] + scratch.b1[i + 1],
        );
    }

    // Empirical path score.
    let mut st = scratch.e1[0];
    for i in 1..n {
        let (yp, yc) = (sent.y[i - 1], sent.y[i]);
        st += match (yp, yc) {
            (0, 0) => t00,
            (0, _) => t01,
            (_, 0) => t10,
            _ => t11,
        };
        st += if yc == 1 { scratch.e1[i] } else { scratch.e0[i] };
    }
    st += if sent.y[n - 1] == 0 { t01 } else { t11 };

    // Transition gradients: empirical minus expected pair marginals.
    let mut exp_t = [0.0f64; 4];
    for i in 1..n {
        exp_t[0] += (scratch.a0[i - 1] + t00 + scratch.e0[i] + scratch.b0[i] - log_z).exp();
        exp_t[1] += (scratch.a0[i - 1] + t01 + scratch.e1[i] + scratch.b1[i] - log_z).exp();
        exp_t[2] += (scratch.a1[i - 1] + t10 + scratch.e0[i] + scratch.b0[i] - log_z).exp();
        exp_t[3] += (scratch.a1[i - 1] + t11 + scratch.e1[i] + scratch.b1[i] - log_z).exp();
    }
    // Final transition into EOS = 1.
    exp_t[1] += (scratch.a0[n - 1] + t01 - log_z).exp();
    exp_t[3] += (scratch.a1[n - 1] + t11 - log_z).exp();

    let mut emp_t = [0.0f64; 4];
    for i in 1..n {
        let slot = match (sent.y[i - 1], sent.y[i]) {
            (0, 0) => 0,
            (0, _) => 1,
            (_, 0) => 2,
            _ => 3,
        };
        emp_t[slot] += 1.0;
    }
    if sent.y[n - 1] == 0 {
        emp_t[1] += 1.0;
    } else {
        emp_t[3] += 1.0;
    }
    for t in 0..4 {
        grad_trans[t] += emp_t[t] - exp_t[t];
    }

    // Feature gradients: empirical key set minus both labels' expected
    // marginals.
    for i in 0..n {
        let prev_c = if i == 0 { CC_BOS } else { sent.cls[i - 1] };
        let cur_c = sent.cls[i];
        let next_c = if i + 1 == n { CC_EOS } else { sent.cls[i + 1] };
        add_feat_grad(tbl, grad_feat, 1.0, sent.y[i], prev_c, cur_c, next_c);
        let p0 = (scratch.a0[i] + scratch.b0[i] - log_z).exp();
        let p1 = (scratch.a1[i] + scratch.b1[i] - log_z).exp();
        add_feat_grad(tbl, grad_feat, -p0, 0, prev_c, cur_c, next_c);
        add_feat_grad(tbl, grad_feat, -p1, 1, prev_c, cur_c, next_c);
    }

    st - log_z
}

/// SGD options.
#[derive(Debug, Clone)]
pub struct SgdOptions {
    pub epochs: usize,
    pub lr: f64,
    pub l2: f64,
}

impl Default for SgdOptions {
    fn default() -> Self {
        Self {
            epochs: 20,
            lr: 0.05,
            l2: 1e-4,
        }
    }
}

/// SGD training: gradients averaged over total positions, one scaled
/// step per epoch. Returns the final-epoch log-likelihood.
pub fn train_sgd(
    ds: &CrfDataset,
    tbl: &CrfParams,
    w: &mut CrfWeights,
    opts: &SgdOptions,
) -> Result<f64> {
    if ds.is_empty() {
        return Err(Error::BadArgument("empty CRF dataset"));
    }
    let epochs = opts.epochs.max(1);
    let lr = if opts.lr > 0.0 { opts.lr } else { 0.05 };
    let l2 = opts.l2.max(0.0);

    let nfeat = tbl.feat_key.len();
    let mut grad_feat = vec![0.0; nfeat];
    let mut scratch = ChainScratch::default();
    let mut total_ll = 0.0;

    for ep in 0..epochs {
        grad_feat.fill(0.0);
        let mut grad_trans = [0.0f64; 4];
        total_ll = 0.0;

        for sent in &ds.sentences {
            if sent.cls.is_empty() {
                continue;
            }
            total_ll += sentence_grad(sent, tbl, w, &mut scratch, &mut grad_feat, &mut grad_trans);
        }

        if l2 > 0.0 {
            grad_trans[0] -= l2 * w.trans00;
            grad_trans[1] -= l2 * w.trans01;
            grad_trans[2] -= l2 * w.trans10;
            grad_trans[3] -= l2 * w.trans11;
            for (g, &wv) in grad_feat.iter_mut().zip(&w.feat_w) {
                *g -= l2 * wv;
            }
        }

        let scale = if ds.total_pos > 0 {
            1.0 / ds.total_pos as f64
        } else {
            1.0
        };
        let step = lr * scale;
        w.trans00 += step * grad_trans[0];
        w.trans01 += step * grad_trans[1];
        w.trans10 += step * grad_trans[2];
        w.trans11 += step * grad_trans[3];
        for (wv, &g) in w.feat_w.iter_mut().zip(&grad_feat) {
            *wv += step * g;
        }

        info!(
            epoch = ep + 1,
            epochs,
            loglik = total_ll,
            trans00 = w.trans00,
            trans01 = w.trans01,
            trans10 = w.trans10,
            trans11 = w.trans11,
            "CRF SGD epoch"
        );
    }
    Ok(total_ll)
}

/// L-BFGS options.
#[derive(Debug, Clone)]
pub struct LbfgsOptions {
    pub max_iter: usize,
    pub m: usize,
    pub tol: f64,
    pub l2: f64,
}

impl Default for LbfgsOptions {
    fn default() -> Self {
        Self {
            max_iter: 20,
            m: 8,
            tol: 1e-4,
            l2: 1e-4,
        }
    }
}

/// L-BFGS training: minimizes `f = -(ll - (l2/2)·‖θ‖²) / total_pos` over
/// the feature weights plus the four transitions.
pub fn train_lbfgs(
    ds: &CrfDataset,
    tbl: &CrfParams,
    w: &mut CrfWeights,
    opts: &LbfgsOptions,
) -> Result<()> {
    if ds.is_empty() {
        return Err(Error::BadArgument("empty CRF dataset"));
    }
    let nfeat = tbl.feat_key.len();
    let dim = nfeat + 4;
    let l2 = opts.l2.max(0.0);
    let scale = if ds.total_pos > 0 {
        1.0 / ds.total_pos as f64
    } else {
        1.0
    };

    let mut x = vec![0.0; dim];
    x[..nfeat].copy_from_slice(&w.feat_w);
    x[nfeat] = w.trans00;
    x[nfeat + 1] = w.trans01;
    x[nfeat + 2] = w.trans10;
    x[nfeat + 3] = w.trans11;

    info!(
        max_iter = opts.max_iter,
        m = opts.m,
        tol = opts.tol,
        l2,
        "CRF L-BFGS training"
    );

    let mut scratch = ChainScratch::default();
    let mut eval_w = w.clone();
    let params = lbfgs::LbfgsParams {
        max_iter: opts.max_iter,
        m: opts.m,
        tol: opts.tol,
        ls_max: 20,
    };

    lbfgs::minimize(&mut x, &params, |x, g| {
        eval_w.feat_w.copy_from_slice(&x[..nfeat]);
        eval_w.trans00 = x[nfeat];
        eval_w.trans01 = x[nfeat + 1];
        eval_w.trans10 = x[nfeat + 2];
        eval_w.trans11 = x[nfeat + 3];

        // g holds the maximization gradient first, then flips sign/scale.
        g.fill(0.0);
        let (grad_feat, grad_tail) = g.split_at_mut(nfeat);
        let mut grad_trans = [0.0f64; 4];
        let mut total_ll = 0.0;
        for sent in &ds.sentences {
            if sent.cls.is_empty() {
                continue;
            }
            total_ll +=
                sentence_grad(sent, tbl, &eval_w, &mut scratch, grad_feat, &mut grad_trans);
        }
        grad_tail.copy_from_slice(&grad_trans);

        let mut w2 = 0.0;
        for &v in x {
            w2 += v * v;
        }
        if l2 > 0.0 {
            for (gj, &xj) in g.iter_mut().zip(x) {
                *gj -= l2 * xj;
            }
        }
        let penalty = 0.5 * l2 * w2;

        for gj in g.iter_mut() {
            *gj = -*gj * scale;
        }
        -(total_ll - penalty) * scale
    });

    w.feat_w.copy_from_slice(&x[..nfeat]);
    w.trans00 = x[nfeat];
    w.trans01 = x[nfeat + 1];
    w.trans10 = x[nfeat + 2];
    w.trans11 = x[nfeat + 3];

    info!(
        trans00 = w.trans00,
        trans01 = w.trans01,
        trans10 = w.trans10,
        trans11 = w.trans11,
        "CRF L-BFGS done"
    );
    Ok(())
}

/// CRF weight overrides (TOML): optional transitions plus `[[feat]]`
/// entries addressed by `(template, label, v1, v2)`.
#[derive(Debug, Deserialize)]
pub struct CrfConfigFile {
    pub trans00: Option<f64>,
    pub trans01: Option<f64>,
    pub trans10: Option<f64>,
    pub trans11: Option<f64>,
    pub bos_to1: Option<f64>,
    #[serde(default)]
    pub feat: Vec<FeatOverride>,
}

#[derive(Debug, Deserialize)]
pub struct FeatOverride {
    pub template: u8,
    pub label: u8,
    pub v1: u8,
    #[serde(default)]
    pub v2: u8,
    pub w: f64,
}

/// Apply a TOML override string onto the working weights. Unknown
/// feature keys are reported and skipped.
pub fn apply_config_str(text: &str, tbl: &CrfParams, w: &mut CrfWeights) -> Result<()> {
    let cfg: CrfConfigFile =
        toml::from_str(text).map_err(|e| Error::Parse(format!("crf config: {e}")))?;
    if let Some(v) = cfg.trans00 {
        w.trans00 = v;
    }
    if let Some(v) = cfg.trans01 {
        w.trans01 = v;
    }
    if let Some(v) = cfg.trans10 {
        w.trans10 = v;
    }
    if let Some(v) = cfg.trans11 {
        w.trans11 = v;
    }
    if let Some(v) = cfg.bos_to1 {
        w.bos_to1 = v;
    }
    for f in &cfg.feat {
        let key = feat_key(f.template, f.label, f.v1, f.v2);
        match tbl.find_index(key) {
            Some(i) => w.feat_w[i] = f.w,
            None => warn!(
                template = f.template,
                label = f.label,
                v1 = f.v1,
                v2 = f.v2,
                "unknown CRF feature in config; skipped"
            ),
        }
    }
    Ok(())
}

pub fn apply_config_file(
    path: &std::path::Path,
    tbl: &CrfParams,
    w: &mut CrfWeights,
) -> Result<()> {
    let text = std::fs::read_to_string(path)?;
    apply_config_str(&text, tbl, w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unilm::PIECE_MANDATORY;

    fn cc() -> CcConfig {
        CcConfig::default()
    }

    #[test]
    fn segmented_line_labels_token_starts() {
        let sent = parse_segmented_line("ab cd  e".as_bytes(), 0, &cc()).unwrap();
        assert_eq!(sent.y, vec![1, 0, 1, 0, 1]);
        assert_eq!(sent.cls.len(), 5);
        assert!(parse_segmented_line(b"   ", 0, &cc()).is_none());
        assert!(parse_segmented_line("abcdef".as_bytes(), 3, &cc()).is_none());
        // invalid UTF-8 rejects the line
        assert!(parse_segmented_line(b"a\xFFb", 0, &cc()).is_none());
    }

    #[test]
    fn dataset_from_text() {
        let ds = CrfDataset::from_segmented_text("東京 都\nに 住む\n\n", 0, &cc());
        assert_eq!(ds.sentences.len(), 2);
        assert_eq!(ds.total_pos, 6);
        assert_eq!(ds.sentences[0].y, vec![1, 0, 1]);
    }

    fn tiny_dataset() -> CrfDataset {
        // Alternating alpha/digit tokens: boundaries at class changes.
        CrfDataset::from_segmented_text("ab 12 cd\n12 ab\nabc 1\n", 0, &cc())
    }

    #[test]
    fn sgd_improves_loglik() {
        let ds = tiny_dataset();
        let tbl = CrfParams::basic_preset();
        let mut w = CrfWeights::from_params(&tbl);
        // zero out the preset to start from scratch
        w.feat_w.fill(0.0);
        let opts = SgdOptions {
            epochs: 1,
            lr: 0.5,
            l2: 0.0,
        };
        let mut prev = f64::NEG_INFINITY;
        for _ in 0..10 {
            let ll = train_sgd(&ds, &tbl, &mut w, &opts).unwrap();
            assert!(ll >= prev - 1e-6, "loglik fell: {prev} -> {ll}");
            prev = ll;
        }
    }

    #[test]
    fn lbfgs_matches_or_beats_sgd() {
        let ds = tiny_dataset();
        let tbl = CrfParams::basic_preset();

        let mut w_sgd = CrfWeights::from_params(&tbl);
        let ll_sgd = train_sgd(
            &ds,
            &tbl,
            &mut w_sgd,
            &SgdOptions {
                epochs: 30,
                lr: 0.5,
                l2: 1e-4,
            },
        )
        .unwrap();

        let mut w_lb = CrfWeights::from_params(&tbl);
        train_lbfgs(
            &ds,
            &tbl,
            &mut w_lb,
            &LbfgsOptions {
                max_iter: 40,
                ..LbfgsOptions::default()
            },
        )
        .unwrap();

        // Evaluate both at their final weights.
        let mut scratch = ChainScratch::default();
        let mut gf = vec![0.0; tbl.feat_key.len()];
        let mut gt = [0.0; 4];
        let ll_lb: f64 = ds
            .sentences
            .iter()
            .map(|s| sentence_grad(s, &tbl, &w_lb, &mut scratch, &mut gf, &mut gt))
            .sum();
        assert!(
            ll_lb >= ll_sgd - 0.5,
            "lbfgs ll {ll_lb} much worse than sgd ll {ll_sgd}"
        );
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let ds = tiny_dataset();
        let tbl = CrfParams::basic_preset();
        let w = CrfWeights::from_params(&tbl);

        let eval = |w: &CrfWeights| -> f64 {
            let mut scratch = ChainScratch::default();
            let mut gf = vec![0.0; tbl.feat_key.len()];
            let mut gt = [0.0; 4];
            ds.sentences
                .iter()
                .map(|s| sentence_grad(s, &tbl, w, &mut scratch, &mut gf, &mut gt))
                .sum()
        };

        // analytic gradient
        let mut scratch = ChainScratch::default();
        let mut gf = vec![0.0; tbl.feat_key.len()];
        let mut gt = [0.0; 4];
        for s in &ds.sentences {
            sentence_grad(s, &tbl, &w, &mut scratch, &mut gf, &mut gt);
        }

        // finite difference on trans00 and one active feature
        let eps = 1e-5;
        let mut wp = w.clone();
        wp.trans00 += eps;
        let mut wm = w.clone();
        wm.trans00 -= eps;
        let fd = (eval(&wp) - eval(&wm)) / (2.0 * eps);
        assert!((fd - gt[0]).abs() < 1e-3, "fd {fd} vs analytic {}", gt[0]);

        let idx = tbl
            .find_index(feat_key(0, 1, crate::charclass::CC_ALPHA, 0))
            .unwrap();
        let mut wp = w.clone();
        wp.feat_w[idx] += eps;
        let mut wm = w.clone();
        wm.feat_w[idx] -= eps;
        let fd = (eval(&wp) - eval(&wm)) / (2.0 * eps);
        assert!((fd - gf[idx]).abs() < 1e-3, "fd {fd} vs analytic {}", gf[idx]);
    }

    #[test]
    fn config_overrides() {
        let tbl = CrfParams::basic_preset();
        let mut w = CrfWeights::from_params(&tbl);
        let text = r#"
trans00 = 0.33
bos_to1 = 0.75

[[feat]]
template = 0
label = 1
v1 = 3
w = 1.25

[[feat]]
template = 0
label = 1
v1 = 199
w = 9.0
"#;
        apply_config_str(text, &tbl, &mut w).unwrap();
        assert!((w.trans00 - 0.33).abs() < 1e-12);
        assert!((w.bos_to1 - 0.75).abs() < 1e-12);
        let idx = tbl
            .find_index(feat_key(0, 1, crate::charclass::CC_ALPHA, 0))
            .unwrap();
        assert!((w.feat_w[idx] - 1.25).abs() < 1e-12);
    }

    #[test]
    fn pseudo_labels_from_lm() {
        let mut um = UniLm::new();
        for k in ["a", "b"] {
            um.add_piece(k.as_bytes(), PIECE_MANDATORY).unwrap();
        }
        um.add_piece(b"ab", 0).unwrap();
        um.set_logp(0, (0.15f64).ln()).unwrap();
        um.set_logp(1, (0.15f64).ln()).unwrap();
        um.set_logp(2, (0.7f64).ln()).unwrap();

        let sents: Vec<&[u8]> = vec![b"abab", b"ba"];
        let mut corpus = crate::em::SliceCorpus::new(&sents);
        let mut wk = EmWorkspace::new(32);
        let ds =
            CrfDataset::pseudo_labels(&um, &mut corpus, &mut wk, 8, 64, 100, &cc()).unwrap();
        assert_eq!(ds.sentences.len(), 2);
        // "abab" tokenizes as [ab][ab] -> starts at 0 and 2
        assert_eq!(ds.sentences[0].y, vec![1, 0, 1, 0]);
        // "ba" tokenizes as [b][a] -> both starts
        assert_eq!(ds.sentences[1].y, vec![1, 1]);
    }
}
