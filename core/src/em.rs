//! UniLM training: EM (forward-backward) over the piece lattice, M-step
//! renormalization, MDL-style pruning, and the LM-only Viterbi tokenizer
//! used for pseudo-labels and coverage prechecks.
//!
//! All probability work here is f64 in log space; fixed point only enters
//! at model export time.

use crate::trie::{DaRead, ROOT};
use crate::unilm::UniLm;
use crate::{utf8, Error, Result};

/// UniLM training configuration.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// EM iterations.
    pub num_iters: usize,
    /// Upper bound on match length during DP, in codepoints.
    pub max_piece_len_cp: usize,
    /// Additive pseudo-count in the M-step.
    pub smoothing: f64,
    /// MDL model cost: `lambda0 + lambda_len * len_cp`, in nats.
    pub mdl_lambda0: f64,
    pub mdl_lambda_len: f64,
    /// When non-zero, prune to this vocabulary size (mandatory pieces are
    /// always kept).
    pub target_vocab_size: usize,
    /// Prune after every EM iteration rather than only at the end.
    pub prune_each_iter: bool,
    /// Probability floor guarding `ln(0)`.
    pub min_prob: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_iters: 5,
            max_piece_len_cp: 8,
            smoothing: 0.1,
            mdl_lambda0: 0.0,
            mdl_lambda_len: 0.15,
            target_vocab_size: 0,
            prune_each_iter: true,
            min_prob: 1e-12,
        }
    }
}

/// Per-epoch EM statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmStats {
    /// Σ log P(sentence).
    pub loglik: f64,
    pub n_sentences: u64,
    /// Expected token count over the epoch.
    pub n_tokens_exp: f64,
}

/// A rewindable source of sentences. EM makes one pass per iteration, so
/// the stream must support being rewound between epochs; a mid-epoch
/// abort must discard the partial counts rather than feed an M-step.
pub trait SentenceStream {
    fn rewind(&mut self) -> Result<()>;
    /// Fill `buf` with the next sentence. `Ok(false)` at end of stream.
    /// Empty sentences may be delivered; consumers skip them.
    fn next_sentence(&mut self, buf: &mut Vec<u8>) -> Result<bool>;
}

/// In-memory corpus over borrowed sentence slices (tests, pseudo-label
/// batches).
pub struct SliceCorpus<'a> {
    sentences: &'a [&'a [u8]],
    i: usize,
}

impl<'a> SliceCorpus<'a> {
    pub fn new(sentences: &'a [&'a [u8]]) -> Self {
        Self { sentences, i: 0 }
    }
}

impl SentenceStream for SliceCorpus<'_> {
    fn rewind(&mut self) -> Result<()> {
        self.i = 0;
        Ok(())
    }

    fn next_sentence(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        if self.i >= self.sentences.len() {
            return Ok(false);
        }
        buf.clear();
        buf.extend_from_slice(self.sentences[self.i]);
        self.i += 1;
        Ok(true)
    }
}

/// Reusable DP buffers sized for `max_codepoints`-codepoint sentences.
pub struct EmWorkspace {
    cp_off: Vec<u32>,
    alpha: Vec<f64>,
    beta: Vec<f64>,
    bp_prev: Vec<i32>,
    bp_piece: Vec<i32>,
    sent_buf: Vec<u8>,
    keep: Vec<bool>,
    heap: Vec<(f64, u32)>,
}

impl EmWorkspace {
    pub fn new(max_codepoints: usize) -> Self {
        let npos = max_codepoints + 1;
        Self {
            cp_off: vec![0; npos],
            alpha: vec![0.0; npos],
            beta: vec![0.0; npos],
            bp_prev: vec![0; npos],
            bp_piece: vec![0; npos],
            sent_buf: Vec::new(),
            keep: Vec::new(),
            heap: Vec::new(),
        }
    }

    pub fn max_codepoints(&self) -> usize {
        self.cp_off.len() - 1
    }
}

/// `log(exp(a) + exp(b))` with an early-out beyond 50 nats.
#[inline]
pub(crate) fn log_add(a: f64, b: f64) -> f64 {
    if !a.is_finite() {
        return b;
    }
    if !b.is_finite() {
        return a;
    }
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    let d = lo - hi;
    if d < -50.0 {
        hi
    } else {
        hi + d.exp().ln_1p()
    }
}

/// Enumerate every piece matching at codepoint position `i`: walk the
/// trie consuming the bytes of successive codepoints, yielding
/// `(end_pos, piece_id)` at every node carrying a terminal value.
fn for_each_match<F>(m: &UniLm, sent: &[u8], cp_off: &[u32], n_cp: usize, i: usize, max_len_cp: usize, mut f: F)
where
    F: FnMut(usize, u32),
{
    let trie = m.trie();
    let limit = if max_len_cp > 0 { max_len_cp } else { n_cp };
    let kmax = (i + limit).min(n_cp);

    let mut node = ROOT;
    for k in i..kmax {
        let b0 = cp_off[k] as usize;
        let b1 = cp_off[k + 1] as usize;
        for &byte in &sent[b0..b1] {
            node = trie.next(node, byte);
            if node == 0 {
                return;
            }
        }
        if let Some(id) = trie.term_value_at(node) {
            f(k + 1, u32::from(id));
        }
    }
}

/// Forward-backward over one sentence, accumulating expected counts.
/// Returns `(logZ, expected_tokens)`.
fn forward_backward_sentence(
    m: &UniLm,
    sent: &[u8],
    max_piece_len_cp: usize,
    wk: &mut EmWorkspace,
    counts: &mut [f64],
) -> Result<(f64, f64)> {
    let n_cp = utf8::make_offsets(sent, &mut wk.cp_off)?;

    // Forward.
    for a in wk.alpha[..=n_cp].iter_mut() {
        *a = f64::NEG_INFINITY;
    }
    wk.alpha[0] = 0.0;
    for i in 0..n_cp {
        let ai = wk.alpha[i];
        if !ai.is_finite() {
            continue;
        }
        let (alpha, cp_off) = (&mut wk.alpha, &wk.cp_off);
        for_each_match(m, sent, cp_off, n_cp, i, max_piece_len_cp, |end, pid| {
            let cand = ai + m.logp[pid as usize];
            alpha[end] = log_add(alpha[end], cand);
        });
    }
    let log_z = wk.alpha[n_cp];
    if !log_z.is_finite() {
        return Err(Error::NoCoverage);
    }

    // Backward.
    for b in wk.beta[..=n_cp].iter_mut() {
        *b = f64::NEG_INFINITY;
    }
    wk.beta[n_cp] = 0.0;
    for i in (0..n_cp).rev() {
        let mut acc = f64::NEG_INFINITY;
        let (beta, cp_off) = (&wk.beta, &wk.cp_off);
        for_each_match(m, sent, cp_off, n_cp, i, max_piece_len_cp, |end, pid| {
            acc = log_add(acc, m.logp[pid as usize] + beta[end]);
        });
        wk.beta[i] = acc;
    }

    // Expected counts. Contributions below -80 nats are noise.
    let mut tok_exp = 0.0;
    for i in 0..n_cp {
        let ai = wk.alpha[i];
        if !ai.is_finite() {
            continue;
        }
        let (beta, cp_off) = (&wk.beta, &wk.cp_off);
        for_each_match(m, sent, cp_off, n_cp, i, max_piece_len_cp, |end, pid| {
            let log_use = ai + m.logp[pid as usize] + beta[end] - log_z;
            if log_use > -80.0 {
                let p = log_use.exp();
                counts[pid as usize] += p;
                tok_exp += p;
            }
        });
    }

    Ok((log_z, tok_exp))
}

/// E-step over the whole corpus: expected counts plus log-likelihood.
/// `counts` is resized to the vocabulary and zeroed here.
pub fn e_step(
    m: &UniLm,
    corpus: &mut dyn SentenceStream,
    cfg: &TrainConfig,
    wk: &mut EmWorkspace,
    counts: &mut Vec<f64>,
) -> Result<EmStats> {
    if m.vocab_size() == 0 {
        return Err(Error::BadArgument("E-step on empty vocabulary"));
    }
    counts.clear();
    counts.resize(m.vocab_size(), 0.0);

    corpus.rewind()?;

    let mut stats = EmStats::default();
    let mut sent = std::mem::take(&mut wk.sent_buf);
    loop {
        match corpus.next_sentence(&mut sent) {
            Ok(false) => break,
            Ok(true) => {}
            Err(e) => {
                wk.sent_buf = sent;
                return Err(e);
            }
        }
        if sent.is_empty() {
            continue;
        }
        match forward_backward_sentence(m, &sent, cfg.max_piece_len_cp, wk, counts) {
            Ok((log_z, tok)) => {
                stats.loglik += log_z;
                stats.n_tokens_exp += tok;
                stats.n_sentences += 1;
            }
            Err(e) => {
                wk.sent_buf = sent;
                return Err(e);
            }
        }
    }
    wk.sent_buf = sent;
    Ok(stats)
}

/// M-step: counts (plus smoothing) to floored, renormalized
/// log-probabilities.
pub fn m_step(m: &mut UniLm, cfg: &TrainConfig, counts: &[f64]) -> Result<()> {
    if m.vocab_size() == 0 || counts.len() < m.vocab_size() {
        return Err(Error::BadArgument("M-step counts shorter than vocabulary"));
    }
    let smooth = cfg.smoothing.max(0.0);
    let min_prob = if cfg.min_prob > 0.0 { cfg.min_prob } else { 1e-12 };

    let mut total = 0.0;
    for &c in &counts[..m.vocab_size()] {
        total += (c + smooth).max(0.0);
    }
    if !(total > 0.0) {
        return Err(Error::Internal("M-step with zero total count"));
    }

    for i in 0..m.vocab_size() {
        let c = (counts[i] + smooth).max(0.0);
        let p = (c / total).max(min_prob);
        m.logp[i] = p.ln();
    }
    m.normalize(min_prob)
}

fn heap_sift_up(heap: &mut [(f64, u32)], mut i: usize) {
    while i > 0 {
        let p = (i - 1) / 2;
        if heap[p].0 <= heap[i].0 {
            break;
        }
        heap.swap(p, i);
        i = p;
    }
}

fn heap_sift_down(heap: &mut [(f64, u32)], mut i: usize) {
    loop {
        let l = 2 * i + 1;
        let r = l + 1;
        let mut s = i;
        if l < heap.len() && heap[l].0 < heap[s].0 {
            s = l;
        }
        if r < heap.len() && heap[r].0 < heap[s].0 {
            s = r;
        }
        if s == i {
            break;
        }
        heap.swap(s, i);
        i = s;
    }
}

/// Character-fallback cost of a piece: Σ −logp over its constituent
/// single-codepoint pieces. Infinite when any single is missing.
fn piece_char_cost(m: &UniLm, id: usize) -> f64 {
    let bytes = m.piece_bytes(id);
    let mut cost = 0.0;
    let mut pos = 0;
    while pos < bytes.len() {
        let next = utf8::next_boundary(bytes, pos);
        match m.find_id(&bytes[pos..next]) {
            Some(cid) => cost += -m.logp[cid as usize],
            None => return f64::INFINITY,
        }
        pos = next;
    }
    cost
}

/// MDL pruning: a non-mandatory piece survives when the description
/// length it saves over its character fallback, weighted by usage,
/// exceeds its model cost `λ0 + λlen · len_cp` — or, under a vocabulary
/// size target, when it ranks in the top `target − |mandatory|` by that
/// score (min-heap selection).
///
/// Returns the new vocabulary size.
pub fn prune_mdl(
    m: &mut UniLm,
    cfg: &TrainConfig,
    wk: &mut EmWorkspace,
    counts: &[f64],
) -> Result<usize> {
    let v = m.vocab_size();
    if v == 0 {
        return Err(Error::BadArgument("prune on empty vocabulary"));
    }
    if counts.len() < v {
        return Err(Error::BadArgument("prune counts shorter than vocabulary"));
    }

    wk.keep.clear();
    wk.keep.resize(v, false);

    let mut mandatory = 0usize;
    for i in 0..v {
        if m.is_mandatory(i) {
            wk.keep[i] = true;
            mandatory += 1;
        }
    }

    let want_size_limit = cfg.target_vocab_size > 0;
    if !want_size_limit && !(cfg.mdl_lambda0 > 0.0 || cfg.mdl_lambda_len > 0.0) {
        // Nothing requested; vocabulary untouched.
        return Ok(v);
    }

    let k = if want_size_limit {
        cfg.target_vocab_size.saturating_sub(mandatory)
    } else {
        0
    };

    wk.heap.clear();
    for i in 0..v {
        if wk.keep[i] {
            continue;
        }
        let c = counts[i].max(0.0);
        let alt = piece_char_cost(m, i);
        let self_cost = -m.logp[i];
        if !alt.is_finite() || !self_cost.is_finite() {
            continue;
        }
        let saved = (alt - self_cost) * c;
        let cost = cfg.mdl_lambda0 + cfg.mdl_lambda_len * f64::from(m.piece(i).len_cp);
        let score = saved - cost;

        if !want_size_limit {
            if score > 0.0 {
                wk.keep[i] = true;
            }
            continue;
        }
        if k == 0 {
            continue;
        }
        if wk.heap.len() < k {
            wk.heap.push((score, i as u32));
            let n = wk.heap.len();
            heap_sift_up(&mut wk.heap, n - 1);
        } else if score > wk.heap[0].0 {
            wk.heap[0] = (score, i as u32);
            heap_sift_down(&mut wk.heap, 0);
        }
    }

    if want_size_limit {
        for &(_, id) in &wk.heap {
            wk.keep[id as usize] = true;
        }
    }

    let keep = std::mem::take(&mut wk.keep);
    let new_v = m.compact(&keep)?;
    wk.keep = keep;

    m.normalize(cfg.min_prob)?;
    Ok(new_v)
}

/// Full training loop: uniform init when all `logp` are zero, then
/// `num_iters` rounds of E-step, M-step and (optionally) pruning.
pub fn train_em_mdl(
    m: &mut UniLm,
    corpus: &mut dyn SentenceStream,
    cfg: &TrainConfig,
    wk: &mut EmWorkspace,
) -> Result<EmStats> {
    if m.vocab_size() == 0 {
        return Err(Error::BadArgument("training an empty vocabulary"));
    }

    if m.logp.iter().all(|&lp| lp == 0.0) {
        let lp = -(m.vocab_size() as f64).ln();
        for slot in &mut m.logp {
            *slot = lp;
        }
    }
    m.normalize(cfg.min_prob)?;

    let iters = cfg.num_iters.max(1);
    let mut counts: Vec<f64> = Vec::new();
    let mut stats = EmStats::default();

    for iter in 0..iters {
        stats = e_step(m, corpus, cfg, wk, &mut counts)?;
        m_step(m, cfg, &counts)?;
        if cfg.prune_each_iter {
            let new_v = prune_mdl(m, cfg, wk, &counts)?;
            tracing::info!(
                iter = iter + 1,
                loglik = stats.loglik,
                n_sent = stats.n_sentences,
                n_tokens_exp = stats.n_tokens_exp,
                vocab = new_v,
                "EM+MDL iteration"
            );
        } else {
            tracing::info!(
                iter = iter + 1,
                loglik = stats.loglik,
                n_sent = stats.n_sentences,
                n_tokens_exp = stats.n_tokens_exp,
                "EM iteration"
            );
        }
    }
    Ok(stats)
}

/// LM-only Viterbi tokenization: maximum-probability piece sequence.
/// `out_ids` receives the piece ids in order.
pub fn viterbi_tokenize(
    m: &UniLm,
    sent: &[u8],
    max_piece_len_cp: usize,
    wk: &mut EmWorkspace,
    out_ids: &mut Vec<u32>,
) -> Result<()> {
    out_ids.clear();
    let n_cp = utf8::make_offsets(sent, &mut wk.cp_off)?;
    if n_cp == 0 {
        return Ok(());
    }

    for i in 0..=n_cp {
        wk.alpha[i] = f64::NEG_INFINITY;
        wk.bp_prev[i] = -1;
        wk.bp_piece[i] = -1;
    }
    wk.alpha[0] = 0.0;
    wk.bp_prev[0] = 0;

    for i in 0..n_cp {
        let ai = wk.alpha[i];
        if !ai.is_finite() {
            continue;
        }
        let (alpha, bp_prev, bp_piece, cp_off) =
            (&mut wk.alpha, &mut wk.bp_prev, &mut wk.bp_piece, &wk.cp_off);
        for_each_match(m, sent, cp_off, n_cp, i, max_piece_len_cp, |end, pid| {
            let cand = ai + m.logp[pid as usize];
            if cand > alpha[end] {
                alpha[end] = cand;
                bp_prev[end] = i as i32;
                bp_piece[end] = pid as i32;
            }
        });
    }

    if !wk.alpha[n_cp].is_finite() || wk.bp_prev[n_cp] < 0 {
        return Err(Error::NoCoverage);
    }

    let mut pos = n_cp as i32;
    while pos > 0 {
        let pid = wk.bp_piece[pos as usize];
        let prev = wk.bp_prev[pos as usize];
        if pid < 0 || prev < 0 || prev >= pos {
            return Err(Error::Internal("viterbi backtrace pointer"));
        }
        out_ids.push(pid as u32);
        pos = prev;
    }
    out_ids.reverse();
    Ok(())
}

/// Log which single-codepoint pieces a non-coverable sentence is missing
/// (up to 10), with a bounded preview of the sentence itself.
pub fn dump_nocover(m: &UniLm, sent: &[u8]) {
    let preview_len = sent.len().min(400);
    tracing::warn!(
        bytes = sent.len(),
        preview = %String::from_utf8_lossy(&sent[..preview_len]),
        "sentence has no covering tokenization"
    );

    let mut pos = 0;
    let mut cp_i = 0usize;
    let mut shown = 0;
    while pos < sent.len() && shown < 10 {
        let (cp, adv) = match utf8::decode_cp(sent, pos) {
            Some(x) => x,
            None => (u32::from(sent[pos]), 1),
        };
        if m.find_id(&sent[pos..pos + adv]).is_none() {
            tracing::warn!(
                cp_index = cp_i,
                byte_pos = pos,
                codepoint = format_args!("U+{cp:04X}"),
                "missing single-codepoint piece"
            );
            shown += 1;
        }
        pos += adv;
        cp_i += 1;
    }
    if shown == 0 {
        tracing::warn!(
            "all single-codepoint pieces present but tokenization still fails; \
             trie shape and vocabulary bytes disagree"
        );
    }
}

/// Tokenize the first `limit` sentences (0 = all) and report the ordinal
/// of the first one that fails coverage, or `None` when all pass.
pub fn locate_first_nocover(
    m: &UniLm,
    corpus: &mut dyn SentenceStream,
    cfg: &TrainConfig,
    wk: &mut EmWorkspace,
    limit: u64,
) -> Result<Option<u64>> {
    corpus.rewind()?;
    let mut sent = Vec::new();
    let mut ids = Vec::new();
    let mut n_sent = 0u64;
    while corpus.next_sentence(&mut sent)? {
        if sent.is_empty() {
            continue;
        }
        n_sent += 1;
        if limit > 0 && n_sent > limit {
            break;
        }
        match viterbi_tokenize(m, &sent, cfg.max_piece_len_cp, wk, &mut ids) {
            Ok(()) => {}
            Err(Error::NoCoverage) => {
                dump_nocover(m, &sent);
                return Ok(Some(n_sent));
            }
            Err(Error::CpOffsetOverflow) => {
                tracing::warn!(
                    sentence = n_sent,
                    bytes = sent.len(),
                    "sentence exceeds workspace; consider a larger max_sentence_cp"
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}
