//! Candidate n-gram extraction over a suffix array.
//!
//! For each length 2..=max_piece_len_cp, adjacent equal prefixes in
//! suffix order form runs whose length is the n-gram's occurrence count;
//! a per-length min-heap keeps the top candidates, and the merged pool is
//! sorted by count and truncated to the global budget.

use tracing::{info, warn};
use wakachi_core::suffix::{self, SKIP_ASCII_PUNCT, SKIP_ASCII_SPACE};
use wakachi_core::utf8;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub bytes: Vec<u8>,
    pub count: u32,
    pub len_cp: u16,
}

/// Bytes that disqualify a candidate piece.
fn is_good_piece(bytes: &[u8]) -> bool {
    !bytes
        .iter()
        .any(|&b| b == 0 || b == b'\n' || b == b'\r' || b == b'\t' || b == b' ')
}

fn contains_sub(hay: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && hay.windows(needle.len()).any(|w| w == needle)
}

/// Min-heap keyed by count, bounded at `cap`.
struct TopK {
    heap: Vec<Candidate>,
    cap: usize,
}

impl TopK {
    fn new(cap: usize) -> Self {
        Self {
            heap: Vec::with_capacity(cap),
            cap,
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let p = (i - 1) / 2;
            if self.heap[p].count <= self.heap[i].count {
                break;
            }
            self.heap.swap(p, i);
            i = p;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut s = i;
            if l < self.heap.len() && self.heap[l].count < self.heap[s].count {
                s = l;
            }
            if r < self.heap.len() && self.heap[r].count < self.heap[s].count {
                s = r;
            }
            if s == i {
                break;
            }
            self.heap.swap(s, i);
            i = s;
        }
    }

    fn push(&mut self, cand: Candidate) {
        if self.cap == 0 {
            return;
        }
        if self.heap.len() < self.cap {
            self.heap.push(cand);
            let n = self.heap.len();
            self.sift_up(n - 1);
        } else if cand.count > self.heap[0].count {
            self.heap[0] = cand;
            self.sift_down(0);
        }
    }
}

/// Extract the top n-grams of the sample `text`.
///
/// Candidates containing whitespace/control bytes or the fallback
/// character are rejected, as are prefixes that decode to fewer
/// codepoints than requested (truncated tail of the sample).
pub fn collect_top_ngrams(
    text: &[u8],
    max_piece_len_cp: usize,
    cand_total: usize,
    min_count: u32,
    fallback: &[u8],
) -> Vec<Candidate> {
    if text.is_empty() {
        return Vec::new();
    }

    // Prefer skipping whitespace and punctuation starts; relax when the
    // sample is dominated by skipped characters.
    let mut flags = SKIP_ASCII_SPACE | SKIP_ASCII_PUNCT;
    let mut sa = suffix::build(text, flags);
    if sa.is_empty() {
        flags = SKIP_ASCII_SPACE;
        sa = suffix::build(text, flags);
    }
    if sa.is_empty() {
        sa = suffix::build(text, 0);
    }
    if sa.is_empty() {
        warn!("suffix array has no valid starts; sample too small?");
        return Vec::new();
    }
    info!(
        starts = sa.len(),
        mib = (sa.len() * 4) as f64 / (1024.0 * 1024.0),
        "suffix array built"
    );

    let n_min = 2usize;
    let n_max = max_piece_len_cp.max(n_min);
    let n_lens = n_max - n_min + 1;
    let per_len = (cand_total / n_lens).max(512);

    let mut all: Vec<Candidate> = Vec::new();
    for ncp in n_min..=n_max {
        let mut heap = TopK::new(per_len);
        let mut last: Vec<u8> = Vec::new();
        let mut run = 0u32;

        let mut flush = |last: &[u8], run: u32, heap: &mut TopK| {
            if run >= min_count && !last.is_empty() {
                heap.push(Candidate {
                    bytes: last.to_vec(),
                    count: run,
                    len_cp: ncp as u16,
                });
            }
        };

        for &start in &sa {
            let cur = suffix::prefix_cps(text, start as usize, ncp);
            if cur.is_empty()
                || !is_good_piece(cur)
                || contains_sub(cur, fallback)
                || utf8::count_cps(cur) < ncp
            {
                continue;
            }
            if run == 0 {
                last.clear();
                last.extend_from_slice(cur);
                run = 1;
            } else if cur == last.as_slice() {
                run += 1;
            } else {
                flush(&last, run, &mut heap);
                last.clear();
                last.extend_from_slice(cur);
                run = 1;
            }
        }
        flush(&last, run, &mut heap);
        all.extend(heap.heap);
    }

    // Highest counts first; equal counts prefer shorter pieces.
    all.sort_by(|a, b| b.count.cmp(&a.count).then(a.len_cp.cmp(&b.len_cp)));
    if cand_total > 0 && all.len() > cand_total {
        all.truncate(cand_total);
    }
    info!(candidates = all.len(), "n-gram extraction done");
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequent_ngrams_found() {
        let mut text = Vec::new();
        for _ in 0..20 {
            text.extend_from_slice("東京タワー ".as_bytes());
        }
        for _ in 0..5 {
            text.extend_from_slice("大阪 ".as_bytes());
        }
        let cands = collect_top_ngrams(&text, 4, 100, 3, b"?");
        assert!(!cands.is_empty());
        let tokyo = cands
            .iter()
            .find(|c| c.bytes == "東京".as_bytes())
            .expect("東京 must be extracted");
        assert_eq!(tokyo.count, 20);
        assert_eq!(tokyo.len_cp, 2);
        // sorted by count descending
        assert!(cands.windows(2).all(|w| w[0].count >= w[1].count));
    }

    #[test]
    fn min_count_filters_rare() {
        let mut text = Vec::new();
        for _ in 0..2 {
            text.extend_from_slice("まれ ".as_bytes());
        }
        let cands = collect_top_ngrams(&text, 3, 100, 3, b"?");
        assert!(cands.iter().all(|c| c.bytes != "まれ".as_bytes()));
    }

    #[test]
    fn fallback_containing_pieces_rejected() {
        let mut text = Vec::new();
        for _ in 0..10 {
            text.extend_from_slice("a?b ".as_bytes());
        }
        let cands = collect_top_ngrams(&text, 3, 100, 2, b"?");
        assert!(cands.iter().all(|c| !contains_sub(&c.bytes, b"?")));
    }

    #[test]
    fn whitespace_pieces_rejected() {
        let text = "ab ab ab ab".as_bytes().to_vec();
        let cands = collect_top_ngrams(&text, 3, 100, 2, b"?");
        assert!(cands.iter().all(|c| is_good_piece(&c.bytes)));
    }
}
