//! Corpus line reader for training.
//!
//! Delivers one trimmed line per sentence, enforcing byte and codepoint
//! budgets (over-long lines are skipped whole and counted), optionally
//! appending a lossless meta-LF, and optionally mapping every codepoint
//! outside a keep set to the fallback codepoint. The mapping pass also
//! re-encodes kept codepoints canonically, so overlong input encodings
//! can never leak into the vocabulary.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use ahash::AHashSet;
use wakachi_core::em::SentenceStream;
use wakachi_core::{utf8, Result};

#[derive(Debug, Clone)]
pub struct LineReaderOptions {
    /// Skip lines longer than this many bytes (0 = unlimited).
    pub max_line_bytes: usize,
    /// Codepoint budget per sentence (0 = unlimited).
    pub max_sentence_cp: usize,
    /// Skip sentences over the codepoint budget instead of failing later.
    pub skip_long_cp: bool,
    /// Append a meta-LF (U+2583) to each line for line-exact round trips.
    pub append_meta_lf: bool,
    /// Substitute for invalid or non-kept codepoints.
    pub fallback_cp: u32,
}

impl Default for LineReaderOptions {
    fn default() -> Self {
        Self {
            max_line_bytes: 4096,
            max_sentence_cp: 2048,
            skip_long_cp: true,
            append_meta_lf: false,
            fallback_cp: u32::from(b'?'),
        }
    }
}

pub struct MappedLineReader {
    reader: BufReader<File>,
    opts: LineReaderOptions,
    /// When set, codepoints outside this set map to the fallback.
    keep: Option<AHashSet<u32>>,
    raw: Vec<u8>,
    pub stat_skipped_long_bytes: u64,
    pub stat_skipped_long_cp: u64,
}

impl MappedLineReader {
    pub fn open<P: AsRef<Path>>(path: P, opts: LineReaderOptions) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            opts,
            keep: None,
            raw: Vec::new(),
            stat_skipped_long_bytes: 0,
            stat_skipped_long_cp: 0,
        })
    }

    /// Enable the mapping pass.
    pub fn set_keep_set(&mut self, keep: AHashSet<u32>) {
        self.keep = Some(keep);
    }

    pub fn reset_stats(&mut self) {
        self.stat_skipped_long_bytes = 0;
        self.stat_skipped_long_cp = 0;
    }

    /// Read one raw line into `self.raw`, trimmed of trailing CR/space/tab,
    /// meta-LF appended when configured. Ok(false) at EOF.
    fn read_raw_line(&mut self) -> Result<bool> {
        self.raw.clear();
        let n = self.reader.read_until(b'\n', &mut self.raw)?;
        if n == 0 {
            return Ok(false);
        }
        while self
            .raw
            .last()
            .is_some_and(|&b| b == b'\n' || b == b'\r' || b == b' ' || b == b'\t')
        {
            self.raw.pop();
        }
        if self.opts.max_line_bytes > 0 && self.raw.len() > self.opts.max_line_bytes {
            self.stat_skipped_long_bytes += 1;
            self.raw.clear();
            return Ok(true);
        }
        if self.opts.append_meta_lf && !self.raw.is_empty() {
            // U+2583
            self.raw.extend_from_slice(&[0xE2, 0x96, 0x83]);
        }
        Ok(true)
    }

    /// Map `self.raw` into `out` under the keep set. Returns false when
    /// the line must be skipped (codepoint budget).
    fn map_line(&mut self, out: &mut Vec<u8>) -> bool {
        out.clear();
        let mut fb = [0u8; 4];
        let fb_len = utf8::encode_cp(self.opts.fallback_cp, &mut fb);
        let fb = &fb[..fb_len];

        let mut cp_count = 0usize;
        let mut pos = 0usize;
        while pos < self.raw.len() {
            cp_count += 1;
            if self.opts.skip_long_cp
                && self.opts.max_sentence_cp > 0
                && cp_count > self.opts.max_sentence_cp
            {
                self.stat_skipped_long_cp += 1;
                out.clear();
                return false;
            }
            match utf8::decode_cp(&self.raw, pos) {
                Some((cp, adv)) => {
                    pos += adv;
                    let kept = match &self.keep {
                        Some(set) => set.contains(&cp),
                        None => true,
                    };
                    if kept {
                        let mut enc = [0u8; 4];
                        let n = utf8::encode_cp(cp, &mut enc);
                        out.extend_from_slice(&enc[..n]);
                    } else {
                        out.extend_from_slice(fb);
                    }
                }
                None => {
                    // Invalid byte sequences always fold into the fallback;
                    // raw bytes never reach the trainer.
                    pos += 1;
                    out.extend_from_slice(fb);
                }
            }
        }
        true
    }
}

impl SentenceStream for MappedLineReader {
    fn rewind(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn next_sentence(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        loop {
            if !self.read_raw_line()? {
                return Ok(false);
            }
            if self.raw.is_empty() {
                continue;
            }
            if self.map_line(buf) && !buf.is_empty() {
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_for(
        content: &[u8],
        opts: LineReaderOptions,
    ) -> (MappedLineReader, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.txt");
        std::fs::write(&path, content).unwrap();
        (MappedLineReader::open(&path, opts).unwrap(), dir)
    }

    #[test]
    fn lines_trimmed_and_skipped() {
        let opts = LineReaderOptions {
            max_line_bytes: 10,
            ..LineReaderOptions::default()
        };
        let (mut r, _dir) = reader_for(b"short \r\nthis line is far too long\nok\n", opts);
        let mut buf = Vec::new();
        assert!(r.next_sentence(&mut buf).unwrap());
        assert_eq!(buf, b"short");
        assert!(r.next_sentence(&mut buf).unwrap());
        assert_eq!(buf, b"ok");
        assert!(!r.next_sentence(&mut buf).unwrap());
        assert_eq!(r.stat_skipped_long_bytes, 1);
    }

    #[test]
    fn mapping_substitutes_non_kept() {
        let mut keep = AHashSet::new();
        for cp in [u32::from('a'), u32::from('b'), 0x3042] {
            keep.insert(cp);
        }
        let (mut r, _dir) = reader_for("abXあY\n".as_bytes(), LineReaderOptions::default());
        r.set_keep_set(keep);
        let mut buf = Vec::new();
        assert!(r.next_sentence(&mut buf).unwrap());
        assert_eq!(buf, "ab?あ?".as_bytes());
    }

    #[test]
    fn invalid_bytes_fold_to_fallback() {
        let (mut r, _dir) = reader_for(b"a\xFF\xFEb\n", LineReaderOptions::default());
        r.set_keep_set(AHashSet::from_iter([u32::from('a'), u32::from('b')]));
        let mut buf = Vec::new();
        assert!(r.next_sentence(&mut buf).unwrap());
        assert_eq!(buf, b"a??b");
    }

    #[test]
    fn codepoint_budget_skips() {
        let opts = LineReaderOptions {
            max_sentence_cp: 3,
            ..LineReaderOptions::default()
        };
        let (mut r, _dir) = reader_for(b"abcd\nab\n", opts);
        r.set_keep_set(AHashSet::from_iter("abcd".chars().map(u32::from)));
        let mut buf = Vec::new();
        assert!(r.next_sentence(&mut buf).unwrap());
        assert_eq!(buf, b"ab");
        assert!(!r.next_sentence(&mut buf).unwrap());
        assert_eq!(r.stat_skipped_long_cp, 1);
    }

    #[test]
    fn rewind_restarts() {
        let (mut r, _dir) = reader_for(b"one\ntwo\n", LineReaderOptions::default());
        let mut buf = Vec::new();
        assert!(r.next_sentence(&mut buf).unwrap());
        assert!(r.next_sentence(&mut buf).unwrap());
        assert!(!r.next_sentence(&mut buf).unwrap());
        r.rewind().unwrap();
        assert!(r.next_sentence(&mut buf).unwrap());
        assert_eq!(buf, b"one");
    }

    #[test]
    fn meta_lf_appended() {
        let opts = LineReaderOptions {
            append_meta_lf: true,
            ..LineReaderOptions::default()
        };
        let (mut r, _dir) = reader_for(b"ab\n", opts);
        let mut buf = Vec::new();
        assert!(r.next_sentence(&mut buf).unwrap());
        assert_eq!(buf, "ab▃".as_bytes());
    }
}
