//! wakachi: segment UTF-8 text with a trained model.
//!
//! Reads positional arguments or stdin lines, writes one line of
//! space-separated tokens per input line. Sampling, N-best and lossless
//! detokenization modes are for dataset augmentation and debugging.

use std::io::{BufRead, Read, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use unicode_normalization::UnicodeNormalization;

use wakachi_core::{decoder, lossless, model_io, utf8, Error, Model, Workspace};

#[derive(Parser, Debug)]
#[command(name = "wakachi", about = "NPYCRF word segmenter", version)]
struct Args {
    /// Model file (binary, MMJPv1/MMJPv2)
    #[arg(long)]
    model: PathBuf,

    /// Input strings; stdin is read when none are given
    input: Vec<String>,

    /// Workspace sentence limit in codepoints (doubled on overflow)
    #[arg(long, default_value_t = 2048)]
    max_n_cp: usize,

    /// Skip input lines longer than this many bytes (0 = unlimited)
    #[arg(long, default_value_t = 1 << 20)]
    max_line_bytes: usize,

    /// Disable NFC normalization of input lines
    #[arg(long)]
    no_normalize: bool,

    /// Substitute for invalid UTF-8 sequences
    #[arg(long, default_value = "?")]
    fallback_char: String,

    /// Lossless whitespace handling: -1 = auto from model flag, 0 = off, 1 = on
    #[arg(long, default_value_t = -1)]
    lossless_ws: i8,

    /// Read all of stdin as a single document instead of per line
    #[arg(long, default_value_t = 0)]
    read_all: u8,

    /// Detokenize mode: token stream in, original text out
    #[arg(long)]
    detok: bool,

    /// FFBS sampling (one stochastic segmentation per line)
    #[arg(long)]
    sample: bool,

    /// Sampling temperature (> 0; larger = more diverse)
    #[arg(long, default_value_t = 1.0)]
    temperature: f64,

    /// Sampling seed
    #[arg(long, default_value_t = 1)]
    seed: u32,

    /// Emit this many samples per line
    #[arg(long, default_value_t = 1)]
    nsamples: u32,

    /// Emit the top-N segmentations, one per line
    #[arg(long)]
    nbest: Option<usize>,

    /// Sample one segmentation uniformly from the top-N
    #[arg(long)]
    sample_nbest: Option<usize>,
}

struct XorShift32(u32);

impl XorShift32 {
    fn new(seed: u32) -> Self {
        Self(if seed == 0 { 0x1234_5678 } else { seed })
    }
    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

/// Replace invalid UTF-8 sequences with the fallback character.
fn sanitize(bytes: &[u8], fallback: &str) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut pos = 0;
    while pos < bytes.len() {
        match utf8::decode_cp(bytes, pos) {
            Some((cp, adv)) => {
                // decode_cp only yields scalar values
                out.push(char::from_u32(cp).unwrap_or('\u{FFFD}'));
                pos += adv;
            }
            None => {
                out.push_str(fallback);
                pos += 1;
            }
        }
    }
    out
}

struct Session {
    model: Model,
    work: Workspace,
    max_n_cp: usize,
    lossless: bool,
    include_newlines: bool,
    cache: lru::LruCache<String, String>,
}

impl Session {
    /// Run `f` against the workspace, doubling `max_n_cp` and retrying on
    /// offset-table overflow.
    fn with_retry<T>(
        &mut self,
        mut f: impl FnMut(&Model, &mut Workspace) -> wakachi_core::Result<T>,
    ) -> anyhow::Result<T> {
        const MAX_N_CP_CEILING: usize = 1 << 22;
        loop {
            match f(&self.model, &mut self.work) {
                Ok(v) => return Ok(v),
                Err(Error::CpOffsetOverflow) if self.max_n_cp < MAX_N_CP_CEILING => {
                    self.max_n_cp *= 2;
                    tracing::debug!(max_n_cp = self.max_n_cp, "growing decode workspace");
                    self.work =
                        Workspace::new(self.max_n_cp, usize::from(self.model.max_word_len))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Slice `input` into tokens along codepoint boundaries.
    fn tokens<'a>(&self, input: &'a [u8], boundaries: &[u32]) -> Vec<&'a [u8]> {
        let bytes = decoder::boundaries_cp_to_bytes(self.work.cp_offsets(), boundaries);
        bytes
            .windows(2)
            .filter(|w| w[1] > w[0])
            .map(|w| &input[w[0] as usize..w[1] as usize])
            .collect()
    }

    fn render(&self, input: &[u8], boundaries: &[u32]) -> String {
        let toks = self.tokens(input, boundaries);
        let mut out = String::new();
        for (i, t) in toks.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&String::from_utf8_lossy(t));
        }
        out
    }

    fn run_line(&mut self, args: &Args, line: &str, out: &mut impl Write) -> anyhow::Result<()> {
        if args.detok {
            let tokens: Vec<&[u8]> = line
                .split(' ')
                .filter(|t| !t.is_empty())
                .map(str::as_bytes)
                .collect();
            let decoded = lossless::detokenize(tokens);
            out.write_all(&decoded)?;
            out.write_all(b"\n")?;
            return Ok(());
        }

        let encoded;
        let input: &[u8] = if self.lossless {
            encoded = lossless::encode(line.as_bytes(), self.include_newlines);
            &encoded
        } else {
            line.as_bytes()
        };

        if args.sample || args.nsamples > 1 {
            let mut boundaries = Vec::new();
            for i in 0..args.nsamples.max(1) {
                let seed = args.seed.wrapping_add(i);
                self.with_retry(|m, wk| {
                    decoder::decode_sample(m, input, wk, args.temperature, seed, &mut boundaries)
                })?;
                writeln!(out, "{}", self.render(input, &boundaries))?;
            }
            return Ok(());
        }

        if let Some(n) = args.nbest {
            let mut results = Vec::new();
            self.with_retry(|m, wk| decoder::decode_nbest(m, input, wk, n, &mut results))?;
            for (boundaries, _score) in &results {
                writeln!(out, "{}", self.render(input, boundaries))?;
            }
            return Ok(());
        }

        if let Some(n) = args.sample_nbest {
            let mut results = Vec::new();
            let got =
                self.with_retry(|m, wk| decoder::decode_nbest(m, input, wk, n, &mut results))?;
            if got == 0 {
                bail!("n-best produced no candidates");
            }
            let mut rng = XorShift32::new(args.seed);
            let pick = (rng.next_u32() as usize) % got;
            writeln!(out, "{}", self.render(input, &results[pick].0))?;
            return Ok(());
        }

        // Plain Viterbi, with a per-line result cache: corpora repeat
        // lines, and decoding is deterministic.
        if let Some(hit) = self.cache.get(line) {
            writeln!(out, "{hit}")?;
            return Ok(());
        }
        let mut boundaries = Vec::new();
        self.with_retry(|m, wk| decoder::decode(m, input, wk, &mut boundaries))?;
        let rendered = self.render(input, &boundaries);
        writeln!(out, "{rendered}")?;
        self.cache.put(line.to_string(), rendered);
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if args.temperature <= 0.0 || !args.temperature.is_finite() {
        bail!("--temperature must be positive");
    }

    let model = model_io::load(&args.model)
        .with_context(|| format!("loading model {}", args.model.display()))?;
    let lossless_on = match args.lossless_ws {
        0 => false,
        1 => true,
        _ => model.lossless_ws(),
    };

    let max_word_len = usize::from(model.max_word_len);
    let work = Workspace::new(args.max_n_cp.max(16), max_word_len)?;
    let mut session = Session {
        model,
        work,
        max_n_cp: args.max_n_cp.max(16),
        lossless: lossless_on,
        include_newlines: args.read_all != 0,
        cache: lru::LruCache::new(NonZeroUsize::new(4096).unwrap()),
    };

    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());

    let normalize = |s: String| -> String {
        if args.no_normalize {
            s
        } else {
            s.nfc().collect()
        }
    };

    if !args.input.is_empty() {
        for raw in &args.input {
            let line = normalize(raw.clone());
            session.run_line(&args, &line, &mut out)?;
        }
        out.flush()?;
        return Ok(());
    }

    let stdin = std::io::stdin();
    let mut reader = stdin.lock();

    if args.read_all != 0 {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let doc = normalize(sanitize(&bytes, &args.fallback_char));
        session.run_line(&args, &doc, &mut out)?;
        out.flush()?;
        return Ok(());
    }

    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        while buf.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
            buf.pop();
        }
        if args.max_line_bytes > 0 && buf.len() > args.max_line_bytes {
            tracing::warn!(bytes = buf.len(), "skipping over-long line");
            writeln!(out)?;
            continue;
        }
        if buf.is_empty() {
            writeln!(out)?;
            continue;
        }
        let line = normalize(sanitize(&buf, &args.fallback_char));
        session.run_line(&args, &line, &mut out)?;
    }
    out.flush()?;
    Ok(())
}
