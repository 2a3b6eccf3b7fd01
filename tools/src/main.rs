//! wakachi-train: build a segmentation model from a raw corpus.
//!
//! Pipeline: corpus scan -> character keep-set -> candidate n-grams
//! (suffix array) -> UniLM EM+MDL -> export selection -> CRF weights ->
//! binary model.

mod candidates;
mod corpus;

use std::path::PathBuf;

use ahash::AHashMap;
use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use corpus::{LineReaderOptions, MappedLineReader};
use wakachi_core::charclass::{CcConfig, CcMode};
use wakachi_core::crf_train::{self, CrfDataset, CrfWeights, LbfgsOptions, SgdOptions};
use wakachi_core::em::{self, EmWorkspace, SentenceStream, TrainConfig};
use wakachi_core::model::{
    FLAG_CC_ASCII, FLAG_CC_COMPAT, FLAG_CC_RANGES, FLAG_CC_UTF8LEN, FLAG_LOSSLESS_WS,
};
use wakachi_core::score::q88_from_f64;
use wakachi_core::unilm::PIECE_MANDATORY;
use wakachi_core::{utf8, CrfParams, DoubleArray, Error, LmParams, Model, UniLm};

#[derive(Parser, Debug)]
#[command(name = "wakachi-train", about = "Train a wakachi segmentation model", version)]
struct Args {
    /// Raw corpus, one sentence per line
    #[arg(long)]
    corpus: PathBuf,

    /// Output model path
    #[arg(long)]
    out: PathBuf,

    /// Target vocabulary size for MDL pruning (0 = unconstrained)
    #[arg(long, default_value_t = 8000)]
    vocab: usize,

    /// Maximum piece length in codepoints (also the decoder word limit)
    #[arg(long, default_value_t = 8)]
    max_piece_len: usize,

    /// EM iterations
    #[arg(long, default_value_t = 5)]
    iters: usize,

    /// Bytes of mapped sample used for candidate extraction
    #[arg(long, default_value_t = 20_000_000)]
    sample_bytes: usize,

    /// Total candidate n-grams kept across lengths
    #[arg(long, default_value_t = 50_000)]
    cand_total: usize,

    /// Minimum n-gram occurrence count
    #[arg(long, default_value_t = 50)]
    min_count: u32,

    /// Single codepoints kept for UniLM coverage
    #[arg(long, default_value_t = 6000)]
    char_vocab: usize,

    /// Top-N single-codepoint pieces kept in the exported dictionary
    #[arg(long, default_value_t = 400)]
    keep_single_top: usize,

    /// Skip corpus lines longer than this many bytes
    #[arg(long, default_value_t = 4096)]
    max_line_bytes: usize,

    /// Workspace codepoint budget per sentence
    #[arg(long, default_value_t = 2048)]
    max_sentence_cp: usize,

    /// Skip sentences over the codepoint budget (0|1)
    #[arg(long, default_value_t = 1)]
    skip_long_cp: u8,

    /// Check coverage of the first N sentences before EM (0 = disable)
    #[arg(long, default_value_t = 5000)]
    precheck_lines: u64,

    /// Fallback character replacing rare or invalid input
    #[arg(long, default_value = "?")]
    fallback_char: String,

    /// Unknown-word base penalty (nats)
    #[arg(long, default_value_t = -5.0)]
    unk_base: f64,

    /// Unknown-word per-codepoint penalty (nats)
    #[arg(long, default_value_t = -1.0)]
    unk_per_cp: f64,

    /// LM weight in the combined decode score
    #[arg(long, default_value_t = 1.0)]
    lambda0: f64,

    /// MDL constant model cost per piece (nats)
    #[arg(long, default_value_t = 0.0)]
    mdl_lambda0: f64,

    /// MDL per-codepoint model cost (nats)
    #[arg(long, default_value_t = 0.15)]
    mdl_lambda_len: f64,

    /// CRF weight overrides (TOML)
    #[arg(long)]
    crf_config: Option<PathBuf>,

    /// Supervised CRF corpus (whitespace-segmented)
    #[arg(long)]
    crf_supervised: Option<PathBuf>,

    /// Pseudo-label CRF training from the LM-only Viterbi (0|1)
    #[arg(long, default_value_t = 0)]
    crf_unsupervised: u8,

    /// Sentences used for pseudo-label training
    #[arg(long, default_value_t = 1000)]
    crf_unsup_sentences: usize,

    /// CRF optimizer: sgd | lbfgs
    #[arg(long, default_value = "lbfgs")]
    crf_opt: String,

    /// CRF epochs (SGD) / max iterations (L-BFGS)
    #[arg(long, default_value_t = 20)]
    crf_epochs: usize,

    /// SGD learning rate
    #[arg(long, default_value_t = 0.05)]
    crf_lr: f64,

    /// L2 regularization
    #[arg(long, default_value_t = 1e-4)]
    crf_l2: f64,

    /// L-BFGS history size
    #[arg(long, default_value_t = 8)]
    crf_lbfgs_m: usize,

    /// L-BFGS gradient-norm tolerance
    #[arg(long, default_value_t = 1e-4)]
    crf_tol: f64,

    /// Mark the model for lossless whitespace tokenization (0|1)
    #[arg(long, default_value_t = 0)]
    lossless_ws: u8,

    /// Append a meta-LF to every training line (0|1)
    #[arg(long, default_value_t = 0)]
    lossless_eol: u8,

    /// Character class mode: compat | ascii | utf8len | ranges
    #[arg(long, default_value = "compat")]
    cc_mode: String,

    /// Range table for --cc_mode ranges (lines of `lo hi class_id`)
    #[arg(long)]
    cc_ranges: Option<PathBuf>,

    /// Fallback for unmatched ranges: ascii | utf8len
    #[arg(long, default_value = "utf8len")]
    cc_fallback: String,
}

fn parse_fallback_cp(s: &str) -> u32 {
    s.chars().next().map_or(u32::from('?'), u32::from)
}

fn resolve_cc(args: &Args) -> anyhow::Result<(CcConfig, u32)> {
    let mode = match args.cc_mode.as_str() {
        "compat" => CcMode::Compat,
        "ascii" => CcMode::Ascii,
        "utf8len" => CcMode::Utf8Len,
        "ranges" => CcMode::Ranges,
        other => bail!("unknown cc_mode '{other}' (expected compat|ascii|utf8len|ranges)"),
    };
    let fallback = match args.cc_fallback.as_str() {
        "ascii" => CcMode::Ascii,
        "utf8len" => CcMode::Utf8Len,
        other => bail!("unknown cc_fallback '{other}' (expected ascii|utf8len)"),
    };
    let ranges = if mode == CcMode::Ranges {
        let path = args
            .cc_ranges
            .as_ref()
            .context("--cc_mode ranges requires --cc_ranges FILE")?;
        let r = CcConfig::load_ranges(path)
            .with_context(|| format!("loading {}", path.display()))?;
        info!(ranges = r.len(), "character class ranges loaded");
        r
    } else {
        Vec::new()
    };
    let flag = match mode {
        CcMode::Ascii => FLAG_CC_ASCII,
        CcMode::Utf8Len => FLAG_CC_UTF8LEN,
        CcMode::Ranges => FLAG_CC_RANGES,
        CcMode::Compat => FLAG_CC_COMPAT,
    };
    Ok((
        CcConfig {
            mode,
            fallback,
            ranges,
        },
        flag,
    ))
}

fn reader_options(args: &Args) -> LineReaderOptions {
    LineReaderOptions {
        max_line_bytes: args.max_line_bytes,
        max_sentence_cp: args.max_sentence_cp,
        skip_long_cp: args.skip_long_cp != 0,
        append_meta_lf: args.lossless_eol != 0,
        fallback_cp: parse_fallback_cp(&args.fallback_char),
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    if args.max_piece_len == 0 || args.max_piece_len > 255 {
        bail!("--max_piece_len must be in 1..=255");
    }
    let fallback_cp = parse_fallback_cp(&args.fallback_char);
    let mut fb_buf = [0u8; 4];
    let fb_len = utf8::encode_cp(fallback_cp, &mut fb_buf);
    let fb_bytes = &fb_buf[..fb_len];
    let (cc, cc_flag) = resolve_cc(args)?;

    info!(
        corpus = %args.corpus.display(),
        vocab = args.vocab,
        max_piece_len = args.max_piece_len,
        iters = args.iters,
        "training"
    );

    // ---- pass 1: codepoint frequencies ----
    let mut reader = MappedLineReader::open(&args.corpus, reader_options(args))
        .with_context(|| format!("opening corpus {}", args.corpus.display()))?;
    let mut cp_counts: AHashMap<u32, u64> = AHashMap::new();
    let mut n_lines = 0u64;
    {
        let mut buf = Vec::new();
        while reader.next_sentence(&mut buf)? {
            n_lines += 1;
            let mut pos = 0;
            while pos < buf.len() {
                match utf8::decode_cp(&buf, pos) {
                    Some((cp, adv)) => {
                        *cp_counts.entry(cp).or_insert(0) += 1;
                        pos += adv;
                    }
                    None => {
                        *cp_counts.entry(fallback_cp).or_insert(0) += 1;
                        pos += 1;
                    }
                }
            }
        }
    }
    info!(
        lines = n_lines,
        unique_codepoints = cp_counts.len(),
        "corpus scanned"
    );
    if n_lines == 0 {
        bail!("corpus has no usable lines");
    }

    // ---- keep set of single codepoints ----
    let mut char_vocab = args.char_vocab;
    if args.vocab > 0 && char_vocab >= args.vocab {
        // mandatory singles must not eat the whole vocabulary target
        char_vocab = if args.vocab >= 512 {
            args.vocab / 2
        } else {
            args.vocab - 1
        };
    }
    char_vocab = char_vocab.max(256);

    let mut keep: ahash::AHashSet<u32> = ahash::AHashSet::new();
    keep.insert(fallback_cp);
    for cp in 0x20u32..=0x7E {
        keep.insert(cp);
    }
    let mut ranked: Vec<(u32, u64)> = cp_counts
        .iter()
        .filter(|&(&cp, _)| cp != u32::from('\n') && cp != u32::from('\r') && cp != u32::from('\t'))
        .map(|(&cp, &n)| (cp, n))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    for &(cp, _) in &ranked {
        if keep.len() >= char_vocab {
            break;
        }
        keep.insert(cp);
    }
    info!(
        keep_chars = keep.len(),
        char_vocab,
        fallback = fallback_cp,
        "keep set built"
    );

    // ---- mapped sample for candidate extraction ----
    reader.set_keep_set(keep.clone());
    reader.rewind()?;
    let mut sample: Vec<u8> = Vec::with_capacity(args.sample_bytes.min(1 << 26) + 1024);
    {
        let mut buf = Vec::new();
        while sample.len() < args.sample_bytes && reader.next_sentence(&mut buf)? {
            sample.extend_from_slice(&buf);
            sample.push(b'\n');
        }
    }
    info!(sample_bytes = sample.len(), "candidate sample collected");

    let cands = candidates::collect_top_ngrams(
        &sample,
        args.max_piece_len,
        args.cand_total,
        args.min_count,
        fb_bytes,
    );
    drop(sample);

    // ---- UniLM initialization ----
    let mut um = UniLm::new();
    let mut added_singles = 0usize;
    for &cp in &keep {
        let mut enc = [0u8; 4];
        let n = utf8::encode_cp(cp, &mut enc);
        match um.add_piece(&enc[..n], PIECE_MANDATORY) {
            Ok(_) => added_singles += 1,
            Err(e) => warn!(cp, error = %e, "failed to add single-codepoint piece"),
        }
    }
    let mut added_cands = 0usize;
    for c in &cands {
        if um.add_piece(&c.bytes, 0).is_ok() {
            added_cands += 1;
        }
    }
    info!(
        singles = added_singles,
        candidates = added_cands,
        vocab = um.vocab_size(),
        "UniLM initialized"
    );

    // The keep set iterates in hash order; rebuild the trie in
    // lexicographic order so its shape is deterministic.
    um.rebuild_trie_sorted()?;

    let cfg = TrainConfig {
        num_iters: args.iters,
        max_piece_len_cp: args.max_piece_len,
        smoothing: 0.1,
        mdl_lambda0: args.mdl_lambda0,
        mdl_lambda_len: args.mdl_lambda_len,
        target_vocab_size: args.vocab,
        prune_each_iter: true,
        min_prob: 1e-12,
    };
    let mut wk = EmWorkspace::new(args.max_sentence_cp);

    // Uniform start.
    let lp = -(um.vocab_size() as f64).ln();
    for id in 0..um.vocab_size() as u32 {
        um.set_logp(id, lp)?;
    }
    um.normalize(cfg.min_prob)?;

    // ---- coverage precheck ----
    if args.precheck_lines > 0 {
        info!(lines = args.precheck_lines, "coverage precheck");
        if let Some(bad) =
            em::locate_first_nocover(&um, &mut reader, &cfg, &mut wk, args.precheck_lines)?
        {
            bail!("coverage precheck failed at sentence {bad}; see warnings above");
        }
    }

    // ---- EM + MDL ----
    info!(vocab = um.vocab_size(), "EM+MDL start");
    let mut counts: Vec<f64> = Vec::new();
    for iter in 0..cfg.num_iters.max(1) {
        reader.reset_stats();
        let stats = match em::e_step(&um, &mut reader, &cfg, &mut wk, &mut counts) {
            Ok(s) => s,
            Err(Error::NoCoverage) => {
                let _ = em::locate_first_nocover(&um, &mut reader, &cfg, &mut wk, 0);
                bail!("E-step hit a sentence with no covering tokenization");
            }
            Err(e) => return Err(e.into()),
        };
        em::m_step(&mut um, &cfg, &counts)?;
        let new_v = em::prune_mdl(&mut um, &cfg, &mut wk, &counts)?;
        info!(
            iter = iter + 1,
            loglik = stats.loglik,
            n_sent = stats.n_sentences,
            n_tokens_exp = stats.n_tokens_exp,
            vocab = new_v,
            skipped_long_bytes = reader.stat_skipped_long_bytes,
            skipped_long_cp = reader.stat_skipped_long_cp,
            "EM iteration"
        );
    }
    info!(vocab = um.vocab_size(), "UniLM done");

    // ---- export selection: all multi-codepoint pieces plus the top
    // singles by probability ----
    let v = um.vocab_size();
    let mut export_keep = vec![false; v];
    let mut singles: Vec<(u32, f64)> = Vec::new();
    let mut multi = 0usize;
    for id in 0..v {
        if um.piece(id).len_cp >= 2 {
            export_keep[id] = true;
            multi += 1;
        } else {
            singles.push((id as u32, um.logp[id].exp()));
        }
    }
    singles.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    let mut kept_singles = 0usize;
    for &(id, _) in singles.iter().take(args.keep_single_top) {
        export_keep[id as usize] = true;
        kept_singles += 1;
    }
    info!(multi, singles = kept_singles, "export selection");

    let export_vocab = export_keep.iter().filter(|&&k| k).count();
    if export_vocab == 0 {
        bail!("nothing survived export selection");
    }
    if export_vocab > 0xFFFE {
        bail!("export vocabulary {export_vocab} exceeds the 16-bit id space");
    }

    let mut trie = DoubleArray::new(1024);
    let mut logp_uni = vec![0i16; export_vocab];
    let mut next_id = 0u16;
    for id in 0..v {
        if !export_keep[id] {
            continue;
        }
        let bytes = um.piece_bytes(id);
        trie.set_term_value(bytes, next_id)
            .context("export trie insert")?;
        logp_uni[usize::from(next_id)] = q88_from_f64(um.logp[id]);
        next_id += 1;
    }

    // ---- CRF weights: preset -> config -> supervised / pseudo-label ----
    let mut crf = CrfParams::basic_preset();
    let mut w = CrfWeights::from_params(&crf);

    if let Some(path) = &args.crf_config {
        info!(config = %path.display(), "applying CRF config");
        crf_train::apply_config_file(path, &crf, &mut w)
            .with_context(|| format!("applying {}", path.display()))?;
    }

    let train_with = |ds: &CrfDataset, w: &mut CrfWeights| -> anyhow::Result<()> {
        if args.crf_opt == "sgd" {
            crf_train::train_sgd(
                ds,
                &crf,
                w,
                &SgdOptions {
                    epochs: args.crf_epochs,
                    lr: args.crf_lr,
                    l2: args.crf_l2,
                },
            )?;
        } else {
            crf_train::train_lbfgs(
                ds,
                &crf,
                w,
                &LbfgsOptions {
                    max_iter: args.crf_epochs,
                    m: args.crf_lbfgs_m,
                    tol: args.crf_tol,
                    l2: args.crf_l2,
                },
            )?;
        }
        Ok(())
    };

    if let Some(path) = &args.crf_supervised {
        let ds = CrfDataset::from_segmented_file(path, args.max_sentence_cp, &cc)
            .with_context(|| format!("loading {}", path.display()))?;
        if ds.is_empty() {
            warn!("supervised CRF corpus has no usable sentences");
        } else {
            info!(
                sentences = ds.sentences.len(),
                positions = ds.total_pos,
                "supervised CRF training"
            );
            train_with(&ds, &mut w)?;
        }
    }

    if args.crf_unsupervised != 0 {
        info!(
            sentences = args.crf_unsup_sentences,
            "pseudo-label CRF training from LM-only Viterbi"
        );
        let mut raw = MappedLineReader::open(
            &args.corpus,
            LineReaderOptions {
                append_meta_lf: false,
                ..reader_options(args)
            },
        )?;
        let ds = CrfDataset::pseudo_labels(
            &um,
            &mut raw,
            &mut wk,
            args.max_piece_len,
            args.max_sentence_cp,
            args.crf_unsup_sentences,
            &cc,
        )?;
        if ds.is_empty() {
            warn!("pseudo-label dataset is empty");
        } else {
            train_with(&ds, &mut w)?;
        }
    }

    w.store_into(&mut crf);

    // ---- assemble and save ----
    let mut flags = cc_flag;
    if args.lossless_ws != 0 {
        flags |= FLAG_LOSSLESS_WS;
    }

    let model = Model {
        crf,
        lm: LmParams {
            trie,
            logp_uni,
            bigram_key: Vec::new(),
            logp_bi: Vec::new(),
            unk_base: q88_from_f64(args.unk_base),
            unk_per_cp: q88_from_f64(args.unk_per_cp),
        },
        lambda0: q88_from_f64(args.lambda0),
        max_word_len: args.max_piece_len as u16,
        flags,
        cc,
    };

    info!(
        vocab = export_vocab,
        features = model.crf.feat_key.len(),
        out = %args.out.display(),
        "saving model"
    );
    wakachi_core::model_io::save(&args.out, &model)
        .with_context(|| format!("saving {}", args.out.display()))?;
    info!("done");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();
    run(&args)
}
