//! wakachi-core
//!
//! Training-capable, embedded-friendly word segmentation engine for UTF-8
//! text: a two-label character-level CRF combined with a unigram dictionary
//! language model, decoded jointly over a semi-Markov lattice with Q8.8
//! fixed-point scores.
//!
//! This crate holds the complete engine; the `wakachi-cli` and
//! `wakachi-tools` crates are thin binaries on top.
//!
//! Public API:
//! - `DoubleArray` / `DoubleArrayView` - byte-keyed dictionary index
//! - `UniLm` - unigram piece model with EM + MDL training (`em` module)
//! - `Model` - decode-time model bundle (trie + LM tables + CRF weights)
//! - `decoder` - Viterbi / FFBS / N-best segmentation
//! - `crf_train` - supervised and pseudo-labelled CRF training
//! - `model_io` - versioned little-endian binary model format

pub mod charclass;
pub mod crf;
pub mod crf_train;
pub mod decoder;
pub mod em;
pub mod lbfgs;
pub mod lossless;
pub mod model;
pub mod model_io;
pub mod score;
pub mod suffix;
pub mod trie;
pub mod unilm;
pub mod utf8;

pub use charclass::{CcConfig, CcMode, CcRange};
pub use crf::CrfParams;
pub use decoder::Workspace;
pub use em::{EmStats, SentenceStream, SliceCorpus, TrainConfig};
pub use model::{LmParams, Model};
pub use score::Score;
pub use trie::{DaRead, DoubleArray, DoubleArrayView};
pub use unilm::UniLm;

/// Error kinds surfaced by the engine. Every failure is a distinct,
/// matchable kind; the core never panics on malformed input or model data.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller passed something out of contract (empty key, zero sizes, ...).
    #[error("bad argument: {0}")]
    BadArgument(&'static str),

    /// Bounded storage is exhausted (fixed-capacity trie, id space, ...).
    /// The caller must enlarge the buffer or reduce the vocabulary.
    #[error("storage full: {0}")]
    Full(&'static str),

    /// Invalid UTF-8 on the decode path. The training side substitutes a
    /// fallback codepoint instead of surfacing this.
    #[error("invalid UTF-8 input")]
    Utf8,

    /// The UniLM lattice has no covering tokenization (missing single
    /// codepoint pieces).
    #[error("no covering tokenization for sentence")]
    NoCoverage,

    /// The sentence has more codepoints than the workspace was sized for.
    /// Retry with a larger `max_n_cp`.
    #[error("codepoint offset table overflow (workspace too small)")]
    CpOffsetOverflow,

    /// A model file failed validation. Fatal for load.
    #[error("invalid model: {0}")]
    ModelInvalid(String),

    /// A text input file (cc_ranges, CRF config, segmented corpus) failed
    /// to parse.
    #[error("parse error: {0}")]
    Parse(String),

    /// A back-pointer, trie or boundary invariant was violated. Fatal bug.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
