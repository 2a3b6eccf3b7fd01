use assert_cmd::Command;
use predicates::prelude::*;

use wakachi_core::charclass::CcConfig;
use wakachi_core::crf::CrfParams;
use wakachi_core::model::{LmParams, Model, FLAG_LOSSLESS_WS};
use wakachi_core::score::q88_from_f64;
use wakachi_core::trie::DoubleArray;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Tiny model preferring the "ab" dictionary entry over characters.
fn write_model(path: &std::path::Path, flags: u32) -> TestResult {
    let mut trie = DoubleArray::new(64);
    trie.set_term_value(b"a", 0)?;
    trie.set_term_value(b"b", 1)?;
    trie.set_term_value(b"ab", 2)?;
    let model = Model {
        crf: CrfParams::default(),
        lm: LmParams {
            trie,
            logp_uni: vec![
                q88_from_f64(0.2f64.ln()),
                q88_from_f64(0.2f64.ln()),
                q88_from_f64(0.6f64.ln()),
            ],
            bigram_key: Vec::new(),
            logp_bi: Vec::new(),
            unk_base: q88_from_f64(-5.0),
            unk_per_cp: q88_from_f64(-1.0),
        },
        lambda0: q88_from_f64(1.0),
        max_word_len: 2,
        flags,
        cc: CcConfig::default(),
    };
    wakachi_core::model_io::save(path, &model)?;
    Ok(())
}

#[test]
fn tokenizes_stdin_lines() -> TestResult {
    let dir = tempfile::tempdir()?;
    let model_path = dir.path().join("model.bin");
    write_model(&model_path, 0)?;

    let mut cmd = Command::cargo_bin("wakachi")?;
    cmd.arg("--model")
        .arg(&model_path)
        .write_stdin("abab\nba\n")
        .assert()
        .success()
        .stdout(predicate::eq("ab ab\nb a\n"));
    Ok(())
}

#[test]
fn tokenizes_positional_arguments() -> TestResult {
    let dir = tempfile::tempdir()?;
    let model_path = dir.path().join("model.bin");
    write_model(&model_path, 0)?;

    let mut cmd = Command::cargo_bin("wakachi")?;
    cmd.arg("--model")
        .arg(&model_path)
        .arg("abab")
        .assert()
        .success()
        .stdout(predicate::eq("ab ab\n"));
    Ok(())
}

#[test]
fn nbest_prints_alternatives() -> TestResult {
    let dir = tempfile::tempdir()?;
    let model_path = dir.path().join("model.bin");
    write_model(&model_path, 0)?;

    let mut cmd = Command::cargo_bin("wakachi")?;
    let assert = cmd
        .arg("--model")
        .arg(&model_path)
        .arg("--nbest")
        .arg("2")
        .arg("ab")
        .assert()
        .success();
    let out = String::from_utf8(assert.get_output().stdout.clone())?;
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "ab");
    assert_eq!(lines[1], "a b");
    Ok(())
}

#[test]
fn lossless_round_trip_through_detok() -> TestResult {
    let dir = tempfile::tempdir()?;
    let model_path = dir.path().join("model.bin");
    write_model(&model_path, FLAG_LOSSLESS_WS)?;

    // Tokenize with lossless whitespace enabled (auto from the model flag).
    let mut cmd = Command::cargo_bin("wakachi")?;
    let assert = cmd
        .arg("--model")
        .arg(&model_path)
        .write_stdin("ab ab\n")
        .assert()
        .success();
    let tokens = String::from_utf8(assert.get_output().stdout.clone())?;
    // the literal space must have been replaced by a meta codepoint
    assert!(tokens.contains('\u{2581}'));

    // Detokenize restores the original line.
    let mut cmd = Command::cargo_bin("wakachi")?;
    cmd.arg("--model")
        .arg(&model_path)
        .arg("--detok")
        .write_stdin(tokens)
        .assert()
        .success()
        .stdout(predicate::eq("ab ab\n"));
    Ok(())
}

#[test]
fn missing_model_is_fatal() -> TestResult {
    let mut cmd = Command::cargo_bin("wakachi")?;
    cmd.arg("--model")
        .arg("/nonexistent/model.bin")
        .arg("ab")
        .assert()
        .failure();
    Ok(())
}
