use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("rlhf-tune").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("KL-penalised PPO fine-tuning"));
}

#[test]
fn test_cli_config_prints_defaults() {
    let mut cmd = Command::cargo_bin("rlhf-tune").unwrap();
    cmd.arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"batch_size\": 256"))
        .stdout(predicate::str::contains("\"forward_batch_size\": 16"))
        .stdout(predicate::str::contains("\"init_kl_coef\": 0.2"));
}

#[test]
fn test_cli_validate_accepts_partial_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"batch_size": 32, "forward_batch_size": 8, "steps": 64}}"#).unwrap();

    let mut cmd = Command::cargo_bin("rlhf-tune").unwrap();
    cmd.arg("validate")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK: 2 rounds of 32 rollouts"));
}

#[test]
fn test_cli_validate_rejects_indivisible_batch() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"batch_size": 30, "forward_batch_size": 8}}"#).unwrap();

    let mut cmd = Command::cargo_bin("rlhf-tune").unwrap();
    cmd.arg("validate")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("forward_batch_size"));
}

#[test]
fn test_cli_validate_missing_file() {
    let mut cmd = Command::cargo_bin("rlhf-tune").unwrap();
    cmd.arg("validate")
        .arg("/nonexistent/rlhf-config.json")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load"));
}

#[test]
fn test_cli_train_tiny_run() {
    let mut cmd = Command::cargo_bin("rlhf-tune").unwrap();
    cmd.arg("train")
        .args(["--steps", "8"])
        .args(["--batch-size", "4"])
        .args(["--forward-batch-size", "2"])
        .args(["--mini-batch-size", "2"])
        .args(["--ppo-epochs", "1"])
        .args(["--txt-in-len", "3"])
        .args(["--txt-out-len", "2"])
        .args(["--hidden-size", "8"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"rounds\": 2"))
        .stdout(predicate::str::contains("final_kl_coef"));
}

/// Word-level `tokenizer.json` covering part of the built-in corpus.
fn word_level_tokenizer_json() -> String {
    let vocab = r#"{"<unk>": 0, "this": 1, "movie": 2, "was": 3, "a": 4, "story": 5, "about": 6, "small": 7, "town": 8, "and": 9, "its": 10, "people": 11, "the": 12, "film": 13, "opens": 14, "with": 15, "long": 16, "shot": 17, "of": 18, "city": 19, "at": 20, "night": 21, "i": 22, "went": 23, "to": 24, "see": 25, "picture": 26, "my": 27, "friends": 28, "last": 29, "week": 30, "great": 31, "fun": 32, "bad": 33, "dull": 34}"#;
    format!(
        r#"{{"version": "1.0", "truncation": null, "padding": null, "added_tokens": [],
            "normalizer": null, "pre_tokenizer": {{"type": "WhitespaceSplit"}},
            "post_processor": null, "decoder": null,
            "model": {{"type": "WordLevel", "vocab": {vocab}, "unk_token": "<unk>"}}}}"#
    )
}

#[test]
fn test_cli_train_with_tokenizer_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", word_level_tokenizer_json()).unwrap();

    let mut cmd = Command::cargo_bin("rlhf-tune").unwrap();
    cmd.arg("train")
        .arg("--tokenizer")
        .arg(file.path())
        .args(["--steps", "4"])
        .args(["--batch-size", "4"])
        .args(["--forward-batch-size", "2"])
        .args(["--mini-batch-size", "2"])
        .args(["--ppo-epochs", "1"])
        .args(["--txt-in-len", "3"])
        .args(["--txt-out-len", "2"])
        .args(["--hidden-size", "8"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"rounds\": 1"));
}

#[test]
fn test_cli_train_rejects_bad_tokenizer_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "not a tokenizer").unwrap();

    let mut cmd = Command::cargo_bin("rlhf-tune").unwrap();
    cmd.arg("train")
        .arg("--tokenizer")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load"));
}
