// Configuration layering and validation

use std::io::Write;
use std::path::PathBuf;

use crate::config::{CliOverrides, EvalConfig, TruncationMode, DEFAULT_RESULTS_REPO};
use crate::errors::EvalError;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = EvalConfig::load(&dir.path().join("absent.toml"), &CliOverrides::default()).unwrap();

    assert_eq!(config.chat_template, "tulu");
    assert_eq!(config.batch_size, 64);
    assert_eq!(config.results_repo, DEFAULT_RESULTS_REPO);
    assert_eq!(config.truncation_mode, TruncationMode::KeepEnd);
    assert!(!config.pref_sets);
    assert_eq!(config.dataset_source().repo_id, "allenai/rm-eval-completions");
}

#[test]
fn file_values_apply_and_cli_wins() {
    let file = write_config(
        r#"
model = "org/file-policy"
ref_model = "org/file-ref"
batch_size = 16
chat_template = "chatml"
truncation_mode = "keep_start"
"#,
    );
    let overrides = CliOverrides {
        batch_size: Some(4),
        output_path: Some(PathBuf::from("out/scores.json")),
        ..CliOverrides::default()
    };

    let config = EvalConfig::load(file.path(), &overrides).unwrap();
    assert_eq!(config.model, "org/file-policy");
    assert_eq!(config.ref_model, "org/file-ref");
    assert_eq!(config.chat_template, "chatml");
    assert_eq!(config.batch_size, 4);
    assert_eq!(config.output_path, PathBuf::from("out/scores.json"));
    assert_eq!(config.truncation_mode, TruncationMode::KeepStart);
}

#[test]
fn tokenizer_defaults_to_policy_model() {
    let mut config = EvalConfig::default();
    assert_eq!(config.tokenizer_path(), config.model);
    config.tokenizer = Some("org/tok".into());
    assert_eq!(config.tokenizer_path(), "org/tok");
}

#[test]
fn pref_sets_switch_dataset_source() {
    let config = EvalConfig {
        pref_sets: true,
        ..EvalConfig::default()
    };
    let source = config.dataset_source();
    assert_eq!(source.repo_id, "allenai/pref-test-sets");
    assert_eq!(source.files.len(), 10);
    for split in ["anthropic_hhh", "mtbench_gpt4", "mtbench_human", "pku_safer"] {
        assert!(source.files.iter().any(|f| f.subset.as_deref() == Some(split)));
    }
    assert!(source
        .files
        .iter()
        .all(|f| f.subset.as_deref().is_some_and(|s| f.path.contains(s))));
}

#[test]
fn local_dataset_source_from_file() {
    let file = write_config(
        r#"
[core_set]
repo_id = "local"
local_dir = "/data/prefs"

[[core_set.files]]
path = "pairs.jsonl"
"#,
    );
    let config = EvalConfig::load(file.path(), &CliOverrides::default()).unwrap();
    assert_eq!(config.core_set.local_dir, Some(PathBuf::from("/data/prefs")));
    assert_eq!(config.core_set.revision, "main");
    assert_eq!(config.core_set.files.len(), 1);
    assert_eq!(config.core_set.files[0].path, "pairs.jsonl");
}

#[test]
fn zero_batch_size_is_rejected() {
    let overrides = CliOverrides {
        batch_size: Some(0),
        ..CliOverrides::default()
    };
    let dir = tempfile::tempdir().unwrap();
    let err = EvalConfig::load(&dir.path().join("absent.toml"), &overrides).unwrap_err();
    assert!(matches!(err, EvalError::Validation { ref field, .. } if field == "batch_size"));
}

#[test]
fn prompt_budget_must_leave_room_for_answers() {
    let config = EvalConfig {
        max_length: 128,
        max_prompt_length: 128,
        ..EvalConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn empty_results_repo_only_matters_when_uploading() {
    let mut config = EvalConfig {
        results_repo: String::new(),
        ..EvalConfig::default()
    };
    assert!(config.validate().is_err());
    config.do_not_save = true;
    assert!(config.validate().is_ok());
}

#[test]
fn rendered_config_loads_back_with_token_redacted() {
    let config = EvalConfig {
        model: "org/policy".into(),
        hf_token: Some("hf_secret".into()),
        pref_sets: true,
        ..EvalConfig::default()
    };
    let rendered = config.to_toml().unwrap();
    assert!(!rendered.contains("hf_secret"));

    let file = write_config(&rendered);
    let loaded = EvalConfig::load(file.path(), &CliOverrides::default()).unwrap();
    assert_eq!(loaded.model, "org/policy");
    assert!(loaded.pref_sets);
    assert_eq!(loaded.pref_sets_source, config.pref_sets_source);
}
