use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// The binary with no settings files or model variables in reach
fn grove(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("grove").unwrap();
    cmd.env_clear()
        .env("HOME", dir.path())
        .env("XDG_CONFIG_HOME", dir.path())
        .current_dir(dir.path());
    cmd
}

#[test]
fn test_help_lists_flags() {
    let dir = TempDir::new().unwrap();
    grove(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--training-route"))
        .stdout(predicate::str::contains("--branch-init"))
        .stdout(predicate::str::contains("tools"));
}

#[test]
fn test_tools_lists_builtin_tools() {
    let dir = TempDir::new().unwrap();
    grove(&dir)
        .arg("tools")
        .assert()
        .success()
        .stdout(predicate::str::contains("query"))
        .stdout(predicate::str::contains("aggregate"))
        .stdout(predicate::str::contains("summarize"))
        .stdout(predicate::str::contains("text_response"));
}

#[test]
fn test_prompt_without_model_fails() {
    let dir = TempDir::new().unwrap();
    grove(&dir)
        .arg("What is in my data?")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No base model configured"));
}

#[test]
fn test_unknown_branch_initialisation_fails() {
    let dir = TempDir::new().unwrap();
    grove(&dir)
        .args([
            "--base-model",
            "gpt-4o-mini",
            "--base-provider",
            "openai",
            "--branch-init",
            "forest",
            "hello",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("forest"));
}

#[test]
fn test_settings_file_in_working_directory_is_used() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("grove.json"),
        r#"{"base_model": "llama3", "base_provider": "ollama"}"#,
    )
    .unwrap();

    // the file is found, and the ollama pair is rejected without an API base
    grove(&dir)
        .args(["--base-model", "llama3.1", "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("MODEL_API_BASE"));
}
