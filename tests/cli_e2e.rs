//! End-to-end CLI tests for the chapterdl binary.

use std::fs;

use assert_cmd::Command;
use assert_cmd::assert::OutputAssertExt;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

/// Binary with its config lookup pointed at an empty directory.
fn chapterdl(config_home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("chapterdl").unwrap();
    cmd.env("XDG_CONFIG_HOME", config_home.path())
        .env("HOME", config_home.path())
        .env_remove("RUST_LOG");
    cmd
}

/// Test that the binary can be invoked without input and exits with code 0.
#[test]
fn test_binary_invocation_returns_zero() {
    let home = TempDir::new().unwrap();
    chapterdl(&home)
        .assert()
        .success()
        .stderr(predicate::str::contains("No input provided"));
}

/// Test that --help displays usage information and exits with code 0.
#[test]
fn test_binary_help_displays_usage() {
    let home = TempDir::new().unwrap();
    chapterdl(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Download chapters"))
        .stdout(predicate::str::contains("--page-workers"));
}

/// Test that --version displays version and exits with code 0.
#[test]
fn test_binary_version_displays_version() {
    let home = TempDir::new().unwrap();
    chapterdl(&home)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("chapterdl"));
}

/// Test that invalid flags cause non-zero exit.
#[test]
fn test_binary_invalid_flag_returns_error() {
    let home = TempDir::new().unwrap();
    chapterdl(&home)
        .arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_binary_rejects_out_of_range_workers() {
    let home = TempDir::new().unwrap();
    chapterdl(&home)
        .args(["-j", "11"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("11"));
    chapterdl(&home)
        .args(["--page-workers", "0"])
        .assert()
        .failure();
}

#[test]
fn test_binary_quiet_and_verbose_flags_accepted() {
    let home = TempDir::new().unwrap();
    chapterdl(&home).arg("-q").assert().success();
    chapterdl(&home).arg("-vv").assert().success();
}

#[test]
fn test_binary_stdin_with_only_comments_is_no_input() {
    let home = TempDir::new().unwrap();
    chapterdl(&home)
        .write_stdin("# nothing yet\n\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("No input provided"));
}

#[test]
fn test_binary_invalid_config_file_fails() {
    let home = TempDir::new().unwrap();
    let dir = home.path().join("chapterdl");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("config.toml"), "jobs = 99\n").unwrap();

    chapterdl(&home)
        .assert()
        .failure()
        .stderr(predicate::str::contains("jobs"));
}

#[test]
fn test_binary_unsupported_url_reports_failure() {
    let home = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    chapterdl(&home)
        .arg("-o")
        .arg(out.path())
        .arg("https://site.test/reader/chapter-1")
        .assert()
        .failure()
        .stdout(predicate::str::contains("[failed]"))
        .stdout(predicate::str::contains("no_parser_available"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_binary_downloads_manifest_chapter() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/series/1.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "title": "Series",
            "chapter": "1",
            "images": ["p1.jpg", "p2.jpg"]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/series/p1.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"one".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/series/p2.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"two".to_vec()))
        .mount(&server)
        .await;

    let home = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let url = format!("{}/series/1.json", server.uri());
    let mut cmd = chapterdl(&home);
    cmd.arg("-o").arg(out.path()).args(["-l", "0"]).arg(&url);

    let output = tokio::task::spawn_blocking(move || cmd.output())
        .await
        .unwrap()
        .unwrap();
    output
        .assert()
        .success()
        .stdout(predicate::str::contains("[done] Series - 1 ->"));

    let chapter = out.path().join("Series - 1");
    assert!(chapter.join("Series - 1.cbz").is_file());
    assert_eq!(fs::read(chapter.join("001.jpg")).unwrap(), b"one");
}
