use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const USAGE_PAGE: &str = "Settings  Usage  Plan usage limits\n\
Current session\n45% 使用済み\n2時間30分後にリセット\n\
Weekly limits\nAll models\n10% 使用済み\n\
Opus only\n3% 使用済み\n12:59 (木)にリセット\n\
Learn more about usage limits";

fn home_path(home: &TempDir) -> &Path {
    home.path()
}

fn bin_path() -> &'static str {
    env!("CARGO_BIN_EXE_usage-overlay")
}

fn run_cmd(home: &TempDir, args: &[&str]) -> Output {
    run_cmd_with_env(home, args, &[])
}

fn run_cmd_with_env(home: &TempDir, args: &[&str], envs: &[(&str, &str)]) -> Output {
    Command::new(bin_path())
        .args(args)
        .env("USAGE_OVERLAY_HOME", home_path(home))
        .env("USAGE_OVERLAY_SESSION_KEY", "test-session")
        .envs(envs.iter().copied())
        .env_remove("RUST_LOG")
        .output()
        .expect("run usage-overlay command")
}

fn unused_local_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    format!("http://127.0.0.1:{port}/settings/usage")
}

fn write_page(home: &TempDir, text: &str) -> PathBuf {
    let path = home.path().join("page.txt");
    fs::write(&path, text).expect("write page text");
    path
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is json")
}

#[test]
fn init_creates_config_and_data_paths() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["init"]);
    assert!(output.status.success());

    assert!(home.path().join("config").exists());
    assert!(home.path().join("data").exists());
    assert!(home.path().join("config").join("config.toml").exists());
}

#[test]
fn init_keeps_existing_config() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());

    let cfg = home.path().join("config").join("config.toml");
    fs::write(&cfg, "freshness_minutes = 9\n").expect("write config");
    assert!(run_cmd(&home, &["init"]).status.success());

    let raw = fs::read_to_string(&cfg).expect("read config");
    assert_eq!(raw, "freshness_minutes = 9\n");
}

#[test]
fn extract_prints_snapshot_json() {
    let home = TempDir::new().expect("temp home");
    let page = write_page(&home, USAGE_PAGE);

    let output = run_cmd(&home, &["extract", "--file", page.to_str().expect("utf8 path")]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let json = stdout_json(&output);
    assert_eq!(json["currentSession"]["percentage"], 45);
    assert_eq!(json["currentSession"]["reset"], "2時間30分後");
    assert_eq!(json["allModels"]["percentage"], 10);
    assert_eq!(json["opusOnly"]["reset"], "12:59 (木)");
}

#[test]
fn extract_rejects_page_that_is_still_loading() {
    let home = TempDir::new().expect("temp home");
    let page = write_page(&home, "Loading...");

    let output = run_cmd(&home, &["extract", "--file", page.to_str().expect("utf8 path")]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("may not be fully loaded"));
}

#[test]
fn extract_reports_missing_usage_data() {
    let home = TempDir::new().expect("temp home");
    let page = write_page(&home, &"Account settings and billing details. ".repeat(5));

    let output = run_cmd(&home, &["extract", "--file", page.to_str().expect("utf8 path")]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("usage data not found"));
}

#[test]
fn show_reports_empty_then_stored_snapshot() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());

    let output = run_cmd(&home, &["show"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No cached usage data."));

    let page = write_page(&home, USAGE_PAGE);
    let stored = run_cmd(
        &home,
        &["extract", "--file", page.to_str().expect("utf8 path"), "--store"],
    );
    assert!(stored.status.success());

    let output = run_cmd(&home, &["show"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Current Session"));
    assert!(stdout.contains("45%"));
    assert!(stdout.contains("Opus Only"));
    assert!(!stdout.contains("(stale)"));

    let json = stdout_json(&run_cmd(&home, &["show", "--json"]));
    assert_eq!(json["usageData"]["opusOnly"]["percentage"], 3);
    assert!(json["lastUpdate"].as_i64().is_some());
}

#[test]
fn ping_message_answers_pong() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["message", r#"{"action":"ping"}"#]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout_json(&output), serde_json::json!({ "pong": true }));
}

#[test]
fn widget_visibility_persists_across_commands() {
    let home = TempDir::new().expect("temp home");

    let output = run_cmd(&home, &["message", r#"{"action":"hideWidget"}"#]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output), serde_json::json!({ "success": true }));

    let json = stdout_json(&run_cmd(&home, &["show", "--json"]));
    assert_eq!(json["widgetVisible"], false);

    let output = run_cmd(&home, &["widget", "toggle"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("visible=true"));

    let output = run_cmd(&home, &["widget", "move", "12", "3"]);
    assert!(String::from_utf8_lossy(&output.stdout).contains("position=12,3"));
}

#[test]
fn unknown_message_action_is_rejected() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["message", r#"{"action":"selfDestruct"}"#]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("error:"));
}

#[test]
fn failed_fetch_reports_the_fetch_error() {
    let home = TempDir::new().expect("temp home");
    let target = unused_local_url();

    let output = run_cmd_with_env(&home, &["fetch"], &[("USAGE_OVERLAY__TARGET_URL", target.as_str())]);
    assert!(!output.status.success());

    let json = stdout_json(&output);
    assert_eq!(json["success"], false);
    assert!(json["error"].as_str().expect("error").starts_with("could not open the usage page"));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error: could not open the usage page"));
    assert!(!stderr.contains("config error"));
}
