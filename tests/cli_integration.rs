// CLI integration tests for record read/write/watch flows.
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_livedoc");
    Command::new(exe)
}

fn run(dir: &Path, args: &[&str]) -> Output {
    cmd()
        .arg("--dir")
        .arg(dir)
        .args(args)
        .output()
        .expect("spawn livedoc")
}

fn parse_json(value: &str) -> Value {
    serde_json::from_str(value).expect("valid json")
}

fn stdout_json(output: &Output) -> Value {
    parse_json(std::str::from_utf8(&output.stdout).expect("utf8"))
}

fn stderr_json(output: &Output) -> Value {
    let text = String::from_utf8_lossy(&output.stderr);
    let line = text
        .lines()
        .find(|line| line.starts_with('{'))
        .expect("json error line");
    parse_json(line)
}

#[test]
fn create_get_update_remove_flow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("stores");

    let create = run(
        &dir,
        &["--as", "alice", "create", "posts", r#"{"title":"hello","slug":"hello"}"#],
    );
    assert!(create.status.success(), "{create:?}");
    let created = stdout_json(&create);
    assert_eq!(created["collection"], "posts");
    let id = created["id"].as_str().expect("id").to_string();
    assert_eq!(id.len(), 20);

    let get = run(&dir, &["--as", "alice", "get", "posts", &id]);
    assert!(get.status.success());
    let state = stdout_json(&get);
    assert_eq!(state["exists"], true);
    assert_eq!(state["id"], id.as_str());
    assert_eq!(state["slug"], "hello");
    assert_eq!(state["owned"], true);
    assert_eq!(state["loading"], false);
    assert_eq!(state["doc"]["createdBy"], "alice");
    assert_eq!(state["doc"]["updatedBy"], "alice");
    assert!(state["doc"]["createdAt"].as_u64().is_some());

    let as_bob = run(&dir, &["--as", "bob", "get", "posts", &id]);
    assert_eq!(stdout_json(&as_bob)["owned"], false);

    let update = run(&dir, &["--as", "bob", "update", "posts", &id, r#"{"title":"edited"}"#]);
    assert!(update.status.success());
    let after = stdout_json(&run(&dir, &["get", "posts", &id]));
    assert_eq!(after["doc"]["title"], "edited");
    assert_eq!(after["doc"]["createdBy"], "alice");
    assert_eq!(after["doc"]["updatedBy"], "bob");
    assert_eq!(after["owned"], false);

    let remove = run(&dir, &["remove", "posts", &id]);
    assert!(remove.status.success());
    assert_eq!(stdout_json(&remove)["removed"], true);

    let gone = stdout_json(&run(&dir, &["get", "posts", &id]));
    assert_eq!(gone["exists"], false);
    assert_eq!(gone["doc"], serde_json::json!({}));
    assert_eq!(gone["id"], id.as_str());
}

#[test]
fn find_and_list_filter_by_field() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("stores");

    for (user, slug) in [("alice", "first"), ("bob", "second"), ("alice", "third")] {
        let data = format!(r#"{{"slug":"{slug}"}}"#);
        let out = run(&dir, &["--as", user, "create", "posts", &data]);
        assert!(out.status.success());
    }

    let found = stdout_json(&run(&dir, &["find", "posts", "slug", "second"]));
    assert_eq!(found["exists"], true);
    assert_eq!(found["slug"], "second");
    assert_eq!(found["doc"]["createdBy"], "bob");

    let none = stdout_json(&run(&dir, &["find", "posts", "slug", "\"missing\""]));
    assert_eq!(none["exists"], false);
    assert_eq!(none["doc"], serde_json::json!({}));

    let all = stdout_json(&run(&dir, &["list", "posts"]));
    assert_eq!(all["count"], 3);
    assert_eq!(all["exists"], true);

    let mine = stdout_json(&run(&dir, &["list", "posts", "--where", r#"createdBy="alice""#]));
    assert_eq!(mine["count"], 2);
    for entry in mine["docs"].as_array().expect("docs") {
        assert_eq!(entry["doc"]["createdBy"], "alice");
    }

    let empty = stdout_json(&run(&dir, &["list", "drafts"]));
    assert_eq!(empty["count"], 0);
    assert_eq!(empty["exists"], false);
}

#[test]
fn set_replaces_and_stamps_updater() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("stores");

    let set = run(&dir, &["--as", "carol", "set", "profiles", "carol", r#"{"name":"Carol"}"#]);
    assert!(set.status.success());
    let state = stdout_json(&run(&dir, &["get", "profiles", "carol"]));
    assert_eq!(state["doc"]["name"], "Carol");
    assert_eq!(state["doc"]["updatedBy"], "carol");
    assert!(state["doc"].get("createdBy").is_none());

    let replace = run(&dir, &["--as", "dave", "set", "profiles", "carol", r#"{"nick":"C"}"#]);
    assert!(replace.status.success());
    let state = stdout_json(&run(&dir, &["get", "profiles", "carol"]));
    assert!(state["doc"].get("name").is_none());
    assert_eq!(state["doc"]["nick"], "C");
    assert_eq!(state["doc"]["updatedBy"], "dave");
}

#[test]
fn anonymous_identity_can_create() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("stores");

    let create = run(&dir, &["--anonymous", "create", "notes", r#"{"text":"hi"}"#]);
    assert!(create.status.success());
    let id = stdout_json(&create)["id"].as_str().expect("id").to_string();

    let state = stdout_json(&run(&dir, &["get", "notes", &id]));
    let creator = state["doc"]["createdBy"].as_str().expect("createdBy");
    assert!(!creator.is_empty());
}

#[test]
fn writes_without_identity_fail_unauthenticated() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("stores");

    let create = run(&dir, &["create", "posts", r#"{"title":"x"}"#]);
    assert_eq!(create.status.code(), Some(6));
    let err = stderr_json(&create);
    assert_eq!(err["error"]["kind"], "Unauthenticated");
    assert!(err["error"]["hint"].as_str().expect("hint").contains("--as"));

    let list = stdout_json(&run(&dir, &["list", "posts"]));
    assert_eq!(list["count"], 0);
}

#[test]
fn update_missing_record_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("stores");

    let update = run(&dir, &["--as", "alice", "update", "posts", "nope", r#"{"a":1}"#]);
    assert_eq!(update.status.code(), Some(3));
    assert_eq!(stderr_json(&update)["error"]["kind"], "NotFound");
}

#[test]
fn invalid_data_is_a_usage_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("stores");

    let bad = run(&dir, &["--as", "alice", "create", "posts", "{not json"]);
    assert_eq!(bad.status.code(), Some(2));
    assert_eq!(stderr_json(&bad)["error"]["kind"], "Usage");

    let array = run(&dir, &["--as", "alice", "create", "posts", "[1,2]"]);
    assert_eq!(array.status.code(), Some(2));

    let bad_name = run(&dir, &["get", "a/b", "x"]);
    assert_eq!(bad_name.status.code(), Some(2));
}

#[test]
fn corrupt_collection_reports_corrupt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("stores");
    std::fs::create_dir_all(&dir).expect("mkdir");
    std::fs::write(dir.join("posts.json"), b"not json").expect("write");

    let get = run(&dir, &["get", "posts", "a"]);
    assert_eq!(get.status.code(), Some(10));
    let err = stderr_json(&get);
    assert_eq!(err["error"]["kind"], "Corrupt");
    assert!(err["error"]["hint"].as_str().is_some());
}

#[test]
fn watch_emits_jsonl_with_time() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("stores");

    let set = run(&dir, &["--as", "alice", "set", "posts", "p1", r#"{"slug":"live"}"#]);
    assert!(set.status.success());

    let watch = run(
        &dir,
        &["--as", "alice", "watch", "posts", "p1", "--max", "1", "--timeout-ms", "5000"],
    );
    assert!(watch.status.success());
    let text = String::from_utf8_lossy(&watch.stdout);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1);
    let line = parse_json(lines[0]);
    assert_eq!(line["exists"], true);
    assert_eq!(line["slug"], "live");
    assert_eq!(line["owned"], true);
    assert!(line["time"].as_str().expect("time").contains('T'));
}

#[test]
fn watch_stops_at_timeout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("stores");

    let watch = run(&dir, &["watch", "posts", "ghost", "--timeout-ms", "300"]);
    assert!(watch.status.success());
    let text = String::from_utf8_lossy(&watch.stdout);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1);
    let line = parse_json(lines[0]);
    assert_eq!(line["exists"], false);
    assert_eq!(line["id"], Value::Null);
}

#[test]
fn completion_prints_script() {
    let out = cmd().args(["completion", "bash"]).output().expect("completion");
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("livedoc"));
}

#[test]
fn unknown_flag_is_usage_error() {
    let out = cmd().args(["get", "--bogus"]).output().expect("run");
    assert_eq!(out.status.code(), Some(2));
    assert_eq!(stderr_json(&out)["error"]["kind"], "Usage");
}
