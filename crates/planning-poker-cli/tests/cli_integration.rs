use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", ulid::Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_pp<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_pp"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute pp binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_pp(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "pp command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_failure<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_pp(args);
    assert!(
        !output.status.success(),
        "pp command unexpectedly succeeded:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn with_db<'a>(db: &'a Path, rest: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec!["--db", path_str(db), "--values", "1,2,3,5,8", "--include-unknown"];
    args.extend_from_slice(rest);
    args
}

fn vote_ids(value: &Value) -> Vec<String> {
    value
        .get("votes")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing votes array in payload: {value}"))
        .iter()
        .filter_map(|entry| {
            entry
                .get("id")
                .or_else(|| entry.pointer("/vote/id"))
                .and_then(Value::as_str)
                .map(ToString::to_string)
        })
        .collect()
}

fn cleanup(dir: &Path) {
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn schema_version_reports_contract_and_migration_plan() {
    let dir = unique_temp_dir("pp-cli-schema");
    let db = dir.join("poker.sqlite3");

    let before = run_json(with_db(&db, &["db", "schema-version"]));
    assert_eq!(before.get("contract_version").and_then(Value::as_str), Some("cli.v1"));
    assert_eq!(before.get("current_version").and_then(Value::as_i64), Some(0));
    assert_eq!(before.get("up_to_date").and_then(Value::as_bool), Some(false));

    let migrated = run_json(with_db(&db, &["db", "migrate"]));
    assert_eq!(migrated.get("after_version").and_then(Value::as_i64), Some(1));

    let after = run_json(with_db(&db, &["db", "schema-version"]));
    assert_eq!(after.get("up_to_date").and_then(Value::as_bool), Some(true));
    cleanup(&dir);
}

#[test]
fn two_participants_then_tally_matches_reference_scenario() {
    let dir = unique_temp_dir("pp-cli-scenario");
    let db = dir.join("poker.sqlite3");

    run_json(with_db(
        &db,
        &[
            "votes",
            "cast",
            "--record",
            "REC-1",
            "--participant-id",
            "a1",
            "--name",
            "A",
            "--estimate",
            "5",
        ],
    ));
    let after_b = run_json(with_db(
        &db,
        &[
            "votes",
            "cast",
            "--record",
            "REC-1",
            "--participant-id",
            "b2",
            "--name",
            "B",
            "--unknown",
        ],
    ));
    assert_eq!(vote_ids(&after_b).len(), 2);

    let tally = run_json(with_db(&db, &["tally", "--record", "REC-1"]));
    assert_eq!(tally.pointer("/summary/total_votes").and_then(Value::as_u64), Some(2));
    assert_eq!(tally.pointer("/summary/numeric_count").and_then(Value::as_u64), Some(1));
    assert_eq!(tally.pointer("/summary/min").and_then(Value::as_i64), Some(5));
    assert_eq!(tally.pointer("/summary/max").and_then(Value::as_i64), Some(5));
    assert_eq!(tally.get("average_label").and_then(Value::as_str), Some("5.0"));
    assert_eq!(vote_ids(&tally), vec!["a1".to_string(), "b2".to_string()]);
    assert_eq!(tally.pointer("/votes/0/rank").and_then(Value::as_u64), Some(3));
    assert_eq!(tally.pointer("/votes/1/rank").and_then(Value::as_u64), Some(0));
    cleanup(&dir);
}

#[test]
fn revote_replaces_and_withdraw_removes() {
    let dir = unique_temp_dir("pp-cli-revote");
    let db = dir.join("poker.sqlite3");
    let cast = |estimate: &str| {
        run_json(with_db(
            &db,
            &[
                "votes",
                "cast",
                "--record",
                "REC-2",
                "--participant-id",
                "a1",
                "--name",
                "A",
                "--estimate",
                estimate,
            ],
        ))
    };

    cast("3");
    let revoted = cast("8");
    assert_eq!(vote_ids(&revoted), vec!["a1".to_string()]);
    assert_eq!(revoted.pointer("/votes/0/estimate").and_then(Value::as_i64), Some(8));

    let withdraw = ["votes", "withdraw", "--record", "REC-2", "--participant-id", "a1"];
    let withdrawn = run_json(with_db(&db, &withdraw));
    assert!(vote_ids(&withdrawn).is_empty());

    let again = run_json(with_db(&db, &withdraw));
    assert!(vote_ids(&again).is_empty());

    let fields = run_json(with_db(&db, &["db", "fields"]));
    assert_eq!(fields.pointer("/fields/0/value"), Some(&serde_json::json!({ "REC-2": [] })));
    cleanup(&dir);
}

#[test]
fn session_hides_votes_until_reveal_and_supports_change() {
    let dir = unique_temp_dir("pp-cli-session");
    let db = dir.join("poker.sqlite3");
    let session = |participant: &str, rest: &[&str]| {
        let mut args = vec![
            "session",
            "--record",
            "REC-3",
            "--participant-id",
            participant,
            "--name",
            participant,
        ];
        args.extend_from_slice(rest);
        run_json(with_db(&db, &args))
    };

    let submitted = session("b2", &["--action", "submit", "--estimate", "2"]);
    assert_eq!(submitted.get("state").and_then(Value::as_str), Some("revealed"));

    let fresh = session("a1", &[]);
    assert_eq!(fresh.get("state").and_then(Value::as_str), Some("awaiting_vote"));
    assert!(vote_ids(&fresh).is_empty());
    assert_eq!(fresh.get("summary"), Some(&Value::Null));

    let revealed = session("a1", &["--action", "reveal"]);
    assert_eq!(vote_ids(&revealed), vec!["b2".to_string()]);
    assert_eq!(revealed.get("has_voted").and_then(Value::as_bool), Some(false));

    let returning = session("b2", &[]);
    assert_eq!(returning.get("state").and_then(Value::as_str), Some("revealed"));
    assert_eq!(returning.get("own_vote").and_then(Value::as_i64), Some(2));

    let changed = session("b2", &["--action", "change"]);
    assert_eq!(changed.get("state").and_then(Value::as_str), Some("awaiting_vote"));
    assert_eq!(changed.get("has_voted").and_then(Value::as_bool), Some(false));
    cleanup(&dir);
}

#[test]
fn non_numeric_values_fail_fast_with_configuration_error() {
    let dir = unique_temp_dir("pp-cli-config");
    let db = dir.join("poker.sqlite3");

    let stderr = run_failure([
        "--db",
        path_str(&db),
        "--values",
        "1,two,3",
        "votes",
        "show",
        "--record",
        "REC-1",
    ]);
    assert!(stderr.contains("configuration error"), "{stderr}");
    assert!(stderr.contains("`two`"), "{stderr}");
    assert!(!db.exists());
    cleanup(&dir);
}

#[test]
fn unconfigured_estimate_is_rejected() {
    let dir = unique_temp_dir("pp-cli-invalid");
    let db = dir.join("poker.sqlite3");

    let stderr = run_failure(with_db(
        &db,
        &[
            "votes",
            "cast",
            "--record",
            "REC-1",
            "--participant-id",
            "a1",
            "--name",
            "A",
            "--estimate",
            "4",
        ],
    ));
    assert!(stderr.contains("not one of the configured values"), "{stderr}");
    cleanup(&dir);
}

#[test]
fn backup_restore_and_integrity_check_round_trip() {
    let dir = unique_temp_dir("pp-cli-backup");
    let db = dir.join("poker.sqlite3");
    let backup = dir.join("backup.sqlite3");
    let restored = dir.join("restored.sqlite3");

    run_json(with_db(
        &db,
        &[
            "votes",
            "cast",
            "--record",
            "REC-4",
            "--participant-id",
            "a1",
            "--name",
            "A",
            "--estimate",
            "1",
        ],
    ));
    run_json(with_db(&db, &["db", "backup", "--out", path_str(&backup)]));

    let restore = run_json(with_db(&restored, &["db", "restore", "--in", path_str(&backup)]));
    assert_eq!(restore.get("schema_version").and_then(Value::as_i64), Some(1));

    let shown = run_json(with_db(&restored, &["votes", "show", "--record", "REC-4"]));
    assert_eq!(vote_ids(&shown), vec!["a1".to_string()]);

    let integrity = run_json(with_db(&restored, &["db", "integrity-check"]));
    assert_eq!(integrity.get("quick_check_ok").and_then(Value::as_bool), Some(true));
    assert_eq!(integrity.get("field_count").and_then(Value::as_u64), Some(1));
    cleanup(&dir);
}
