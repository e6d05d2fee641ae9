//! Integration coverage for the testable properties around storage, learning, and
//! regression-gate state (skill dedup, newline/JSON hygiene, baseline monotonicity).

use std::time::Duration;

use autonomic_core::learning::LearningRecorder;
use autonomic_core::regression::{Baseline, RegressionGate, RunResult};
use autonomic_core::storage::record::Skill;
use autonomic_core::storage::{Storage, Stream};

fn storage_in(dir: &std::path::Path) -> Storage {
    Storage::new(dir).expect("storage init")
}

#[test]
fn skill_dedup_by_code_hash() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage_in(dir.path());
    let learning = LearningRecorder::new(storage.clone());

    let code = "def add(a, b):\n    total = a + b\n    return total\n";
    let first = learning
        .record_skill("add", "python", code, "write an add helper", "ok, no errors", vec!["math".to_string()])
        .unwrap();
    assert!(first, "first recording of a novel skill should be accepted");

    let second = learning
        .record_skill("add_dup", "python", code, "same code again", "still fine", vec![])
        .unwrap();
    assert!(!second, "identical code must be rejected as a duplicate");

    let skills: Vec<Skill> = storage.read(Stream::Skills, None).unwrap();
    assert_eq!(skills.len(), 1);

    let mut hashes: Vec<&str> = skills.iter().map(|s| s.code_hash.as_str()).collect();
    hashes.sort();
    hashes.dedup();
    assert_eq!(hashes.len(), skills.len(), "no two skill records may share a code_hash");
}

#[test]
fn skill_rejected_when_too_short_or_errored() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage_in(dir.path());
    let learning = LearningRecorder::new(storage.clone());

    let one_liner = "x = 1";
    assert!(!learning.record_skill("x", "python", one_liner, "req", "ok", vec![]).unwrap());

    let erroring = "def f():\n    raise ValueError('bad')\n    return 1\n";
    assert!(!learning.record_skill("f", "python", erroring, "req", "Traceback: ValueError", vec![]).unwrap());

    let skills: Vec<Skill> = storage.read(Stream::Skills, None).unwrap();
    assert!(skills.is_empty());
}

#[test]
fn stream_survives_round_trip_with_trailing_newline_per_record() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage_in(dir.path());
    let learning = LearningRecorder::new(storage.clone());

    for i in 0..5 {
        let code = format!("def f{i}():\n    a = {i}\n    return a\n");
        learning.record_skill(&format!("f{i}"), "python", &code, "req", "ok", vec![]).unwrap();
    }

    let path = dir.path().join("memory").join("skills.jsonl");
    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.ends_with('\n'), "last line must end in a newline");
    for line in raw.lines() {
        assert!(serde_json::from_str::<serde_json::Value>(line).is_ok(), "every line must parse as JSON: {line}");
    }

    let skills: Vec<Skill> = storage.read(Stream::Skills, None).unwrap();
    assert_eq!(skills.len(), 5);
}

#[test]
fn rotate_keeps_max_records_and_archives_overflow() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage_in(dir.path());
    let learning = LearningRecorder::new(storage.clone());

    for i in 0..12 {
        let code = format!("def g{i}():\n    v = {i}\n    return v\n");
        learning.record_skill(&format!("g{i}"), "python", &code, "req", "ok", vec![]).unwrap();
    }

    let evicted = storage.rotate::<Skill>(Stream::Skills, 8, true).unwrap();
    assert_eq!(evicted, 4);

    let remaining: Vec<Skill> = storage.read(Stream::Skills, None).unwrap();
    assert_eq!(remaining.len(), 8);

    let archive_raw = std::fs::read_to_string(dir.path().join("memory").join("skills.archive.jsonl")).unwrap();
    assert_eq!(archive_raw.lines().count(), 4);
}

#[test]
fn regression_baseline_never_decreases_on_accept() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage_in(dir.path());
    let gate = RegressionGate::new(storage.clone(), dir.path().join("run_tests.sh"), Duration::from_secs(5));

    let first = gate.accept(&RunResult { pass_count: 10, fail_count: 2, total: 12, error: None }).unwrap();
    assert_eq!(first.pass_count, 10);

    let worse = gate.accept(&RunResult { pass_count: 6, fail_count: 6, total: 12, error: None }).unwrap();
    assert_eq!(worse.pass_count, 10, "a worse run must not move the baseline backward");

    let better = gate.accept(&RunResult { pass_count: 15, fail_count: 0, total: 15, error: None }).unwrap();
    assert_eq!(better.pass_count, 15);

    let persisted: Baseline = storage.read_single("regression_baseline.json").unwrap().unwrap();
    assert_eq!(persisted.pass_count, 15);
}

#[test]
fn regression_check_fails_open_on_erroring_run() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage_in(dir.path());
    let gate = RegressionGate::new(storage.clone(), dir.path().join("run_tests.sh"), Duration::from_secs(5));

    let baseline = Baseline { pass_count: 20, fail_count: 0, total: 20 };
    let errored = RunResult { pass_count: 0, fail_count: 0, total: 0, error: Some("spawn failed".to_string()) };
    assert!(gate.check(&errored, &baseline), "an infrastructure error must fail open, not block");
}
