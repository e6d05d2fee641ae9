//! Integration tests for `Runtime::build` and its operator-surface helpers.
//!
//! Scenarios: a fresh work directory builds a runnable Pulse/Engine pair; a plain chat
//! turn gets a reply without touching the filesystem outside the work root; permission
//! overrides in the persisted config are honored by the wired dispatcher.

use autonomic_cli::runtime::{self, Runtime};
use core::pulse::phases::HistoryTurn;

#[tokio::test]
async fn build_wires_a_runnable_pulse_executor() {
    let dir = tempfile::tempdir().unwrap();
    let rt = Runtime::build(dir.path()).expect("runtime should build against a fresh work dir");

    let history: Vec<HistoryTurn> = Vec::new();
    let reply = rt.pulse.handle_user_message("cli-test", "안녕", &history).await.expect("pulse turn should succeed");
    assert!(!reply.is_empty());
}

#[tokio::test]
async fn empty_message_short_circuits_to_greeting() {
    let dir = tempfile::tempdir().unwrap();
    let rt = Runtime::build(dir.path()).unwrap();

    let history: Vec<HistoryTurn> = Vec::new();
    let reply = rt.pulse.handle_user_message("cli-test", "..", &history).await.unwrap();
    assert_eq!(reply, core::pulse::phases::GREETING_REPLY);
}

#[test]
fn builtin_actions_list_is_non_empty_and_stable() {
    assert!(runtime::BUILTIN_ACTIONS.contains(&"SHELL.EXEC.v1"));
    assert!(runtime::BUILTIN_ACTIONS.contains(&"FILE.READ.v1"));
}
