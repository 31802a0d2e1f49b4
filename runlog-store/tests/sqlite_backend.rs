//! SQLite backend behaviour against a real database file.

#![cfg(feature = "storage")]

mod common;

use common::init_test_logging;
use runlog_common::backend::{MessageRecord, MessageTarget};
use runlog_common::events::{StartRun, StartTestcase, UpdateRun};
use runlog_common::{MessageLevel, TestcaseResult, WriteBackend};
use runlog_store::SqliteBackend;
use tracing::info;

fn message(text: &str) -> MessageRecord {
    MessageRecord {
        message: text.to_string(),
        level: MessageLevel::Info,
        escape_html: false,
        machine_name: "ci-runner".to_string(),
        thread_name: "main".to_string(),
        timestamp: 1_000,
    }
}

fn start_run(backend: &SqliteBackend, name: &str) -> runlog_common::RunId {
    backend
        .start_run(
            &StartRun {
                run_name: name.to_string(),
                ..StartRun::default()
            },
            1,
            true,
        )
        .unwrap()
}

#[test]
fn test_full_hierarchy_persists_to_file() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runlog.db");

    let testcase_id = {
        let backend = SqliteBackend::open(&path, 100).unwrap();
        backend.sanity_check().unwrap();
        let run_id = start_run(&backend, "nightly");
        let suite_id = backend
            .start_suite("com.acme", "Checkout", 2, run_id, true)
            .unwrap();
        let testcase_id = backend
            .start_testcase(
                &StartTestcase {
                    suite_full_name: "com.acme.Checkout".into(),
                    scenario_name: "pay".into(),
                    testcase_name: "pay_with_card".into(),
                    ..StartTestcase::default()
                },
                suite_id,
                3,
                true,
            )
            .unwrap();
        backend
            .insert_message(MessageTarget::Testcase(testcase_id), &message("hello"), true)
            .unwrap();
        backend
            .end_testcase(testcase_id, TestcaseResult::Passed, 4, true)
            .unwrap();
        backend.end_suite(suite_id, 5, true).unwrap();
        backend.end_run(run_id, 6, true).unwrap();
        testcase_id
    };

    let reopened = SqliteBackend::open(&path, 100).unwrap();
    let (name, result) = reopened.testcase_row(testcase_id).unwrap();
    info!(%name, result, "reopened testcase");
    assert_eq!(name, "pay_with_card");
    assert_eq!(result, TestcaseResult::Passed.code());
    assert_eq!(
        reopened.testcase_messages(testcase_id).unwrap(),
        vec!["hello".to_string()]
    );
}

#[test]
fn test_uncommitted_writes_wait_for_flush() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batch.db");
    let backend = SqliteBackend::open(&path, 1_000).unwrap();
    let run_id = start_run(&backend, "batch");
    // A second connection only sees committed rows.
    let observer = SqliteBackend::open(&path, 1_000).unwrap();

    backend
        .insert_message(MessageTarget::Run(run_id), &message("one"), false)
        .unwrap();
    backend
        .insert_message(MessageTarget::Run(run_id), &message("two"), false)
        .unwrap();

    assert_eq!(observer.count("messages").unwrap(), 0);

    backend.flush_cache().unwrap();
    assert_eq!(observer.count("messages").unwrap(), 2);
}

#[test]
fn test_batch_commits_when_cache_is_full() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("full.db");
    let backend = SqliteBackend::open(&path, 2).unwrap();
    let run_id = start_run(&backend, "full");
    let observer = SqliteBackend::open(&path, 2).unwrap();

    backend
        .insert_message(MessageTarget::Run(run_id), &message("a"), false)
        .unwrap();
    assert_eq!(observer.count("messages").unwrap(), 0);
    backend
        .insert_message(MessageTarget::Run(run_id), &message("b"), false)
        .unwrap();
    assert_eq!(observer.count("messages").unwrap(), 2);
}

#[test]
fn test_external_delete_is_detected() {
    init_test_logging();
    let backend = SqliteBackend::open_in_memory(10).unwrap();
    let run_id = start_run(&backend, "doomed");
    let suite_id = backend.start_suite("", "s", 2, run_id, true).unwrap();

    backend.delete_run(run_id).unwrap();

    assert!(!backend.is_run_present(run_id).unwrap());
    assert!(!backend.is_suite_present(suite_id).unwrap());
    let err = backend
        .insert_message(MessageTarget::Suite(suite_id), &message("late"), true)
        .unwrap_err();
    assert!(err.is_integrity());
}

#[test]
fn test_update_run_renames() {
    init_test_logging();
    let backend = SqliteBackend::open_in_memory(10).unwrap();
    let run_id = backend
        .start_run(
            &StartRun {
                run_name: "first".into(),
                product_name: "shop".into(),
                ..StartRun::default()
            },
            1,
            true,
        )
        .unwrap();
    backend
        .update_run(run_id, &UpdateRun::rename("second"), true)
        .unwrap();
    assert_eq!(backend.run_name(run_id).unwrap(), "second");
}
