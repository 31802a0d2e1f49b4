//! End-to-end behaviour of the pipeline: producers, queues, workers and the
//! in-memory store together.

mod common;

use common::init_test_logging;
use crossbeam::channel::{Receiver, Sender, bounded};
use proptest::prelude::*;
use runlog::queue::QueuedEvent;
use runlog::{AwaitOutcome, ChannelQueue, EventPipeline, ProcessorListener, RelayAdapter};
use runlog_common::events::{JoinTestcase, StartRun, StartSuite, StartTestcase, UpdateSuite};
use runlog_common::{
    BackendError, ChannelId, ErrorCode, Event, EventOutcome, EventRecord, LifeCycleState,
    MessageLevel, MessageTarget, PipelineConfig, PipelineError, RelayEnvelope, RelayReply, RunId,
    TestcaseResult, TimeoutClass, now_millis,
};
use runlog_store::{BackendOp, MemoryBackend};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

// ── Helpers ─────────────────────────────────────────────────────────────────

fn pipeline(config: PipelineConfig) -> (Arc<MemoryBackend>, EventPipeline) {
    let backend = Arc::new(MemoryBackend::new());
    let pipeline = EventPipeline::new(backend.clone(), config);
    (backend, pipeline)
}

fn start_run(name: &str) -> Event {
    Event::StartRun(StartRun {
        run_name: name.to_string(),
        ..StartRun::default()
    })
}

fn start_suite(name: &str) -> Event {
    Event::StartSuite(StartSuite {
        suite_name: name.to_string(),
        package_name: "com.acme".to_string(),
    })
}

fn start_testcase(name: &str) -> Event {
    Event::StartTestcase(StartTestcase {
        suite_full_name: "com.acme.Checkout".to_string(),
        scenario_name: "checkout".to_string(),
        testcase_name: name.to_string(),
        ..StartTestcase::default()
    })
}

fn completed(outcome: AwaitOutcome) -> EventOutcome {
    match outcome {
        AwaitOutcome::Completed(outcome) => outcome,
        AwaitOutcome::TimedOut => panic!("event not processed in time"),
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Holds the worker inside START_RUN until released.
struct Gate {
    entered: Sender<()>,
    release: Receiver<()>,
}

impl ProcessorListener for Gate {
    fn on_run_started(&self, _run_id: RunId) {
        let _ = self.entered.send(());
        let _ = self.release.recv_timeout(Duration::from_secs(5));
    }
}

// ── Ordering ────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_messages_are_stored_in_submission_order(texts in prop::collection::vec("[a-z]{1,12}", 1..60)) {
        let (backend, pipeline) = pipeline(PipelineConfig::default());
        let id = ChannelId::new("ordered");
        pipeline.submit_and_await(&id, start_run("r"), TimeoutClass::Long).unwrap();

        for text in &texts {
            pipeline.submit(&id, Event::message(MessageLevel::Info, text.clone())).unwrap();
        }
        pipeline.close();

        let stored: Vec<String> = backend
            .messages()
            .into_iter()
            .map(|(_, record)| record.message)
            .collect();
        prop_assert_eq!(stored, texts);
    }
}

// ── Backpressure ────────────────────────────────────────────────────────────

#[test]
fn test_full_queue_rejects_and_worker_catches_up() {
    init_test_logging();
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let backend = Arc::new(MemoryBackend::new());
    let pipeline = EventPipeline::new(
        backend.clone(),
        PipelineConfig::default().with_queue_capacity(2),
    )
    .with_listener(Arc::new(Gate {
        entered: entered_tx,
        release: release_rx,
    }));
    let id = ChannelId::new("narrow");

    pipeline.submit(&id, start_run("r")).unwrap();
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    pipeline.submit(&id, Event::message(MessageLevel::Info, "one")).unwrap();
    pipeline.submit(&id, Event::message(MessageLevel::Info, "two")).unwrap();
    let err = pipeline
        .submit(&id, Event::message(MessageLevel::Info, "three"))
        .unwrap_err();
    assert_eq!(
        err,
        PipelineError::CapacityExceeded {
            channel: id.clone(),
            capacity: 2
        }
    );
    assert_eq!(err.code(), ErrorCode::CapacityExceeded);
    assert_eq!(pipeline.channel_state(&id).unwrap().pending_events, 2);

    release_tx.send(()).unwrap();
    assert!(wait_until(|| pipeline.channel_state(&id).unwrap().pending_events == 0));
    pipeline.submit(&id, Event::message(MessageLevel::Info, "four")).unwrap();
    pipeline.close();

    let stored: Vec<String> = backend
        .messages()
        .into_iter()
        .map(|(_, record)| record.message)
        .collect();
    assert_eq!(stored, vec!["one", "two", "four"]);
}

#[test]
fn test_third_start_rejected_by_two_slot_queue() {
    let queue = ChannelQueue::new(ChannelId::new("pair"), 2);
    let queued = |event: Event| QueuedEvent::new(EventRecord::new("main", event));

    queue.try_enqueue(queued(start_run("r"))).unwrap();
    queue.try_enqueue(queued(start_suite("s"))).unwrap();
    let started = Instant::now();
    let err = queue.try_enqueue(queued(start_testcase("t"))).unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(err.code(), ErrorCode::CapacityExceeded);
    assert!(err.to_string().contains("check DB connectivity"));
}

// ── Life cycle ──────────────────────────────────────────────────────────────

#[test]
fn test_full_hierarchy_returns_to_initialized() {
    init_test_logging();
    let (backend, pipeline) = pipeline(PipelineConfig::default());
    let id = ChannelId::new("main");

    let run = completed(pipeline.submit_and_await(&id, start_run("nightly"), TimeoutClass::Long).unwrap());
    let suite = completed(
        pipeline
            .submit_and_await(&id, start_suite("Checkout"), TimeoutClass::Standard)
            .unwrap(),
    );
    let testcase = completed(
        pipeline
            .submit_and_await(&id, start_testcase("pay"), TimeoutClass::Standard)
            .unwrap(),
    );
    assert_eq!(testcase.run_id, run.run_id);
    assert_eq!(testcase.suite_id, suite.suite_id);

    pipeline
        .submit(&id, Event::message(MessageLevel::Warn, "slow response"))
        .unwrap();
    pipeline
        .submit_and_await(
            &id,
            Event::EndTestcase {
                result: TestcaseResult::Passed,
            },
            TimeoutClass::Standard,
        )
        .unwrap();
    pipeline.submit(&id, Event::EndSuite).unwrap();
    pipeline
        .submit_and_await(&id, Event::EndRun, TimeoutClass::Long)
        .unwrap();

    let state = pipeline.channel_state(&id).unwrap();
    assert_eq!(state.life_cycle_state, LifeCycleState::Initialized);
    assert_eq!(state.last_executed_testcase_id, testcase.testcase_id);

    let testcase_id = testcase.testcase_id.unwrap();
    let row = backend.testcase(testcase_id).unwrap();
    assert_eq!(row.result, TestcaseResult::Passed);
    assert!(row.end_timestamp.is_some());
    let messages = backend.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, MessageTarget::Testcase(testcase_id));
    info!(?state, "hierarchy closed");
}

#[test]
fn test_out_of_order_event_is_rejected_and_state_kept() {
    init_test_logging();
    let (backend, pipeline) = pipeline(PipelineConfig::default());
    let id = ChannelId::new("main");
    pipeline
        .submit_and_await(&id, start_run("r"), TimeoutClass::Long)
        .unwrap();

    let err = pipeline
        .submit_and_await(
            &id,
            Event::EndTestcase {
                result: TestcaseResult::Passed,
            },
            TimeoutClass::Standard,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::StateViolation {
            state: LifeCycleState::RunStarted,
            ..
        }
    ));
    assert_eq!(
        pipeline.channel_state(&id).unwrap().life_cycle_state,
        LifeCycleState::RunStarted
    );
    assert_eq!(backend.call_count(BackendOp::EndTestcase), 0);
}

#[test]
fn test_early_suite_update_applies_after_start() {
    init_test_logging();
    let (backend, pipeline) = pipeline(PipelineConfig::default());
    let id = ChannelId::new("main");
    pipeline
        .submit_and_await(&id, start_run("r"), TimeoutClass::Long)
        .unwrap();

    pipeline
        .submit(
            &id,
            Event::UpdateSuite(UpdateSuite {
                user_note: Some("flaky".to_string()),
                ..UpdateSuite::default()
            }),
        )
        .unwrap();
    let suite = completed(
        pipeline
            .submit_and_await(&id, start_suite("Checkout"), TimeoutClass::Standard)
            .unwrap(),
    );

    let row = backend.suite(suite.suite_id.unwrap()).unwrap();
    assert_eq!(row.user_note.as_deref(), Some("flaky"));
    assert_eq!(row.suite_name, "Checkout");
}

// ── Deletion ────────────────────────────────────────────────────────────────

#[test]
fn test_deleted_testcase_swallows_later_events() {
    init_test_logging();
    let (backend, pipeline) = pipeline(PipelineConfig::default());
    let id = ChannelId::new("main");
    pipeline
        .submit_and_await(&id, start_run("r"), TimeoutClass::Long)
        .unwrap();
    pipeline
        .submit_and_await(&id, start_suite("s"), TimeoutClass::Standard)
        .unwrap();
    let testcase = completed(
        pipeline
            .submit_and_await(&id, start_testcase("t"), TimeoutClass::Standard)
            .unwrap(),
    );
    let testcase_id = testcase.testcase_id.unwrap();

    pipeline
        .submit(&id, Event::DeleteTestcase { testcase_id })
        .unwrap();
    for i in 0..5 {
        pipeline
            .submit(&id, Event::message(MessageLevel::Info, format!("m{i}")))
            .unwrap();
    }
    pipeline
        .submit_and_await(
            &id,
            Event::EndTestcase {
                result: TestcaseResult::Failed,
            },
            TimeoutClass::Standard,
        )
        .unwrap();

    assert!(backend.testcase(testcase_id).is_none());
    assert_eq!(backend.call_count(BackendOp::InsertMessage), 0);
    assert_eq!(backend.call_count(BackendOp::EndTestcase), 0);
    assert_eq!(
        pipeline.channel_state(&id).unwrap().life_cycle_state,
        LifeCycleState::SuiteStarted
    );
    assert!(pipeline.take_last_error(&id).is_none());
}

// ── Critical failures ───────────────────────────────────────────────────────

#[test]
fn test_awaited_start_reraises_backend_failure() {
    init_test_logging();
    let (backend, pipeline) = pipeline(PipelineConfig::default());
    let id = ChannelId::new("main");
    pipeline
        .submit_and_await(&id, start_run("r"), TimeoutClass::Long)
        .unwrap();
    pipeline
        .submit_and_await(&id, start_suite("s"), TimeoutClass::Standard)
        .unwrap();

    backend.fail_next(
        BackendOp::StartTestcase,
        BackendError::Database("disk I/O error".into()),
    );
    let err = pipeline
        .submit_and_await(&id, start_testcase("t"), TimeoutClass::Standard)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Persistence);
    assert!(err.to_string().contains("disk I/O error"));

    // The next attempt goes through; nothing was left behind for later.
    assert!(pipeline.take_last_error(&id).is_none());
    let retry = completed(
        pipeline
            .submit_and_await(&id, start_testcase("t"), TimeoutClass::Standard)
            .unwrap(),
    );
    assert!(retry.testcase_id.is_some());
}

#[test]
fn test_unawaited_critical_failure_is_kept() {
    init_test_logging();
    let (backend, pipeline) = pipeline(PipelineConfig::default());
    let id = ChannelId::new("main");
    backend.fail_next(
        BackendOp::StartRun,
        BackendError::Database("locked".into()),
    );

    pipeline.submit(&id, start_run("r")).unwrap();

    let mut kept = None;
    assert!(wait_until(|| {
        kept = kept.take().or_else(|| pipeline.take_last_error(&id));
        kept.is_some()
    }));
    assert_eq!(kept.unwrap().code(), ErrorCode::Persistence);
    assert!(pipeline.take_last_error(&id).is_none());
}

// ── Clock offset ────────────────────────────────────────────────────────────

#[test]
fn test_offset_shifts_relayed_timestamps() {
    init_test_logging();
    let (backend, pipeline) = pipeline(PipelineConfig::default());
    let id = ChannelId::new("agent");
    let channel = pipeline.channel(&id);

    assert_eq!(channel.handshake_at(10_000, 10_500), 500);
    channel
        .submit_record_and_await(
            EventRecord::with_timestamp("vu-1", start_run("remote"), 20_000),
            TimeoutClass::Long,
        )
        .unwrap();
    channel
        .submit_record(EventRecord::with_timestamp(
            "vu-1",
            Event::message(MessageLevel::Info, "hello"),
            21_000,
        ))
        .unwrap();
    pipeline.close();

    let messages = backend.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].1.timestamp, 21_500);
    assert_eq!(messages[0].1.thread_name, "vu-1");
}

// ── Relay and worker restart ────────────────────────────────────────────────

#[test]
fn test_remote_agent_joins_twice_through_relay() {
    init_test_logging();
    let backend = Arc::new(MemoryBackend::new());
    let pipeline = Arc::new(EventPipeline::new(
        backend.clone(),
        PipelineConfig::default().with_main_channel("main"),
    ));
    let relay = RelayAdapter::new(pipeline.clone());
    let main = ChannelId::new("main");
    let agent = ChannelId::new("agent-7");

    let run = completed(pipeline.submit_and_await(&main, start_run("dist"), TimeoutClass::Long).unwrap());
    let suite = completed(
        pipeline
            .submit_and_await(&main, start_suite("s"), TimeoutClass::Standard)
            .unwrap(),
    );
    let testcase = completed(
        pipeline
            .submit_and_await(&main, start_testcase("load"), TimeoutClass::Standard)
            .unwrap(),
    );
    let join = Event::JoinTestcase(JoinTestcase {
        run_id: run.run_id.unwrap(),
        suite_id: suite.suite_id.unwrap(),
        testcase_id: testcase.testcase_id.unwrap(),
    });
    let envelope = |event: Event| RelayEnvelope {
        caller: agent.clone(),
        thread_name: Some("vu-3".into()),
        sender_timestamp: now_millis(),
        event,
    };

    for round in 0..2 {
        assert_eq!(relay.handle(envelope(join.clone())), RelayReply::Accepted);
        assert_eq!(
            relay.handle(envelope(Event::message(
                MessageLevel::Info,
                format!("round {round}")
            ))),
            RelayReply::Accepted
        );
        assert_eq!(relay.handle(envelope(Event::LeaveTestcase)), RelayReply::Accepted);

        let channel = pipeline.channel(&agent);
        assert!(wait_until(|| !channel.is_worker_running()));
        assert_eq!(
            channel.state().life_cycle_state,
            LifeCycleState::Initialized
        );
    }

    // The main channel keeps its worker and its testcase.
    assert!(pipeline.channel(&main).is_worker_running());
    let reply = relay.handle(RelayEnvelope {
        caller: main.clone(),
        thread_name: None,
        sender_timestamp: now_millis(),
        event: Event::EndTestcase {
            result: TestcaseResult::Passed,
        },
    });
    assert!(matches!(reply, RelayReply::Completed(_)));
    pipeline.close();

    let texts: Vec<String> = backend
        .messages()
        .into_iter()
        .filter(|(target, _)| *target == MessageTarget::Testcase(testcase.testcase_id.unwrap()))
        .map(|(_, record)| record.message)
        .collect();
    assert_eq!(texts, vec!["round 0", "round 1"]);
}
