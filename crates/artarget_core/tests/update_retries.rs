use std::time::Duration;

use artarget_core::{
    update, AbortReason, Effect, JobBoard, JobError, JobPhase, Msg, Notice, RetryPolicy, Ticket,
};
use pretty_assertions::assert_eq;

fn ticket(board: &JobBoard, job_id: &str) -> Ticket {
    board.job(job_id).expect("job exists").ticket()
}

/// Feeds messages and collects every effect produced.
fn run(board: JobBoard, msgs: Vec<Msg>, log: &mut Vec<Effect>) -> JobBoard {
    msgs.into_iter().fold(board, |board, msg| {
        let (board, effects) = update(board, msg);
        log.extend(effects);
        board
    })
}

/// Plays one attempt that fails while compiling.
fn fail_compile(board: JobBoard, job_id: &str, error: JobError, log: &mut Vec<Effect>) -> JobBoard {
    let t = ticket(&board, job_id);
    run(
        board,
        vec![
            Msg::ModuleLoaded { ticket: t.clone() },
            Msg::StageFailed { ticket: t, error },
        ],
        log,
    )
}

fn elapse_retry(board: JobBoard, job_id: &str, log: &mut Vec<Effect>) -> JobBoard {
    let t = ticket(&board, job_id);
    run(board, vec![Msg::RetryElapsed { ticket: t }], log)
}

fn scheduled_delays(log: &[Effect]) -> Vec<Duration> {
    log.iter()
        .filter_map(|e| match e {
            Effect::ScheduleRetry { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect()
}

fn compile_entries(log: &[Effect]) -> usize {
    log.iter()
        .filter(|e| matches!(e, Effect::Compile { .. }))
        .count()
}

#[test]
fn permanently_failing_compute_stops_after_max_attempts() {
    let mut log = Vec::new();
    let board = run(
        JobBoard::new(RetryPolicy::default()),
        vec![Msg::Trigger { job_id: "pc-1".into() }],
        &mut log,
    );

    let mut board = board;
    for attempt in 1..=3 {
        board = fail_compile(board, "pc-1", JobError::compute("no features"), &mut log);
        if attempt < 3 {
            assert_eq!(board.phase_of("pc-1"), JobPhase::Retrying);
            board = elapse_retry(board, "pc-1", &mut log);
        }
    }

    let job = board.job("pc-1").unwrap();
    assert_eq!(job.phase, JobPhase::Error);
    assert_eq!(job.attempt, 3);
    assert_eq!(compile_entries(&log), 3);

    // A late RetryElapsed cannot start a fourth attempt.
    let stale = Ticket {
        attempt: 3,
        ..ticket(&board, "pc-1")
    };
    let board = run(board, vec![Msg::RetryElapsed { ticket: stale }], &mut log);
    assert_eq!(board.phase_of("pc-1"), JobPhase::Error);
    assert_eq!(compile_entries(&log), 3);

    let failures: Vec<_> = log
        .iter()
        .filter_map(|e| match e {
            Effect::Notify(Notice::Failed { error, attempt, .. }) => Some((error.clone(), *attempt)),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![(JobError::compute("no features"), 3)]);
}

#[test]
fn backoff_doubles_between_attempts() {
    let mut log = Vec::new();
    let board = run(
        JobBoard::new(RetryPolicy::default()),
        vec![Msg::Trigger { job_id: "pc-1".into() }],
        &mut log,
    );
    let board = fail_compile(board, "pc-1", JobError::network("reset"), &mut log);
    let board = elapse_retry(board, "pc-1", &mut log);
    let _board = fail_compile(board, "pc-1", JobError::network("reset"), &mut log);

    assert_eq!(
        scheduled_delays(&log),
        vec![Duration::from_secs(2), Duration::from_secs(4)]
    );
}

#[test]
fn retry_reenters_loading_with_next_attempt() {
    let mut log = Vec::new();
    let board = run(
        JobBoard::new(RetryPolicy::default()),
        vec![Msg::Trigger { job_id: "pc-1".into() }],
        &mut log,
    );
    let board = fail_compile(board, "pc-1", JobError::timeout("compute took too long"), &mut log);
    let before = ticket(&board, "pc-1");
    let board = elapse_retry(board, "pc-1", &mut log);

    let job = board.job("pc-1").unwrap();
    assert_eq!(job.phase, JobPhase::Loading);
    assert_eq!(job.attempt, 2);
    assert_eq!(job.progress, 0.0);
    assert_eq!(
        job.last_error.as_ref().map(|e| e.message.as_str()),
        Some("compute took too long")
    );
    assert_eq!(
        log.last().cloned(),
        Some(Effect::Progress {
            job_id: "pc-1".into(),
            phase: JobPhase::Loading,
            progress: 0.0,
        })
    );
    assert!(log.contains(&Effect::BeginAttempt {
        ticket: Ticket {
            attempt: 2,
            ..before
        }
    }));
}

#[test]
fn retrying_notice_names_the_next_attempt() {
    let mut log = Vec::new();
    let board = run(
        JobBoard::new(RetryPolicy::default()),
        vec![Msg::Trigger { job_id: "pc-1".into() }],
        &mut log,
    );
    let _board = fail_compile(board, "pc-1", JobError::network("reset"), &mut log);

    assert!(log.contains(&Effect::Notify(Notice::Retrying {
        job_id: "pc-1".into(),
        next_attempt: 2,
        delay: Duration::from_secs(2),
        error: JobError::network("reset"),
    })));
}

#[test]
fn validation_error_fails_immediately_without_backoff() {
    let mut log = Vec::new();
    let board = run(
        JobBoard::new(RetryPolicy::default()),
        vec![Msg::Trigger { job_id: "pc-1".into() }],
        &mut log,
    );
    let board = fail_compile(board, "pc-1", JobError::validation("image too small"), &mut log);

    let job = board.job("pc-1").unwrap();
    assert_eq!(job.phase, JobPhase::Error);
    assert_eq!(job.attempt, 1);
    assert!(scheduled_delays(&log).is_empty());
}

#[test]
fn server_rejection_is_not_retried() {
    let mut log = Vec::new();
    let board = run(
        JobBoard::new(RetryPolicy::default()),
        vec![Msg::Trigger { job_id: "pc-1".into() }],
        &mut log,
    );
    let t = ticket(&board, "pc-1");
    let board = run(
        board,
        vec![
            Msg::ModuleLoaded { ticket: t.clone() },
            Msg::CompileFinished { ticket: t.clone() },
            Msg::StageFailed {
                ticket: t,
                error: JobError::server_rejected(Some(422), "invalid artifact"),
            },
        ],
        &mut log,
    );

    assert_eq!(board.phase_of("pc-1"), JobPhase::Error);
    assert!(scheduled_delays(&log).is_empty());
}

#[test]
fn aborted_stage_does_not_consume_an_attempt_or_notify() {
    let mut log = Vec::new();
    let board = run(
        JobBoard::new(RetryPolicy::default()),
        vec![Msg::Trigger { job_id: "pc-1".into() }],
        &mut log,
    );
    let board = fail_compile(
        board,
        "pc-1",
        JobError::aborted(AbortReason::Interrupted),
        &mut log,
    );

    let job = board.job("pc-1").unwrap();
    assert_eq!(job.phase, JobPhase::Idle);
    assert_eq!(job.attempt, 1);
    assert!(job.last_error.is_none());
    assert!(!log.iter().any(|e| matches!(e, Effect::Notify(_))));
    assert!(scheduled_delays(&log).is_empty());

    // The latch was released, so the file can be triggered again.
    let board = run(board, vec![Msg::Trigger { job_id: "pc-1".into() }], &mut log);
    assert_eq!(board.phase_of("pc-1"), JobPhase::Loading);
}

#[test]
fn manual_retry_restarts_a_failed_job() {
    let mut log = Vec::new();
    let board = run(
        JobBoard::new(RetryPolicy::new(1, Duration::from_secs(1))),
        vec![Msg::Trigger { job_id: "pc-1".into() }],
        &mut log,
    );
    let board = fail_compile(board, "pc-1", JobError::network("down"), &mut log);
    assert_eq!(board.phase_of("pc-1"), JobPhase::Error);
    let old = ticket(&board, "pc-1");

    let board = run(board, vec![Msg::Retry { job_id: "pc-1".into() }], &mut log);
    let job = board.job("pc-1").unwrap();
    assert_eq!(job.phase, JobPhase::Loading);
    assert_eq!(job.attempt, 1);
    assert_ne!(job.generation(), old.generation);
    assert_eq!(job.last_error, Some(JobError::network("down")));
}

#[test]
fn manual_retry_ignored_while_running() {
    let mut log = Vec::new();
    let board = run(
        JobBoard::new(RetryPolicy::default()),
        vec![
            Msg::Trigger { job_id: "pc-1".into() },
            Msg::Retry { job_id: "pc-1".into() },
        ],
        &mut log,
    );
    assert_eq!(board.job("pc-1").unwrap().attempt, 1);
    let begins = log
        .iter()
        .filter(|e| matches!(e, Effect::BeginAttempt { .. }))
        .count();
    assert_eq!(begins, 1);
}
