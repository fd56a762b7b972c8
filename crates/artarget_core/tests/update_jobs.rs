use std::sync::Once;

use artarget_core::{update, Effect, JobBoard, JobPhase, Msg, Notice, RetryPolicy, Ticket};
use pretty_assertions::assert_eq;

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(artarget_logging::initialize_for_tests);
}

fn ticket(board: &JobBoard, job_id: &str) -> Ticket {
    board.job(job_id).expect("job exists").ticket()
}

fn trigger(board: JobBoard, job_id: &str) -> (JobBoard, Vec<Effect>) {
    update(board, Msg::Trigger { job_id: job_id.to_string() })
}

fn close(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-5
}

#[test]
fn trigger_enters_loading_and_begins_attempt() {
    init_logging();
    let (mut board, effects) = trigger(JobBoard::new(RetryPolicy::default()), "pc-1");

    let job = board.job("pc-1").unwrap();
    assert_eq!(job.phase, JobPhase::Loading);
    assert_eq!(job.attempt, 1);
    assert_eq!(job.progress, 0.0);
    assert!(matches!(effects[0], Effect::BeginAttempt { .. }));
    assert!(board.consume_dirty());
}

#[test]
fn second_trigger_for_same_artifact_is_noop() {
    init_logging();
    let (board, first) = trigger(JobBoard::new(RetryPolicy::default()), "pc-1");
    let (board, second) = trigger(board, "pc-1");

    assert_eq!(first.len(), 2);
    assert!(second.is_empty());
    assert_eq!(board.view().active, 1);
}

#[test]
fn happy_path_walks_every_stage_in_order() {
    init_logging();
    let (board, _) = trigger(JobBoard::new(RetryPolicy::default()), "pc-1");
    let t = ticket(&board, "pc-1");

    let (board, effects) = update(board, Msg::ModuleLoaded { ticket: t.clone() });
    assert_eq!(board.phase_of("pc-1"), JobPhase::Compiling);
    assert_eq!(effects[0], Effect::Compile { ticket: t.clone() });

    let (board, _) = update(board, Msg::CompileFinished { ticket: t.clone() });
    assert_eq!(board.phase_of("pc-1"), JobPhase::Uploading);

    let (board, effects) = update(
        board,
        Msg::UploadFinished {
            ticket: t.clone(),
            url: "https://cdn.example.com/targets/pc-1.mind".into(),
        },
    );
    let job = board.job("pc-1").unwrap();
    assert_eq!(job.phase, JobPhase::Completed);
    assert_eq!(job.progress, 1.0);
    assert!(effects.contains(&Effect::Release { ticket: t }));
    assert!(effects.contains(&Effect::Notify(Notice::Completed {
        job_id: "pc-1".into(),
        url: "https://cdn.example.com/targets/pc-1.mind".into(),
        attempt: 1,
    })));
}

#[test]
fn stage_cannot_be_skipped() {
    init_logging();
    let (board, _) = trigger(JobBoard::new(RetryPolicy::default()), "pc-1");
    let t = ticket(&board, "pc-1");

    // Upload result while still loading is dropped.
    let (board, effects) = update(
        board,
        Msg::UploadFinished {
            ticket: t,
            url: "https://x".into(),
        },
    );
    assert!(effects.is_empty());
    assert_eq!(board.phase_of("pc-1"), JobPhase::Loading);
}

#[test]
fn compile_progress_is_remapped_and_monotonic() {
    init_logging();
    let (board, _) = trigger(JobBoard::new(RetryPolicy::default()), "pc-1");
    let t = ticket(&board, "pc-1");
    let (board, _) = update(board, Msg::ModuleLoaded { ticket: t.clone() });
    assert!(close(board.job("pc-1").unwrap().progress, 0.15));

    let (board, effects) = update(
        board,
        Msg::StageProgress {
            ticket: t.clone(),
            percent: 50,
        },
    );
    assert!(close(board.job("pc-1").unwrap().progress, 0.5));
    assert_eq!(effects.len(), 1);

    // Going backwards does not lower progress.
    let (board, effects) = update(
        board,
        Msg::StageProgress {
            ticket: t.clone(),
            percent: 20,
        },
    );
    assert!(close(board.job("pc-1").unwrap().progress, 0.5));
    assert!(effects.is_empty());

    let (board, _) = update(board, Msg::CompileFinished { ticket: t });
    assert!(close(board.job("pc-1").unwrap().progress, 0.85));
}

#[test]
fn completion_notice_fires_once() {
    init_logging();
    let (board, _) = trigger(JobBoard::new(RetryPolicy::default()), "pc-1");
    let t = ticket(&board, "pc-1");
    let (board, _) = update(board, Msg::ModuleLoaded { ticket: t.clone() });
    let (board, _) = update(board, Msg::CompileFinished { ticket: t.clone() });
    let finished = Msg::UploadFinished {
        ticket: t,
        url: "https://x".into(),
    };
    let (board, first) = update(board, finished.clone());
    let (_board, second) = update(board, finished);

    let notices = |effects: &[Effect]| {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Notify(_)))
            .count()
    };
    assert_eq!(notices(&first), 1);
    assert_eq!(notices(&second), 0);
}

#[test]
fn completed_artifact_is_not_retriggered_until_artifact_changes() {
    init_logging();
    let (board, _) = trigger(JobBoard::new(RetryPolicy::default()), "a");
    let t = ticket(&board, "a");
    let (board, _) = update(board, Msg::ModuleLoaded { ticket: t.clone() });
    let (board, _) = update(board, Msg::CompileFinished { ticket: t.clone() });
    let (board, _) = update(
        board,
        Msg::UploadFinished {
            ticket: t,
            url: "https://x".into(),
        },
    );

    let (board, effects) = trigger(board, "a");
    assert!(effects.is_empty());

    let (board, _) = update(
        board,
        Msg::ArtifactChanged {
            previous: "a".into(),
            next: "b".into(),
        },
    );
    assert!(board.job("a").is_none());
    let (board, effects) = trigger(board, "b");
    assert!(!effects.is_empty());
    assert_eq!(board.phase_of("b"), JobPhase::Loading);
}

#[test]
fn independent_artifacts_run_side_by_side() {
    init_logging();
    let (board, _) = trigger(JobBoard::new(RetryPolicy::default()), "a");
    let (board, effects) = trigger(board, "b");

    assert!(!effects.is_empty());
    assert_eq!(board.view().active, 2);
    assert_ne!(
        board.job("a").unwrap().generation(),
        board.job("b").unwrap().generation()
    );
}
