use artarget_core::{update, JobBoard, Msg, RetryPolicy};

#[test]
fn update_is_noop() {
    let board = JobBoard::new(RetryPolicy::default());
    let (next, effects) = update(board.clone(), Msg::NoOp);

    assert_eq!(board, next);
    assert!(effects.is_empty());
}

#[test]
fn stale_messages_for_unknown_jobs_are_ignored() {
    let board = JobBoard::new(RetryPolicy::default());
    let (next, effects) = update(board.clone(), Msg::Cancel { job_id: "ghost".into() });

    assert_eq!(board, next);
    assert!(effects.is_empty());
}
