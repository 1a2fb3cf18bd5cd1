//! Error types (ambient stack; see spec.md §7 for the error-kind policy
//! these mirror).
//!
//! Per spec.md §7: most of these are "recover locally, log and drop"
//! situations rather than propagated `Result`s. The scheduler's public API
//! stays infallible where the spec calls for logged-and-dropped behavior;
//! `ScheduleError` exists for the one open question §9 asks us to pin down
//! (see `DESIGN.md`: scheduling after `stop()`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("scheduler is stopped or stopping")]
    Stopped,
    #[error("null task handed to schedule()")]
    NullTask,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("scheduler requires at least one worker thread")]
    ZeroWorkers,
    #[error("scheduler already started")]
    AlreadyStarted,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FiberError {
    #[error("failed to allocate fiber stack: {0}")]
    StackAlloc(#[source] std::io::Error),
}
