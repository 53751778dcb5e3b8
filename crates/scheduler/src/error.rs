//! Scheduler errors

/// Errors surfaced by the scheduler, actor handles and actor futures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActorError {
    /// The actor is closing or closed and accepts no more jobs
    #[error("Actor '{0}' is closed")]
    Closed(String),

    /// The scheduler has been stopped
    #[error("Actor scheduler is stopped")]
    SchedulerStopped,

    /// The job producing the value was dropped before it completed
    #[error("Future was abandoned before completion")]
    Abandoned,

    /// A job panicked; the actor was closed
    #[error("Actor '{actor}' failed: {message}")]
    Failed {
        /// Actor name
        actor: String,
        /// Panic message
        message: String,
    },

    /// Waiting for a future timed out
    #[error("Timed out waiting for future")]
    Timeout,
}
