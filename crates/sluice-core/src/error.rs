use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Rejected at construction; the dispatcher is never started.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The queue task is gone. Structural: the owner terminates too.
    #[error("queue is no longer running")]
    QueueLost,

    /// The processor task is gone. Structural: the dispatcher terminates.
    #[error("processor is no longer running")]
    ProcessorLost,

    /// The dispatcher has terminated and no longer accepts input.
    #[error("dispatcher has terminated")]
    Terminated,
}
