use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker thread could not be created: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker was already launched")]
    AlreadyLaunched,

    #[error("worker is not initialized")]
    NotInitialized,
}
