use thiserror::Error;

pub type Result<T> = std::result::Result<T, MemError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemError {
    /// Granting the request would push the outstanding total above the ceiling.
    #[error("memory ceiling reached: requested={requested} outstanding={outstanding} ceiling={ceiling}")]
    OutOfMemory {
        requested: usize,
        outstanding: usize,
        ceiling: usize,
    },

    /// The system allocator itself refused the request.
    #[error("allocation of {requested} bytes failed")]
    Exhausted { requested: usize },

    /// A fixed-size buffer pool outside the budget had no free entries.
    #[error("buffer pool exhausted: {segments} segment(s) requested")]
    PoolExhausted { segments: usize },
}
