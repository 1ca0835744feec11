use netsplice_mem::MemError;

use crate::host::HookError;

/// Errors surfaced by the consumer-facing network operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    #[error("no such interface or consumer id")]
    NotFound,

    /// The budget, the system allocator or the host segment pool refused memory.
    #[error(transparent)]
    OutOfMemory(#[from] MemError),

    #[error("interface or consumer id is already plugged")]
    AlreadyPlugged,

    #[error(transparent)]
    Hook(#[from] HookError),
}

pub type Result<T> = std::result::Result<T, NetError>;
