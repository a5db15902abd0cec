use thiserror::Error;

/// Errors surfaced by the SGV pool allocator.
///
/// Allocation paths undo all side effects (admission counters, quota,
/// partially built SG lists) before returning an error. A cache miss is an
/// internal event, never an error.
#[derive(Error, Debug)]
pub enum SgvError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("out of memory: {requested_pages} pages requested")]
    OutOfMemory { requested_pages: usize },

    #[error("pool name '{name}' is claimed by an incompatible owner")]
    Busy { name: String },
}

impl SgvError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        SgvError::InvalidArgument {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SgvError>;
