//! Queue setup and submission errors.

use std::fmt;

#[derive(Debug)]
pub enum QueueError {
    /// Capacity must be a power of two in [1, 4096].
    InvalidCapacity(u32),
    /// Ring setup failed.
    Setup(i32),
    /// The kernel is missing a required io_uring feature.
    MissingFeature(&'static str),
    /// Submission queue is full.
    RingFull,
    /// io_uring_enter failed.
    Submit(i32),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCapacity(n) => {
                write!(f, "invalid ring capacity {n} (power of two in [1, 4096])")
            }
            Self::Setup(e) => write!(f, "io_uring setup: errno {e}"),
            Self::MissingFeature(feat) => write!(f, "io_uring does not support {feat}"),
            Self::RingFull => write!(f, "ring full"),
            Self::Submit(e) => write!(f, "io_uring submit: errno {e}"),
        }
    }
}

impl std::error::Error for QueueError {}

pub type Result<T> = std::result::Result<T, QueueError>;
