use cinder_machine::MachineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("priority {0} is outside the supported range 0..=149")]
    InvalidPriority(u8),

    #[error("thread handle space exhausted")]
    TooManyThreads,

    #[error("machine error: {0}")]
    Machine(#[from] MachineError),
}
