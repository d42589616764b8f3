use thiserror::Error;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("timer interval must be at least one tick")]
    InvalidTimerInterval,
}
