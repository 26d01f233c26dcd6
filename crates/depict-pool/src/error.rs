use thiserror::Error;

pub type PoolResult<T> = std::result::Result<T, PoolError>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool requires at least one worker")]
    NoWorkers,
}
