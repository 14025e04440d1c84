/// Errors surfaced to the code embedding the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("helper registration failed: {0}")]
    Registry(String),
}

pub type Result<T> = std::result::Result<T, Error>;
