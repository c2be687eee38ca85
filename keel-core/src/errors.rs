use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeelError>;

#[derive(Error, Debug)]
pub enum KeelError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Topic catalog error: {0}")]
    Catalog(String),

    #[error("Dispatch sink error: {0}")]
    Sink(String),

    #[error("Invalid topic definition: {0}")]
    InvalidTopic(String),
}
