use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Message not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("Queue container is full (max size {0})")]
    Full(usize),

    #[error("Transaction already completed")]
    TransactionCompleted,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<QueueError> for relay_common::RelayError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::NotFound(id) => {
                relay_common::RelayError::Transport(format!("message not found: {id}"))
            }
            QueueError::Full(max) => {
                relay_common::RelayError::InvalidState(format!("queue container full (max {max})"))
            }
            QueueError::TransactionCompleted => {
                relay_common::RelayError::InvalidState("transaction already completed".to_string())
            }
            QueueError::Storage(detail) => relay_common::RelayError::Transport(detail),
            QueueError::Serialization(e) => relay_common::RelayError::Serialization(e),
        }
    }
}
