//! Transactional queue building blocks: in-memory queue containers,
//! the transaction controller contract, and the message body provider
//! contract with its embedded implementation.

pub mod body;
pub mod container;
pub mod error;
pub mod transaction;

pub use body::{InMemoryBodyProvider, MessageBodyProvider};
pub use container::{MemoryQueueContainer, QueueContainer};
pub use error::QueueError;
pub use transaction::{
    execute_in_transaction, InMemoryTransactionFactory, TransactionController,
    TransactionControllerFactory, TxOutcome,
};

pub type Result<T> = std::result::Result<T, QueueError>;
