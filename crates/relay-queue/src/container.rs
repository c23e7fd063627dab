//! In-memory queue containers - ordered buffers of queued-message metadata
//!
//! A container is owned exclusively by its message queue and never leaks
//! beyond it. Every mutation enrolls a compensation on the supplied
//! transaction controller so a rollback restores the buffer exactly.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use relay_common::{
    MessageMetadataUpdate, MessageStatus, QueueType, QueuedMessage, TraceInfo,
};

use crate::error::QueueError;
use crate::transaction::TransactionController;
use crate::Result;

/// Ordered buffer of queued messages participating in a transaction.
#[async_trait]
pub trait QueueContainer: Send + Sync {
    fn queue_type(&self) -> QueueType;

    /// Append messages; atomic per transaction.
    async fn enqueue(
        &self,
        items: Vec<QueuedMessage>,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<()>;

    /// Return the next eligible message without removing it.
    ///
    /// FIFO: the head, or `None` while the head is delayed (strict order,
    /// no skip). Delayable: the first message in enqueue order whose delay
    /// has elapsed, skipping suspended and aborted entries.
    async fn try_peek(
        &self,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<Option<QueuedMessage>>;

    /// Remove by message id; error if absent.
    async fn try_remove(
        &self,
        msg: &QueuedMessage,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<()>;

    /// Apply a status/retry/delay diff in place.
    async fn update(
        &self,
        msg: &QueuedMessage,
        update: MessageMetadataUpdate,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<()>;

    async fn count(&self) -> usize;
}

/// In-memory container backing both ordering policies.
pub struct MemoryQueueContainer {
    queue_type: QueueType,
    max_size: Option<usize>,
    items: Arc<Mutex<Vec<QueuedMessage>>>,
}

impl MemoryQueueContainer {
    pub fn fifo(max_size: Option<usize>) -> Self {
        Self {
            queue_type: QueueType::SequentialFifo,
            max_size,
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn delayable(max_size: Option<usize>) -> Self {
        Self {
            queue_type: QueueType::SequentialDelayable,
            max_size,
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn for_type(queue_type: QueueType, max_size: Option<usize>) -> Self {
        match queue_type {
            QueueType::SequentialFifo => Self::fifo(max_size),
            QueueType::SequentialDelayable => Self::delayable(max_size),
        }
    }
}

#[async_trait]
impl QueueContainer for MemoryQueueContainer {
    fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    async fn enqueue(
        &self,
        items: Vec<QueuedMessage>,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let ids: Vec<_> = items.iter().map(|m| m.message_id).collect();
        {
            let mut buffer = self.items.lock();
            if let Some(max) = self.max_size {
                if buffer.len() + items.len() > max {
                    return Err(QueueError::Full(max));
                }
            }
            buffer.extend(items);
        }

        debug!(
            trace_id = %trace.trace_id,
            transaction_id = %tx.transaction_id(),
            count = ids.len(),
            "Enqueued messages"
        );

        let buffer = self.items.clone();
        tx.on_rollback(Box::new(move || {
            Box::pin(async move {
                buffer.lock().retain(|m| !ids.contains(&m.message_id));
            })
        }));

        Ok(())
    }

    async fn try_peek(
        &self,
        trace: &TraceInfo,
        _tx: &Arc<dyn TransactionController>,
    ) -> Result<Option<QueuedMessage>> {
        let now = Utc::now();
        let buffer = self.items.lock();

        let peeked = match self.queue_type {
            QueueType::SequentialFifo => buffer
                .first()
                .filter(|head| head.is_eligible(now))
                .cloned(),
            QueueType::SequentialDelayable => buffer
                .iter()
                .find(|m| {
                    m.is_eligible(now)
                        && !matches!(m.status, MessageStatus::Suspended | MessageStatus::Aborted)
                })
                .cloned(),
        };

        debug!(
            trace_id = %trace.trace_id,
            message_id = ?peeked.as_ref().map(|m| m.message_id),
            "Peeked queue container"
        );

        Ok(peeked)
    }

    async fn try_remove(
        &self,
        msg: &QueuedMessage,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<()> {
        let (index, removed) = {
            let mut buffer = self.items.lock();
            let index = buffer
                .iter()
                .position(|m| m.message_id == msg.message_id)
                .ok_or(QueueError::NotFound(msg.message_id))?;
            (index, buffer.remove(index))
        };

        debug!(
            trace_id = %trace.trace_id,
            message_id = %msg.message_id,
            "Removed message from queue container"
        );

        let buffer = self.items.clone();
        tx.on_rollback(Box::new(move || {
            Box::pin(async move {
                let mut buffer = buffer.lock();
                let at = index.min(buffer.len());
                buffer.insert(at, removed);
            })
        }));

        Ok(())
    }

    async fn update(
        &self,
        msg: &QueuedMessage,
        update: MessageMetadataUpdate,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<()> {
        let previous = {
            let mut buffer = self.items.lock();
            let entry = buffer
                .iter_mut()
                .find(|m| m.message_id == msg.message_id)
                .ok_or(QueueError::NotFound(msg.message_id))?;
            let previous = entry.clone();
            entry.apply_update(&update);
            previous
        };

        debug!(
            trace_id = %trace.trace_id,
            message_id = %msg.message_id,
            status = ?update.status,
            retry_count = update.retry_count,
            "Updated message metadata"
        );

        let buffer = self.items.clone();
        tx.on_rollback(Box::new(move || {
            Box::pin(async move {
                let mut buffer = buffer.lock();
                if let Some(entry) = buffer
                    .iter_mut()
                    .find(|m| m.message_id == previous.message_id)
                {
                    *entry = previous;
                }
            })
        }));

        Ok(())
    }

    async fn count(&self) -> usize {
        self.items.lock().len()
    }
}
