//! Bounded-concurrency asynchronous block writer
//!
//! Dirty blocks come in uncompressed; each submission runs as one task that
//! acquires a handler token, serializes every block with the configured
//! framing, and commits. Stores that advertise the batch capability receive
//! sequential batches of [`BATCH_SIZE`] records; others get a single
//! range-put. The token is held by an owned semaphore permit, so it releases
//! on every exit path.

use crate::backend::{KeyValue, KvStore, WriteBatch};
use crate::codec::{serialize_record, Checksum, Compression};
use crate::error::{Result, VaultError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::error;

/// Records per batch commit when the backend supports batching
pub const BATCH_SIZE: usize = 500;

/// One block awaiting persistence: its full backend key and uncompressed
/// payload
#[derive(Debug, Clone)]
pub struct DirtyBlock {
    pub key: Bytes,
    pub payload: Vec<u8>,
}

impl DirtyBlock {
    pub fn new(key: Bytes, payload: Vec<u8>) -> Self {
        Self { key, payload }
    }
}

/// Completion handle for one submission
#[derive(Debug)]
pub struct WriteTicket {
    handle: JoinHandle<Result<()>>,
}

impl WriteTicket {
    /// Wait until the submission has committed (or failed)
    pub async fn wait(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| VaultError::Backend(format!("write task aborted: {}", e)))?
    }
}

/// Token-gated writer committing dirty blocks in the background
pub struct AsyncWriter {
    store: Arc<dyn KvStore>,
    tokens: Arc<Semaphore>,
    compression: Compression,
    checksum: Checksum,
    detached: Mutex<Vec<WriteTicket>>,
}

impl AsyncWriter {
    /// A writer allowing at most `max_in_flight` concurrent submissions
    pub fn new(
        store: Arc<dyn KvStore>,
        max_in_flight: usize,
        compression: Compression,
        checksum: Checksum,
    ) -> Self {
        Self {
            store,
            tokens: Arc::new(Semaphore::new(max_in_flight.max(1))),
            compression,
            checksum,
            detached: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a group of dirty blocks, returning a ticket the caller can
    /// wait on
    pub fn submit(&self, blocks: Vec<DirtyBlock>) -> WriteTicket {
        let store = self.store.clone();
        let tokens = self.tokens.clone();
        let compression = self.compression;
        let checksum = self.checksum;
        let handle = tokio::spawn(async move {
            let _permit = tokens
                .acquire_owned()
                .await
                .map_err(|e| VaultError::Backend(format!("writer token pool closed: {}", e)))?;
            let result = commit_blocks(&*store, blocks, compression, checksum).await;
            if let Err(e) = &result {
                error!("block write failed: {}", e);
            }
            result
        });
        WriteTicket { handle }
    }

    /// Enqueue a group of dirty blocks without waiting; the ticket is held
    /// for a later [`flush`](Self::flush)
    pub fn submit_detached(&self, blocks: Vec<DirtyBlock>) {
        let ticket = self.submit(blocks);
        self.detached.lock().push(ticket);
    }

    /// Wait for every detached submission, surfacing the first error
    pub async fn flush(&self) -> Result<()> {
        let tickets: Vec<WriteTicket> = std::mem::take(&mut *self.detached.lock());
        let mut first_err = None;
        for ticket in tickets {
            if let Err(e) = ticket.wait().await {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn commit_blocks(
    store: &dyn KvStore,
    blocks: Vec<DirtyBlock>,
    compression: Compression,
    checksum: Checksum,
) -> Result<()> {
    let mut records = Vec::with_capacity(blocks.len());
    for block in &blocks {
        let value = serialize_record(&block.payload, compression, checksum)?;
        records.push(KeyValue::new(block.key.clone(), value));
    }

    if let Some(batcher) = store.batcher() {
        for chunk in records.chunks(BATCH_SIZE) {
            let mut batch = WriteBatch::new();
            for record in chunk {
                batch.put(record.key.clone(), record.value.clone());
            }
            batcher.commit(batch).await?;
        }
        Ok(())
    } else {
        store.put_range(records).await
    }
}
