pub mod echo;
pub mod executor;
pub mod protocol;
#[cfg(test)]
mod tests;

pub use echo::EchoService;
pub use executor::BlockStorageService;
pub use protocol::{TransactionDescriptor, TxMode, TxRequest, TxResponse, TxSelector};

use async_trait::async_trait;
use kdb_common::FieldError;
use kdb_net::{recv_frame, send_frame, ConnectionHandle, TransportError, TransportProvider};
use kdb_store::{BlockStore, IoError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Malformed request: {0}")]
    Malformed(String),
    #[error("Unknown transaction mode {0:#04x}")]
    InvalidMode(u8),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Object is closed: {0}")]
    Closed(String),
    #[error("Store has no header block")]
    Uninitialized,
    #[error("Corrupt block at offset {0}")]
    Corrupt(u64),
    #[error("Field Error: {0}")]
    Field(#[from] FieldError),
    #[error("Storage IO Error: {0}")]
    Io(#[from] IoError),
    #[error("Extent map lock poisoned")]
    Lock,
}

/// Turns client requests into transactions against the block store.
#[async_trait]
pub trait StorageService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Builds a self-contained transaction from a request payload.
    fn generate_tx(
        &self,
        payload: &[u8],
        mode: TxMode,
    ) -> Result<TransactionDescriptor, StorageError>;

    /// Applies `tx`. Reads return the requested bytes, other modes return nothing.
    fn execute_tx(
        &self,
        store: &mut BlockStore,
        tx: &TransactionDescriptor,
    ) -> Result<Vec<u8>, StorageError>;

    /// One request/response cycle on `conn`. Transaction failures are sent to
    /// the peer as `TxResponse::Failed`; only transport errors are returned,
    /// and the connection stays open for the next cycle either way.
    async fn handle_request(
        &self,
        store: &Mutex<BlockStore>,
        transport: &dyn TransportProvider,
        conn: ConnectionHandle,
    ) -> Result<(), TransportError> {
        let body = recv_frame(transport, conn).await?;

        let prepared = protocol::split_request(&body)
            .and_then(|(mode, payload)| self.generate_tx(payload, mode));

        let response = match prepared {
            Ok(tx) => {
                let mut guard = store.lock().await;
                match self.execute_tx(&mut guard, &tx) {
                    Ok(data) => {
                        debug!(%conn, tx_id = tx.id, size = tx.size, "transaction applied");
                        TxResponse::Done { tx_id: tx.id, data }
                    }
                    Err(e) => {
                        warn!(%conn, tx_id = tx.id, error = %e, "transaction failed");
                        TxResponse::Failed {
                            tx_id: Some(tx.id),
                            reason: e.to_string(),
                        }
                    }
                }
            }
            Err(e) => {
                warn!(%conn, error = %e, "rejected request");
                TxResponse::Failed {
                    tx_id: None,
                    reason: e.to_string(),
                }
            }
        };

        let encoded = response
            .to_bytes()
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;
        send_frame(transport, conn, &encoded).await
    }
}
