use crate::protocol::{TransactionDescriptor, TxMode, TxSelector};
use crate::{StorageError, StorageService};
use async_trait::async_trait;
use kdb_net::{send_all, ConnectionHandle, TransportError, TransportProvider};
use kdb_store::BlockStore;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

const ECHO_CHUNK: usize = 4096;

/// Sends back whatever arrives, unframed and byte-for-byte. Never touches the store.
#[derive(Debug, Default)]
pub struct EchoService {
    next_tx_id: AtomicU64,
}

impl EchoService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageService for EchoService {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn generate_tx(
        &self,
        payload: &[u8],
        mode: TxMode,
    ) -> Result<TransactionDescriptor, StorageError> {
        let selector = TxSelector {
            mode,
            file_id: String::new(),
            offset: 0,
            length: payload.len() as u64,
            file_name: String::new(),
        };
        Ok(TransactionDescriptor {
            id: self.next_tx_id.fetch_add(1, Ordering::Relaxed),
            size: payload.len() as u64,
            spec: selector.encode()?,
            data: payload.to_vec(),
        })
    }

    fn execute_tx(
        &self,
        _store: &mut BlockStore,
        tx: &TransactionDescriptor,
    ) -> Result<Vec<u8>, StorageError> {
        Ok(tx.data.clone())
    }

    async fn handle_request(
        &self,
        _store: &Mutex<BlockStore>,
        transport: &dyn TransportProvider,
        conn: ConnectionHandle,
    ) -> Result<(), TransportError> {
        let chunk = loop {
            let chunk = transport.recv(conn, ECHO_CHUNK)?;
            if !chunk.is_empty() {
                break chunk;
            }
            transport.readable(conn).await?;
        };

        debug!(%conn, len = chunk.len(), "echo");
        send_all(transport, conn, &chunk).await
    }
}
