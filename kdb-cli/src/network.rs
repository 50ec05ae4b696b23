use anyhow::{bail, Context, Result};
use kdb_net::{recv_frame, send_frame, ConnectionHandle, TcpTransport, TransportProvider};
use kdb_service::{TxMode, TxRequest, TxResponse};

pub struct KdbClient {
    transport: TcpTransport,
}

impl KdbClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let transport = TcpTransport::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to kdb server at {}", addr))?;
        Ok(Self { transport })
    }

    /// One framed request/response exchange. A `Failed` response becomes an error.
    pub async fn execute(&self, mode: TxMode, request: &TxRequest) -> Result<Vec<u8>> {
        let body = request.encode(mode)?;
        send_frame(&self.transport, ConnectionHandle::OUTBOUND, &body)
            .await
            .context("Failed to send request")?;

        let reply = recv_frame(&self.transport, ConnectionHandle::OUTBOUND)
            .await
            .context("Failed to read response")?;
        match TxResponse::from_bytes(&reply).context("Malformed response")? {
            TxResponse::Done { data, .. } => Ok(data),
            TxResponse::Failed { reason, .. } => bail!(reason),
        }
    }

    pub async fn put(&self, file_id: &str, file_name: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.execute(TxMode::Write, &TxRequest::write(file_id, file_name, offset, data))
            .await
            .map(|_| ())
    }

    pub async fn get(&self, file_id: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.execute(TxMode::Read, &TxRequest::read(file_id, offset, length))
            .await
    }

    pub async fn close(&self, file_id: &str) -> Result<()> {
        self.execute(TxMode::Close, &TxRequest::target(file_id))
            .await
            .map(|_| ())
    }

    pub async fn delete(&self, file_id: &str) -> Result<()> {
        self.execute(TxMode::Delete, &TxRequest::target(file_id))
            .await
            .map(|_| ())
    }

    pub async fn disconnect(self) {
        self.transport.close().await;
    }
}
