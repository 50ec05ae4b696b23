use kdb_common::{FieldError, HeaderBlock, ValidationError, BLOCK_SIZE};
use kdb_net::{ConnectionHandle, TransportError, TransportProvider};
use kdb_security::{CryptoError, CryptoProvider, Kek};
use kdb_service::StorageService;
use kdb_store::{header, BlockStore, IoError};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bring-up progress. `Online` and `Failed` are terminal for a kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Closed,
    Opening,
    Initializing,
    Validating,
    Online,
    Failed,
}

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Storage Error: {0}")]
    Io(#[from] IoError),
    #[error("Header rejected: {0}")]
    Validation(#[from] ValidationError),
    #[error("Crypto Error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Header encoding failed: {0}")]
    Field(#[from] FieldError),
    #[error("Transport Error: {0}")]
    Transport(#[from] TransportError),
    #[error("Kernel is {0:?}, not online")]
    NotOnline(KernelState),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KernelOptions {
    /// Spawn one task per accepted connection instead of serving them in turn.
    pub per_connection_tasks: bool,
}

/// Owns the backing file and drives bring-up and the service loop.
pub struct Kernel {
    path: PathBuf,
    state: KernelState,
    options: KernelOptions,
    crypto: Box<dyn CryptoProvider>,
    transport: Arc<dyn TransportProvider>,
    service: Arc<dyn StorageService>,
    store: Option<Arc<Mutex<BlockStore>>>,
    header: Option<HeaderBlock>,
    kek: Option<Kek>,
}

impl Kernel {
    pub fn new(
        path: impl Into<PathBuf>,
        crypto: Box<dyn CryptoProvider>,
        transport: Arc<dyn TransportProvider>,
        service: Arc<dyn StorageService>,
    ) -> Self {
        Self {
            path: path.into(),
            state: KernelState::Closed,
            options: KernelOptions::default(),
            crypto,
            transport,
            service,
            store: None,
            header: None,
            kek: None,
        }
    }

    pub fn with_options(mut self, options: KernelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> KernelState {
        self.state
    }

    /// The validated (or freshly written) header, once online.
    pub fn header(&self) -> Option<&HeaderBlock> {
        self.header.as_ref()
    }

    /// The cleartext KEK, once online.
    #[allow(dead_code)]
    pub fn kek(&self) -> Option<&Kek> {
        self.kek.as_ref()
    }

    /// Brings the kernel online. Failures are logged and leave the kernel `Failed`.
    pub fn online(&mut self) -> bool {
        match self.try_online() {
            Ok(()) => true,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "bring-up failed");
                false
            }
        }
    }

    /// Same as [`Kernel::online`], but names the failure.
    pub fn try_online(&mut self) -> Result<(), KernelError> {
        match self.state {
            KernelState::Online => return Ok(()),
            KernelState::Failed => return Err(KernelError::NotOnline(KernelState::Failed)),
            _ => {}
        }

        match self.bring_up() {
            Ok(()) => {
                self.state = KernelState::Online;
                info!(
                    path = %self.path.display(),
                    crypto = self.crypto.name(),
                    service = self.service.name(),
                    "kernel online"
                );
                Ok(())
            }
            Err(e) => {
                self.state = KernelState::Failed;
                Err(e)
            }
        }
    }

    fn bring_up(&mut self) -> Result<(), KernelError> {
        self.state = KernelState::Opening;
        let mut store = BlockStore::open(&self.path)?;
        let (block, bytes_read) = store.read_block(0)?;

        let (header, kek) = match bytes_read {
            0 => {
                self.state = KernelState::Initializing;
                self.initialize(&mut store)?
            }
            BLOCK_SIZE => {
                self.state = KernelState::Validating;
                let header = header::validate(&block)?;
                let kek = Kek::unseal(self.crypto.as_ref(), &header.kek)?;
                debug!(created_at = header.created_at, "header validated");
                (header, kek)
            }
            n => {
                return Err(IoError::Truncated {
                    offset: 0,
                    bytes_read: n,
                }
                .into())
            }
        };

        self.store = Some(Arc::new(Mutex::new(store)));
        self.header = Some(header);
        self.kek = Some(kek);
        Ok(())
    }

    fn initialize(&self, store: &mut BlockStore) -> Result<(HeaderBlock, Kek), KernelError> {
        let mut header = header::initialize(&self.path, header::now_unix());
        let kek = Kek::generate(self.crypto.as_ref())?;
        header.kek = kek.seal(self.crypto.as_ref())?;

        store.write_block(0, &header::encode(&header)?)?;
        store.sync()?;
        info!(path = %self.path.display(), "initialized new database");
        Ok((header, kek))
    }

    /// Accepts connections on `port` and dispatches their requests until
    /// `cancel` fires. Cancellation is only observed while waiting.
    pub async fn serve(&self, port: u16, cancel: CancellationToken) -> Result<(), KernelError> {
        let store = match (&self.store, self.state) {
            (Some(store), KernelState::Online) => store.clone(),
            (_, state) => return Err(KernelError::NotOnline(state)),
        };

        let addr = self.transport.listen(port).await?;
        info!(%addr, per_connection_tasks = self.options.per_connection_tasks, "serving");

        let mut tasks = JoinSet::new();
        let outcome = loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
                accepted = self.transport.accept() => accepted,
            };

            let conn = match accepted {
                Ok(conn) => conn,
                Err(e @ TransportError::Io(_)) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
                Err(e) => break Err(e.into()),
            };
            info!(%conn, peer = ?self.transport.peer_addr(conn), "new connection");

            if self.options.per_connection_tasks {
                let transport = self.transport.clone();
                let service = self.service.clone();
                let store = store.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    serve_connection(transport.as_ref(), service.as_ref(), &store, conn, &cancel)
                        .await
                });
            } else {
                serve_connection(
                    self.transport.as_ref(),
                    self.service.as_ref(),
                    &store,
                    conn,
                    &cancel,
                )
                .await;
            }
        };

        // Let in-flight requests finish before the sockets go away
        while tasks.join_next().await.is_some() {}
        self.transport.close().await;
        info!("service loop stopped");
        outcome
    }
}

/// Runs request cycles on one connection until the peer leaves or `cancel` fires.
async fn serve_connection(
    transport: &dyn TransportProvider,
    service: &dyn StorageService,
    store: &Mutex<BlockStore>,
    conn: ConnectionHandle,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%conn, "connection cancelled");
                break;
            }
            ready = transport.readable(conn) => {
                if let Err(e) = ready {
                    debug!(%conn, error = %e, "connection not readable");
                    break;
                }
            }
        }

        match service.handle_request(store, transport, conn).await {
            Ok(()) => {}
            Err(TransportError::Disconnected) => {
                info!(%conn, "peer disconnected");
                break;
            }
            Err(e) => {
                warn!(%conn, error = %e, "dropping connection");
                break;
            }
        }
    }
    transport.disconnect(conn);
}
