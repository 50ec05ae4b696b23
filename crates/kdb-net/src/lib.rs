pub mod frame;
pub mod transport;

pub use frame::{recv_exact, recv_frame, send_all, send_frame, MAX_FRAME_LEN};
pub use transport::{ConnectionHandle, TcpTransport, TransportMode, TransportProvider};

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Disconnected")]
    Disconnected,
    #[error("`{op}` is not supported by a {mode:?} transport")]
    Unsupported {
        op: &'static str,
        mode: TransportMode,
    },
    #[error("Transport is not bound")]
    NotBound,
    #[error("Transport already bound to {0}")]
    AlreadyBound(SocketAddr),
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Folds socket errors that mean "peer is gone" into `Disconnected`.
    pub(crate) fn from_socket(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof | NotConnected => {
                TransportError::Disconnected
            }
            _ => TransportError::Io(err),
        }
    }
}
