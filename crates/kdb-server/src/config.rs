use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use kdb_security::{ChaChaCrypto, CryptoProvider, NoopCrypto, XorCrypto};
use kdb_service::{BlockStorageService, EchoService, StorageService};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CryptoKind {
    /// ChaCha20 keyed from the passphrase
    Chacha,
    /// Repeating-key XOR; samples and tests only
    Xor,
    /// No protection; tests only
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServiceKind {
    Block,
    Echo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "kdb-server", version, about = "Block database kernel server")]
pub struct Config {
    /// Backing database file, created on first start
    #[arg(long, env = "KDB_PATH", default_value = "file.db")]
    pub db_path: PathBuf,

    #[arg(long, env = "KDB_PORT", default_value_t = 8000)]
    pub port: u16,

    #[arg(long, env = "KDB_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Protects the key-encryption-key at rest
    #[arg(long, env = "KDB_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,

    #[arg(long, value_enum, default_value_t = CryptoKind::Chacha)]
    pub crypto: CryptoKind,

    #[arg(long, value_enum, default_value_t = ServiceKind::Block)]
    pub service: ServiceKind,

    /// Serve each connection on its own task
    #[arg(long)]
    pub per_connection_tasks: bool,

    #[arg(long, env = "KDB_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn crypto_provider(&self) -> Result<Box<dyn CryptoProvider>> {
        let passphrase = self.passphrase.as_deref().filter(|p| !p.is_empty());

        Ok(match (self.crypto, passphrase) {
            (CryptoKind::Chacha, Some(p)) => Box::new(ChaChaCrypto::from_passphrase(p)?),
            (CryptoKind::Xor, Some(p)) => Box::new(XorCrypto::new(p.as_bytes())?),
            (CryptoKind::Noop, _) => Box::new(NoopCrypto),
            (kind, None) => bail!("--crypto {:?} requires --passphrase or KDB_PASSPHRASE", kind),
        })
    }

    pub fn storage_service(&self) -> Arc<dyn StorageService> {
        match self.service {
            ServiceKind::Block => Arc::new(BlockStorageService::new()),
            ServiceKind::Echo => Arc::new(EchoService::new()),
        }
    }
}
