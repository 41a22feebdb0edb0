//! Endpoint configuration and key material.
//!
//! Both configs deserialize from TOML with every field optional; missing
//! fields fall back to the defaults below.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{NewbError, Result};
use crate::policy::ReceivePolicy;

/// Environment variable naming the directory that holds key material.
pub const CERTS_ENV: &str = "NEWB_CERTS";
/// Directory used when neither the config nor the environment names one.
pub const DEFAULT_CERTS_DIR: &str = "certs";
/// Port the pingpong demo listens on.
pub const DEFAULT_PORT: u16 = 4433;
/// Default size of the receive scratch buffer.
pub const DEFAULT_RECV_BUFFER: usize = 4096;
/// Smallest scratch buffer that can hold a full-size datagram.
const MIN_RECV_BUFFER: usize = 1200;

/// Where to find the certificate chain and private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyMaterialConfig {
    /// Directory holding both files. Falls back to `$NEWB_CERTS`, then `certs/`.
    pub directory: Option<PathBuf>,
    pub certificate_file: String,
    pub private_key_file: String,
}

impl Default for KeyMaterialConfig {
    fn default() -> Self {
        Self {
            directory: None,
            certificate_file: "server.crt".into(),
            private_key_file: "server.key".into(),
        }
    }
}

impl KeyMaterialConfig {
    /// Resolves the key directory: explicit config, then environment, then default.
    pub fn resolve_directory(&self) -> PathBuf {
        if let Some(dir) = &self.directory {
            return dir.clone();
        }
        match std::env::var_os(CERTS_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => PathBuf::from(DEFAULT_CERTS_DIR),
        }
    }

    pub fn certificate_path(&self) -> PathBuf {
        self.resolve_directory().join(&self.certificate_file)
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.resolve_directory().join(&self.private_key_file)
    }
}

/// Certificate chain and private key handed to the protocol engine.
///
/// The private key is wiped when the value is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    certificate_chain: Vec<u8>,
    private_key: Vec<u8>,
}

impl KeyMaterial {
    /// Wraps key material supplied by the caller.
    pub fn from_pem(
        certificate_chain: impl Into<Vec<u8>>,
        private_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            certificate_chain: certificate_chain.into(),
            private_key: private_key.into(),
        }
    }

    /// Reads both files named by `config`.
    pub fn load(config: &KeyMaterialConfig) -> Result<Self> {
        let certificate_chain = read_file(&config.certificate_path())?;
        let private_key = read_file(&config.private_key_path())?;
        tracing::debug!(
            cert_len = certificate_chain.len(),
            dir = %config.resolve_directory().display(),
            "loaded key material"
        );
        Ok(Self {
            certificate_chain,
            private_key,
        })
    }

    pub fn certificate_chain(&self) -> &[u8] {
        &self.certificate_chain
    }

    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("certificate_chain", &self.certificate_chain.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| NewbError::KeyMaterial {
        path: path.display().to_string(),
        source,
    })
}

/// Server-side endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptorConfig {
    pub host: String,
    pub port: u16,
    /// Size of the scratch buffer one `recv` fills.
    pub recv_buffer_size: usize,
    /// Read policy every accepted connection starts with.
    pub receive_policy: ReceivePolicy,
    /// Authentication fields embedded in minted connection IDs.
    pub node_id: u16,
    pub thread_id: u16,
    pub key_material: KeyMaterialConfig,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            recv_buffer_size: DEFAULT_RECV_BUFFER,
            receive_policy: ReceivePolicy::AtMost(1024),
            node_id: 1,
            thread_id: 0,
            key_material: KeyMaterialConfig::default(),
        }
    }
}

impl AcceptorConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| NewbError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_recv_buffer(self.recv_buffer_size)?;
        self.receive_policy.validate()
    }
}

/// Client-side endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    pub host: String,
    pub port: u16,
    pub recv_buffer_size: usize,
    pub receive_policy: ReceivePolicy,
    /// How long the handshake may take before the connection is torn down.
    pub connect_timeout_ms: u64,
    pub node_id: u16,
    pub thread_id: u16,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            recv_buffer_size: DEFAULT_RECV_BUFFER,
            receive_policy: ReceivePolicy::AtMost(1024),
            connect_timeout_ms: 2_000,
            node_id: 0,
            thread_id: 1,
        }
    }
}

impl DialerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| NewbError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_recv_buffer(self.recv_buffer_size)?;
        if self.connect_timeout_ms == 0 {
            return Err(NewbError::Config("connect_timeout_ms must be non-zero".into()));
        }
        self.receive_policy.validate()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn validate_recv_buffer(size: usize) -> Result<()> {
    if size < MIN_RECV_BUFFER {
        return Err(NewbError::Config(format!(
            "recv_buffer_size {size} is below the minimum of {MIN_RECV_BUFFER}"
        )));
    }
    Ok(())
}
