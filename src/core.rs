use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A type-erased, thread-safe value carried by a flow.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// A 32-byte BLAKE3 hash, used as a compact fingerprint of keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Lowercase hexadecimal form of the whole hash.
    pub fn to_hex(self) -> String {
        crate::utils::hex(&self.0)
    }

    /// The first eight bytes in hexadecimal, enough to tell keys apart in logs.
    pub fn short(self) -> String {
        crate::utils::hex(&self.0[..8])
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.short())
    }
}

/// How ready tasks of a rank are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Workers {
    /// Ready tasks run one after another on the thread driving the rank.
    #[default]
    Serial,
    /// Ready tasks run on a dedicated rayon pool with the given thread count.
    Threads(usize),
}

/// Runtime configuration shared by every rank.
///
/// ```rust
/// use std::time::Duration;
/// use nagare::{Config, Workers};
///
/// let config = Config::default()
///     .workers(Workers::Threads(4))
///     .stall_timeout(Duration::from_secs(5));
///
/// assert_eq!(config.workers, Workers::Threads(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Execution strategy for ready tasks.
    pub workers: Workers,
    /// How long a rank of a [`World`](crate::World) may go without local
    /// progress before it reports a stall. Standalone ranks detect stalls
    /// exactly and do not use it. `None` waits forever.
    pub stall_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: Workers::Serial,
            stall_timeout: None,
        }
    }
}

impl Config {
    pub fn workers(mut self, workers: Workers) -> Self {
        self.workers = workers;
        self
    }

    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }

    /// Parses a configuration from JSON, missing fields take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
