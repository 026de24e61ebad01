use rand_core::{OsRng, RngCore};
use serde::Deserialize;
use snippet_rpc::{EventCache, DEFAULT_QUEUE_CAPACITY, DEFAULT_WAIT_TIMEOUT};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:0";
const GENERATED_SECRET_BYTES: usize = 16;

#[derive(Debug, Default, Deserialize)]
pub struct DaemonConfig {
    pub listen: Option<String>,
    pub secret: Option<String>,
    #[serde(default)]
    pub require_handshake: bool,
    pub capability_level: Option<u32>,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsConfig {
    pub capacity: Option<usize>,
    pub default_timeout_ms: Option<u64>,
}

impl DaemonConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    pub fn listen_addr(&self) -> &str {
        self.listen.as_deref().unwrap_or(DEFAULT_LISTEN)
    }

    /// The configured secret, or a fresh random one when a handshake is
    /// required but no secret was given.
    pub fn handshake_secret(&self) -> Option<String> {
        match (&self.secret, self.require_handshake) {
            (Some(secret), _) => Some(secret.clone()),
            (None, true) => Some(generate_secret()),
            (None, false) => None,
        }
    }

    pub fn event_cache(&self) -> EventCache {
        EventCache::with_limits(
            self.events.capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            self.events.default_timeout_ms.map_or(DEFAULT_WAIT_TIMEOUT, Duration::from_millis),
        )
    }
}

pub fn generate_secret() -> String {
    let mut bytes = [0_u8; GENERATED_SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
