//! Client identities the extraction tool can impersonate, and the sequential
//! fallback over them.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use anyhow::{Result as AnyResult, anyhow, bail};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientIdentity {
    WebEmbedded,
    Ios,
    Android,
    Tv,
}

impl ClientIdentity {
    pub const ALL: [ClientIdentity; 4] = [Self::WebEmbedded, Self::Ios, Self::Android, Self::Tv];

    /// Name understood by `yt-dlp --extractor-args youtube:player_client=...`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebEmbedded => "web_embedded",
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Tv => "tv",
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientIdentity {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> AnyResult<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|client| client.as_str() == normalized)
            .ok_or_else(|| anyhow!("unknown player client: {value}"))
    }
}

/// Ordered, non-empty list of identities. Every call starts again from the
/// first entry; there is no reordering based on past results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRotation {
    clients: Vec<ClientIdentity>,
}

impl Default for ClientRotation {
    fn default() -> Self {
        Self {
            clients: ClientIdentity::ALL.to_vec(),
        }
    }
}

impl ClientRotation {
    pub fn new(clients: Vec<ClientIdentity>) -> AnyResult<Self> {
        if clients.is_empty() {
            bail!("at least one player client is required");
        }
        Ok(Self { clients })
    }

    /// Parses a comma separated list such as `web_embedded,ios`.
    pub fn parse(list: &str) -> AnyResult<Self> {
        let clients = list
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::parse::<ClientIdentity>)
            .collect::<AnyResult<Vec<_>>>()?;
        Self::new(clients)
    }

    pub fn clients(&self) -> &[ClientIdentity] {
        &self.clients
    }

    /// Tries `op` once per identity in order and returns the first success.
    /// When every identity fails, the error of the last one is returned.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(ClientIdentity) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut remaining = self.clients.iter().copied();
        // `new` rejects empty lists, so the first identity always exists.
        let first = remaining.next().unwrap_or(ClientIdentity::WebEmbedded);
        let mut outcome = op(first).await;
        let mut current = first;

        for next in remaining {
            match &outcome {
                Ok(_) => break,
                Err(err) => {
                    tracing::warn!(client = %current, error = %err, "player client failed, trying next");
                }
            }
            current = next;
            outcome = op(next).await;
        }

        match &outcome {
            Ok(_) => tracing::info!(client = %current, "player client succeeded"),
            Err(err) => tracing::warn!(client = %current, error = %err, "all player clients failed"),
        }
        outcome
    }
}
