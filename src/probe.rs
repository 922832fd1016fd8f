use std::time::Duration;

use reqwest::Proxy;
use tokio::time::Instant;

use crate::{node::DecodeError, xray::SynthesisError};

pub const DEFAULT_TARGET_URL: &str = "https://www.google.com/generate_204";

/// Why a node did not produce a latency sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    Decode(DecodeError),
    UnsupportedProtocol { protocol: String },
    ProcessStart { message: String },
    Timeout,
    Network { message: String },
}

impl ProbeFailure {
    /// Stable label used in logs and the run summary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::UnsupportedProtocol { .. } => "unsupported",
            Self::ProcessStart { .. } => "process_start",
            Self::Timeout => "timeout",
            Self::Network { .. } => "network",
        }
    }
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(err) => write!(f, "decode: {err}"),
            Self::UnsupportedProtocol { protocol } => write!(f, "unsupported protocol: {protocol}"),
            Self::ProcessStart { message } => write!(f, "process start: {message}"),
            Self::Timeout => write!(f, "probe timed out"),
            Self::Network { message } => write!(f, "network: {message}"),
        }
    }
}

impl std::error::Error for ProbeFailure {}

impl From<DecodeError> for ProbeFailure {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<SynthesisError> for ProbeFailure {
    fn from(err: SynthesisError) -> Self {
        match err {
            SynthesisError::Unsupported { protocol } => Self::UnsupportedProtocol { protocol },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success { latency_ms: u64 },
    Failure(ProbeFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Discovery position of the node in the input list.
    pub index: usize,
    pub raw: String,
    pub outcome: ProbeOutcome,
}

impl ProbeResult {
    pub fn latency_ms(&self) -> Option<u64> {
        match self.outcome {
            ProbeOutcome::Success { latency_ms } => Some(latency_ms),
            ProbeOutcome::Failure(_) => None,
        }
    }
}

/// Sends one GET to `target_url` through the SOCKS listener on `127.0.0.1:socks_port` and returns
/// the round-trip time in milliseconds. Any non-2xx status is a failure.
pub async fn probe_via_socks(
    socks_port: u16,
    target_url: &str,
    timeout: Duration,
) -> Result<u64, ProbeFailure> {
    // socks5h: the engine resolves the target, as it would for real traffic.
    let proxy = Proxy::all(format!("socks5h://127.0.0.1:{socks_port}")).map_err(network)?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
        .map_err(network)?;

    let t0 = Instant::now();
    let resp = match tokio::time::timeout(timeout, client.get(target_url).send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(err)) if err.is_timeout() => return Err(ProbeFailure::Timeout),
        Ok(Err(err)) => return Err(network(err)),
        Err(_) => return Err(ProbeFailure::Timeout),
    };
    let latency_ms = t0.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;

    if !resp.status().is_success() {
        return Err(ProbeFailure::Network {
            message: format!("unexpected status: {}", resp.status()),
        });
    }
    Ok(latency_ms)
}

fn network(err: reqwest::Error) -> ProbeFailure {
    ProbeFailure::Network {
        message: err.to_string(),
    }
}
