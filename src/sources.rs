use std::{collections::HashSet, path::Path, sync::LazyLock, time::Duration};

use futures_util::future::join_all;
use regex::Regex;
use tracing::{info, warn};

use crate::node::decode_base64_padded;

static KNOWN_NODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"vmess://[A-Za-z0-9+/=._-]+|vless://\S+|ss://\S+|trojan://\S+")
        .expect("node regex")
});

static OTHER_NODE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[A-Za-z][A-Za-z0-9+.\-]*://\S+|(?:\[[0-9A-Fa-f:.]+\]|[A-Za-z0-9._\-]+):\d{1,5})$",
    )
    .expect("node line regex")
});

const KNOWN_PREFIXES: &[&str] = &["vmess://", "vless://", "trojan://", "ss://"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    Unavailable { source: String, message: String },
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable { source, message } => {
                write!(f, "source unavailable: {source}: {message}")
            }
        }
    }
}

impl std::error::Error for SourceError {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collected {
    pub nodes: Vec<String>,
    pub sources_ok: usize,
    pub sources_failed: usize,
}

/// Fetches every source concurrently and returns the de-duplicated nodes in source order.
/// Unreachable sources contribute nothing.
pub async fn collect(sources: &[String], fetch_timeout: Duration) -> Collected {
    let client = match reqwest::Client::builder().timeout(fetch_timeout).build() {
        Ok(client) => client,
        Err(err) => {
            warn!(%err, "build http client failed; only file sources will load");
            reqwest::Client::new()
        }
    };

    let fetched = join_all(sources.iter().map(|s| fetch_source(&client, s))).await;

    let mut collected = Collected::default();
    let mut texts = Vec::new();
    for res in fetched {
        match res {
            Ok(text) => {
                collected.sources_ok += 1;
                texts.push(text);
            }
            Err(err) => {
                collected.sources_failed += 1;
                warn!(error = %err, "skipping source");
            }
        }
    }

    collected.nodes = dedupe(
        texts
            .iter()
            .flat_map(|text| extract_nodes(&unwrap_body(text))),
    );
    info!(
        nodes = collected.nodes.len(),
        sources_ok = collected.sources_ok,
        sources_failed = collected.sources_failed,
        "collected nodes"
    );
    collected
}

pub async fn fetch_source(client: &reqwest::Client, source: &str) -> Result<String, SourceError> {
    let unavailable = |message: String| SourceError::Unavailable {
        source: source.to_string(),
        message,
    };

    if source.starts_with("http://") || source.starts_with("https://") {
        let resp = client
            .get(source)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(unavailable(format!("status {}", resp.status())));
        }
        resp.text().await.map_err(|e| unavailable(e.to_string()))
    } else {
        let bytes = tokio::fs::read(Path::new(source))
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Returns the decoded text when the whole body is base64 of a node list, otherwise the body.
pub fn unwrap_body(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.contains("://") {
        return text.to_string();
    }
    match decode_base64_padded(trimmed) {
        Some(bytes) => {
            let decoded = String::from_utf8_lossy(&bytes);
            if KNOWN_PREFIXES.iter().any(|p| decoded.contains(p)) {
                decoded.into_owned()
            } else {
                text.to_string()
            }
        }
        None => text.to_string(),
    }
}

pub fn extract_nodes(text: &str) -> Vec<String> {
    let mut nodes = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let before = nodes.len();
        nodes.extend(KNOWN_NODE.find_iter(line).map(|m| m.as_str().to_string()));
        if nodes.len() == before && OTHER_NODE_LINE.is_match(line) {
            nodes.push(line.to_string());
        }
    }
    nodes
}

pub fn dedupe(nodes: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    nodes
        .into_iter()
        .filter(|node| seen.insert(node.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use pretty_assertions::assert_eq;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    #[test]
    fn extracts_known_and_bare_nodes() {
        let text = "\
# comment line vmess://ignored
vmess://eyJhZGQiOiJhIn0=
  trojan://pw@t.example:443#Tokyo
see vless://id@v.example:443?type=ws and ss://YWVzOnB3@s.example:8388
hysteria2://pw@h.example:8443
1.2.3.4:8080
just some prose
";
        assert_eq!(
            extract_nodes(text),
            vec![
                "vmess://eyJhZGQiOiJhIn0=",
                "trojan://pw@t.example:443#Tokyo",
                "vless://id@v.example:443?type=ws",
                "ss://YWVzOnB3@s.example:8388",
                "hysteria2://pw@h.example:8443",
                "1.2.3.4:8080",
            ]
        );
    }

    #[test]
    fn unwraps_base64_bodies_only_when_they_hold_nodes() {
        let list = "trojan://pw@t.example:443\nss://YWVzOnB3@s.example:8388\n";
        let encoded = STANDARD.encode(list);
        assert_eq!(unwrap_body(&encoded), list);
        assert_eq!(unwrap_body(&format!("{encoded}\n")), list);

        let prose = STANDARD.encode("hello world");
        assert_eq!(unwrap_body(&prose), prose);
        assert_eq!(unwrap_body(list), list);
    }

    #[test]
    fn dedupe_keeps_first_seen_order() {
        let nodes = ["b", "a", "b", "c", "a"].map(String::from);
        assert_eq!(dedupe(nodes), vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn collect_merges_sources_and_survives_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(STANDARD.encode("trojan://pw@a.example:443\n")),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nodes.txt");
        std::fs::write(&file, "trojan://pw@a.example:443\ntrojan://pw@b.example:443\n").unwrap();

        let sources = vec![
            format!("{}/sub", server.uri()),
            format!("{}/gone", server.uri()),
            file.display().to_string(),
            dir.path().join("missing.txt").display().to_string(),
        ];
        let collected = collect(&sources, Duration::from_secs(5)).await;
        assert_eq!(
            collected,
            Collected {
                nodes: vec![
                    "trojan://pw@a.example:443".to_string(),
                    "trojan://pw@b.example:443".to_string(),
                ],
                sources_ok: 2,
                sources_failed: 2,
            }
        );
    }

    #[tokio::test]
    async fn http_error_status_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = fetch_source(&client, &server.uri()).await.unwrap_err();
        let SourceError::Unavailable { source, message } = err;
        assert_eq!(source, server.uri());
        assert!(message.contains("503"), "{message}");
    }
}
