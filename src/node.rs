use std::sync::LazyLock;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::Url;

/// Default port for URI-style nodes that omit one (vless/trojan links are TLS-first).
const DEFAULT_URI_PORT: u16 = 443;

static BARE_HOST_PORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[A-Za-z][A-Za-z0-9+.\-]*://)?(?:[^@/\s]*@)?(\[[0-9A-Fa-f:.]+\]|[A-Za-z0-9._\-]+):(\d{1,5})(?:[/?#]\S*)?$",
    )
    .expect("bare host:port regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vmess => "vmess",
            Self::Vless => "vless",
            Self::Trojan => "trojan",
            Self::Shadowsocks => "ss",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "vmess" => Some(Self::Vmess),
            "vless" => Some(Self::Vless),
            "trojan" => Some(Self::Trojan),
            "ss" | "shadowsocks" => Some(Self::Shadowsocks),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmessAuth {
    pub id: String,
    pub alter_id: u32,
    pub security: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessAuth {
    pub id: String,
    pub flow: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanAuth {
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowsocksAuth {
    pub method: String,
    pub password: String,
}

/// Protocol-specific identity of a node. `Bare` nodes only expose an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Vmess(VmessAuth),
    Vless(VlessAuth),
    Trojan(TrojanAuth),
    Shadowsocks(ShadowsocksAuth),
    Bare { scheme: Option<String> },
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vmess(_) => Scheme::Vmess.as_str(),
            Self::Vless(_) => Scheme::Vless.as_str(),
            Self::Trojan(_) => Scheme::Trojan.as_str(),
            Self::Shadowsocks(_) => Scheme::Shadowsocks.as_str(),
            Self::Bare { .. } => "bare",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Tcp,
    WebSocket {
        path: String,
        host: Option<String>,
    },
    Http2 {
        path: String,
        host: Option<String>,
    },
}

impl Transport {
    fn from_parts(kind: Option<&str>, path: Option<String>, host: Option<String>) -> Self {
        let path = path.unwrap_or_default();
        let host = host.filter(|h| !h.trim().is_empty());
        match kind.map(|k| k.trim().to_ascii_lowercase()).as_deref() {
            Some("ws") | Some("websocket") => Self::WebSocket { path, host },
            Some("h2") | Some("http") => Self::Http2 { path, host },
            _ => Self::Tcp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsSettings {
    pub server_name: Option<String>,
    pub allow_insecure: bool,
}

/// A decoded node. `raw` is the exact input string and is what gets written back out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub raw: String,
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub transport: Transport,
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Empty,
    InvalidUtf8,
    Unrecognized,
    InvalidBase64 { scheme: Scheme },
    InvalidJson { reason: String },
    InvalidUri { reason: String },
    MissingField { field: &'static str },
    InvalidPort { value: String },
    InvalidHost { value: String },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty node string"),
            Self::InvalidUtf8 => write!(f, "node string is not valid utf-8"),
            Self::Unrecognized => write!(f, "not a scheme:// link or host:port"),
            Self::InvalidBase64 { scheme } => {
                write!(f, "invalid base64 payload in {} link", scheme.as_str())
            }
            Self::InvalidJson { reason } => write!(f, "invalid vmess json: {reason}"),
            Self::InvalidUri { reason } => write!(f, "invalid uri: {reason}"),
            Self::MissingField { field } => write!(f, "missing required field: {field}"),
            Self::InvalidPort { value } => write!(f, "invalid port: {value:?}"),
            Self::InvalidHost { value } => write!(f, "invalid host: {value:?}"),
        }
    }
}

impl std::error::Error for DecodeError {}

pub fn decode_bytes(raw: &[u8]) -> Result<ConnectionDescriptor, DecodeError> {
    let raw = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
    decode(raw)
}

pub fn decode(raw: &str) -> Result<ConnectionDescriptor, DecodeError> {
    let line = raw.trim();
    if line.is_empty() {
        return Err(DecodeError::Empty);
    }

    let scheme = line
        .split_once("://")
        .and_then(|(prefix, _)| Scheme::from_prefix(prefix).map(|s| (s, prefix.len() + 3)));

    match scheme {
        Some((Scheme::Vmess, body_at)) => decode_vmess(raw, &line[body_at..]),
        Some((Scheme::Vless, _)) => decode_vless(raw, line),
        Some((Scheme::Trojan, _)) => decode_trojan(raw, line),
        Some((Scheme::Shadowsocks, body_at)) => decode_shadowsocks(raw, &line[body_at..]),
        None => decode_bare(raw, line),
    }
}

fn decode_vmess(raw: &str, body: &str) -> Result<ConnectionDescriptor, DecodeError> {
    let bytes = decode_base64_padded(body).ok_or(DecodeError::InvalidBase64 {
        scheme: Scheme::Vmess,
    })?;
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|e| DecodeError::InvalidJson {
            reason: e.to_string(),
        })?;
    let obj = value.as_object().ok_or_else(|| DecodeError::InvalidJson {
        reason: "payload is not a json object".to_string(),
    })?;

    let field = |key: &str| json_scalar(obj.get(key)).filter(|v| !v.trim().is_empty());

    let host = field("add")
        .or_else(|| field("host"))
        .ok_or(DecodeError::MissingField { field: "add" })?;
    let host = validate_host(unbracket(host.trim()))?;
    let port = parse_port(&field("port").ok_or(DecodeError::MissingField { field: "port" })?)?;
    let id = field("id").ok_or(DecodeError::MissingField { field: "id" })?;
    let alter_id = field("aid")
        .or_else(|| field("alterId"))
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(0);
    let security = field("scy").unwrap_or_else(|| "auto".to_string());

    let transport = Transport::from_parts(field("net").as_deref(), field("path"), field("host"));
    let tls = field("tls")
        .filter(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "none" | "false" | "0"))
        .map(|_| TlsSettings {
            server_name: field("sni"),
            allow_insecure: false,
        });

    Ok(ConnectionDescriptor {
        raw: raw.to_string(),
        name: field("ps"),
        host,
        port,
        protocol: Protocol::Vmess(VmessAuth {
            id: id.trim().to_string(),
            alter_id,
            security,
        }),
        transport,
        tls,
    })
}

/// Shared shape of vless/trojan links: `scheme://credential@host:port?query#name`.
struct UriParts {
    credential: String,
    host: String,
    port: u16,
    query: Vec<(String, String)>,
    name: Option<String>,
}

impl UriParts {
    fn parse(line: &str) -> Result<Self, DecodeError> {
        let url = Url::parse(line).map_err(|e| DecodeError::InvalidUri {
            reason: e.to_string(),
        })?;

        let host = url
            .host_str()
            .map(unbracket)
            .filter(|h| !h.is_empty())
            .ok_or(DecodeError::MissingField { field: "host" })?;
        let host = validate_host(&percent_decode(host))?;
        let port = match url.port() {
            Some(0) => {
                return Err(DecodeError::InvalidPort {
                    value: "0".to_string(),
                });
            }
            Some(port) => port,
            None => DEFAULT_URI_PORT,
        };

        let query = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(Self {
            credential: percent_decode(url.username()),
            host,
            port,
            query,
            name: url
                .fragment()
                .map(percent_decode)
                .filter(|n| !n.trim().is_empty()),
        })
    }

    fn param(&self, key: &str) -> Option<String> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .filter(|v| !v.is_empty())
    }

    fn transport(&self) -> Transport {
        Transport::from_parts(
            self.param("type").as_deref(),
            self.param("path"),
            self.param("host"),
        )
    }

    fn tls_settings(&self) -> TlsSettings {
        TlsSettings {
            server_name: self.param("sni").or_else(|| self.param("peer")),
            allow_insecure: matches!(
                self.param("allowInsecure").as_deref(),
                Some("1") | Some("true")
            ),
        }
    }
}

fn decode_vless(raw: &str, line: &str) -> Result<ConnectionDescriptor, DecodeError> {
    let parts = UriParts::parse(line)?;
    if parts.credential.trim().is_empty() {
        return Err(DecodeError::MissingField { field: "id" });
    }

    let tls = parts
        .param("security")
        .filter(|s| s.eq_ignore_ascii_case("tls"))
        .map(|_| parts.tls_settings());

    Ok(ConnectionDescriptor {
        raw: raw.to_string(),
        name: parts.name.clone(),
        host: parts.host.clone(),
        port: parts.port,
        protocol: Protocol::Vless(VlessAuth {
            id: parts.credential.trim().to_string(),
            flow: parts.param("flow"),
        }),
        transport: parts.transport(),
        tls,
    })
}

fn decode_trojan(raw: &str, line: &str) -> Result<ConnectionDescriptor, DecodeError> {
    let parts = UriParts::parse(line)?;
    if parts.credential.is_empty() {
        return Err(DecodeError::MissingField { field: "password" });
    }

    // Trojan is TLS unless the link explicitly opts out.
    let tls = match parts.param("security") {
        Some(s) if s.eq_ignore_ascii_case("none") => None,
        _ => Some(parts.tls_settings()),
    };

    Ok(ConnectionDescriptor {
        raw: raw.to_string(),
        name: parts.name.clone(),
        host: parts.host.clone(),
        port: parts.port,
        protocol: Protocol::Trojan(TrojanAuth {
            password: parts.credential.clone(),
        }),
        transport: parts.transport(),
        tls,
    })
}

fn decode_shadowsocks(raw: &str, body: &str) -> Result<ConnectionDescriptor, DecodeError> {
    let (body, name) = match body.split_once('#') {
        Some((body, fragment)) => (body, Some(percent_decode(fragment))),
        None => (body, None),
    };
    // SIP002 plugin options follow `/?`; a bare trailing `/` may be part of the base64.
    let body = match body.split_once('?') {
        Some((body, _)) => body.strip_suffix('/').unwrap_or(body),
        None => body,
    };

    let (method, password, host_port) = match body.rsplit_once('@') {
        Some((userinfo, host_port)) => {
            let (method, password) = split_ss_userinfo(userinfo)?;
            (method, password, host_port.to_string())
        }
        None => {
            // Legacy form: the whole `method:password@host:port` is base64.
            let decoded = decode_base64_padded(body)
                .and_then(|b| String::from_utf8(b).ok())
                .ok_or(DecodeError::InvalidBase64 {
                    scheme: Scheme::Shadowsocks,
                })?;
            let (userinfo, host_port) = decoded
                .trim()
                .rsplit_once('@')
                .ok_or(DecodeError::MissingField { field: "host" })?;
            let (method, password) = split_ss_userinfo(userinfo)?;
            (method, password, host_port.to_string())
        }
    };

    let (host, port) = split_host_port(host_port.trim_end_matches('/'))?;

    Ok(ConnectionDescriptor {
        raw: raw.to_string(),
        name: name.filter(|n| !n.trim().is_empty()),
        host,
        port,
        protocol: Protocol::Shadowsocks(ShadowsocksAuth { method, password }),
        transport: Transport::Tcp,
        tls: None,
    })
}

fn split_ss_userinfo(userinfo: &str) -> Result<(String, String), DecodeError> {
    let plain = percent_decode(userinfo);
    let text = if plain.contains(':') {
        plain
    } else {
        decode_base64_padded(&plain)
            .and_then(|b| String::from_utf8(b).ok())
            .ok_or(DecodeError::InvalidBase64 {
                scheme: Scheme::Shadowsocks,
            })?
    };

    let (method, password) = text
        .split_once(':')
        .ok_or(DecodeError::MissingField { field: "password" })?;
    if method.trim().is_empty() {
        return Err(DecodeError::MissingField { field: "method" });
    }
    Ok((method.trim().to_string(), password.to_string()))
}

fn decode_bare(raw: &str, line: &str) -> Result<ConnectionDescriptor, DecodeError> {
    let caps = BARE_HOST_PORT
        .captures(line)
        .ok_or(DecodeError::Unrecognized)?;
    let host = validate_host(unbracket(&caps[1]))?;
    let port = parse_port(&caps[2])?;
    let scheme = line
        .split_once("://")
        .map(|(prefix, _)| prefix.to_ascii_lowercase());

    Ok(ConnectionDescriptor {
        raw: raw.to_string(),
        name: None,
        host,
        port,
        protocol: Protocol::Bare { scheme },
        transport: Transport::Tcp,
        tls: None,
    })
}

fn split_host_port(input: &str) -> Result<(String, u16), DecodeError> {
    let input = input.trim();
    let (host, port) = if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| DecodeError::InvalidHost {
                value: input.to_string(),
            })?;
        let port = tail
            .strip_prefix(':')
            .ok_or(DecodeError::MissingField { field: "port" })?;
        (host, port)
    } else {
        input
            .rsplit_once(':')
            .ok_or(DecodeError::MissingField { field: "port" })?
    };
    Ok((validate_host(host)?, parse_port(port)?))
}

fn parse_port(value: &str) -> Result<u16, DecodeError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(DecodeError::InvalidPort {
            value: value.to_string(),
        }),
    }
}

fn validate_host(host: &str) -> Result<String, DecodeError> {
    let ok = !host.is_empty()
        && host.len() <= 253
        && host
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'));
    if ok {
        Ok(host.to_string())
    } else {
        Err(DecodeError::InvalidHost {
            value: host.to_string(),
        })
    }
}

fn json_scalar(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => b.then(|| "true".to_string()),
        _ => None,
    }
}

/// Decodes base64 after normalising padding; falls back to the URL-safe alphabet.
pub(crate) fn decode_base64_padded(input: &str) -> Option<Vec<u8>> {
    let mut cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .trim_end_matches('=')
        .to_string();
    if cleaned.is_empty() {
        return None;
    }
    while cleaned.len() % 4 != 0 {
        cleaned.push('=');
    }
    STANDARD
        .decode(cleaned.as_bytes())
        .or_else(|_| URL_SAFE.decode(cleaned.as_bytes()))
        .ok()
}

fn percent_decode(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}

fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
