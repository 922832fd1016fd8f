use serde_json::{Value, json};

use crate::node::{ConnectionDescriptor, Protocol, Transport};

pub const INBOUND_TAG: &str = "probe-in";
pub const OUTBOUND_TAG: &str = "probe-out";
pub const DIRECT_TAG: &str = "direct";

/// The node-specific outbound, independent of the local listen port.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound(Value);

impl Outbound {
    pub fn protocol(&self) -> &str {
        self.0["protocol"].as_str().unwrap_or_default()
    }
}

/// A complete single-node Xray configuration: one local SOCKS inbound, the node outbound and a
/// `freedom` fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    value: Value,
}

impl EngineConfig {
    pub fn assemble(outbound: &Outbound, listen_port: u16) -> Self {
        let value = json!({
            "log": { "loglevel": "none" },
            "inbounds": [{
                "tag": INBOUND_TAG,
                "listen": "127.0.0.1",
                "port": listen_port,
                "protocol": "socks",
                "settings": {
                    "auth": "noauth",
                    "udp": false
                },
                "sniffing": { "enabled": false }
            }],
            "outbounds": [
                outbound.0,
                { "tag": DIRECT_TAG, "protocol": "freedom" }
            ],
            "routing": { "domainStrategy": "AsIs" }
        });
        Self { value }
    }

    pub fn as_json(&self) -> &Value {
        &self.value
    }

    pub fn to_vec_pretty(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    Unsupported { protocol: String },
}

impl std::fmt::Display for SynthesisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsupported { protocol } => {
                write!(f, "no engine outbound for protocol: {protocol}")
            }
        }
    }
}

impl std::error::Error for SynthesisError {}

pub fn synthesize(
    descriptor: &ConnectionDescriptor,
    listen_port: u16,
) -> Result<EngineConfig, SynthesisError> {
    let outbound = build_outbound(descriptor)?;
    Ok(EngineConfig::assemble(&outbound, listen_port))
}

pub fn build_outbound(descriptor: &ConnectionDescriptor) -> Result<Outbound, SynthesisError> {
    let address = descriptor.host.as_str();
    let port = descriptor.port;

    let (protocol, settings) = match &descriptor.protocol {
        Protocol::Vmess(auth) => (
            "vmess",
            json!({
                "vnext": [{
                    "address": address,
                    "port": port,
                    "users": [{
                        "id": auth.id,
                        "alterId": auth.alter_id,
                        "security": auth.security
                    }]
                }]
            }),
        ),
        Protocol::Vless(auth) => {
            let mut user = json!({ "id": auth.id, "encryption": "none" });
            if let Some(flow) = auth.flow.as_deref().filter(|f| !f.is_empty()) {
                user["flow"] = json!(flow);
            }
            (
                "vless",
                json!({
                    "vnext": [{
                        "address": address,
                        "port": port,
                        "users": [user]
                    }]
                }),
            )
        }
        Protocol::Trojan(auth) => (
            "trojan",
            json!({
                "servers": [{
                    "address": address,
                    "port": port,
                    "password": auth.password
                }]
            }),
        ),
        Protocol::Shadowsocks(auth) => (
            "shadowsocks",
            json!({
                "servers": [{
                    "address": address,
                    "port": port,
                    "method": auth.method,
                    "password": auth.password
                }]
            }),
        ),
        Protocol::Bare { scheme } => {
            return Err(SynthesisError::Unsupported {
                protocol: scheme.clone().unwrap_or_else(|| "host:port".to_string()),
            });
        }
    };

    Ok(Outbound(json!({
        "tag": OUTBOUND_TAG,
        "protocol": protocol,
        "settings": settings,
        "streamSettings": stream_settings(descriptor)
    })))
}

fn stream_settings(descriptor: &ConnectionDescriptor) -> Value {
    let mut stream = match &descriptor.transport {
        Transport::Tcp => json!({ "network": "tcp" }),
        Transport::WebSocket { path, host } => {
            let mut ws = json!({ "path": ws_path(path) });
            if let Some(host) = host {
                ws["headers"] = json!({ "Host": host });
            }
            json!({ "network": "ws", "wsSettings": ws })
        }
        Transport::Http2 { path, host } => {
            let mut http = json!({ "path": ws_path(path) });
            if let Some(host) = host {
                http["host"] = json!([host]);
            }
            json!({ "network": "http", "httpSettings": http })
        }
    };

    if let Some(tls) = &descriptor.tls {
        let server_name = tls.server_name.clone().or_else(|| match &descriptor.transport {
            Transport::WebSocket { host, .. } | Transport::Http2 { host, .. } => host.clone(),
            Transport::Tcp => None,
        });
        let mut tls_settings = json!({ "allowInsecure": tls.allow_insecure });
        if let Some(server_name) = server_name {
            tls_settings["serverName"] = json!(server_name);
        }
        stream["security"] = json!("tls");
        stream["tlsSettings"] = tls_settings;
    }

    stream
}

fn ws_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}
