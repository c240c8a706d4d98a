use base64::{Engine, prelude::BASE64_STANDARD};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fmt;

pub const DEFAULT_SS_CIPHER: &str = "aes-256-gcm";
pub const DEFAULT_VMESS_CIPHER: &str = "auto";
pub const DEFAULT_ALTER_ID: &str = "0";
pub const DEFAULT_TRANSPORT: &str = "tcp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Shadowsocks,
    Vmess,
    Trojan,
}

impl Protocol {
    /// Prefix used when a descriptor has no name of its own.
    pub fn label(&self) -> &'static str {
        match self {
            Protocol::Shadowsocks => "SS",
            Protocol::Vmess => "VMess",
            Protocol::Trojan => "Trojan",
        }
    }

    pub fn clash_type(&self) -> &'static str {
        match self {
            Protocol::Shadowsocks => "ss",
            Protocol::Vmess => "vmess",
            Protocol::Trojan => "trojan",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.clash_type())
    }
}

/// Fields that only make sense for one protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolOptions {
    Shadowsocks {
        cipher: Option<String>,
        password: String,
    },
    Vmess {
        uuid: String,
        alter_id: Option<String>,
        cipher: Option<String>,
        network: Option<String>,
        path: Option<String>,
        host_header: Option<String>,
    },
    Trojan {
        password: String,
    },
}

/// Canonical record for one proxy endpoint and its credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default)]
    pub skip_cert_verify: bool,
    /// `None` means the source said nothing about UDP.
    #[serde(default)]
    pub udp: Option<bool>,
    #[serde(flatten)]
    pub options: ProtocolOptions,
}

impl ProxyDescriptor {
    pub fn protocol(&self) -> Protocol {
        match self.options {
            ProtocolOptions::Shadowsocks { .. } => Protocol::Shadowsocks,
            ProtocolOptions::Vmess { .. } => Protocol::Vmess,
            ProtocolOptions::Trojan { .. } => Protocol::Trojan,
        }
    }

    /// Password for shadowsocks and trojan, UUID for vmess.
    pub fn secret(&self) -> &str {
        match &self.options {
            ProtocolOptions::Shadowsocks { password, .. } => password,
            ProtocolOptions::Vmess { uuid, .. } => uuid,
            ProtocolOptions::Trojan { password } => password,
        }
    }

    pub fn cipher(&self) -> Option<&str> {
        match &self.options {
            ProtocolOptions::Shadowsocks { cipher, .. } | ProtocolOptions::Vmess { cipher, .. } => {
                cipher.as_deref()
            }
            ProtocolOptions::Trojan { .. } => None,
        }
    }

    pub fn alter_id(&self) -> Option<&str> {
        match &self.options {
            ProtocolOptions::Vmess { alter_id, .. } => alter_id.as_deref(),
            _ => None,
        }
    }

    pub fn transport(&self) -> Option<&str> {
        match &self.options {
            ProtocolOptions::Vmess { network, .. } => network.as_deref(),
            _ => None,
        }
    }

    pub fn udp_enabled(&self) -> bool {
        self.udp.unwrap_or(true)
    }

    pub fn synthesized_name(&self) -> String {
        synthesize_name(self.protocol(), &self.host, self.port)
    }

    /// Host as it must appear in `host:port`, bracketed for IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Render the descriptor back into its share link.
    pub fn to_link(&self) -> String {
        let fragment = urlencoding::encode(&self.name);
        match &self.options {
            ProtocolOptions::Shadowsocks { cipher, password } => {
                let method = cipher.as_deref().unwrap_or(DEFAULT_SS_CIPHER);
                let userinfo = BASE64_STANDARD.encode(format!("{}:{}", method, password));
                format!("ss://{}@{}#{}", userinfo, self.authority(), fragment)
            }
            ProtocolOptions::Vmess {
                uuid,
                alter_id,
                cipher,
                network,
                path,
                host_header,
            } => {
                let tls = if self.tls { "tls" } else { "" };
                let config = serde_json::json!({
                    "v": "2",
                    "ps": self.name,
                    "add": self.host,
                    "port": self.port.to_string(),
                    "id": uuid,
                    "aid": alter_id.as_deref().unwrap_or(DEFAULT_ALTER_ID),
                    "scy": cipher.as_deref().unwrap_or(DEFAULT_VMESS_CIPHER),
                    "net": network.as_deref().unwrap_or(DEFAULT_TRANSPORT),
                    "type": "none",
                    "host": host_header.as_deref().unwrap_or_default(),
                    "path": path.as_deref().unwrap_or_default(),
                    "tls": tls,
                    "sni": self.sni.as_deref().unwrap_or_default(),
                });
                format!("vmess://{}", BASE64_STANDARD.encode(config.to_string()))
            }
            ProtocolOptions::Trojan { password } => {
                let mut query = Vec::new();
                if let Some(sni) = &self.sni {
                    query.push(format!("sni={}", urlencoding::encode(sni)));
                }
                if self.skip_cert_verify {
                    query.push("allowInsecure=1".to_string());
                }
                let query = if query.is_empty() {
                    String::new()
                } else {
                    format!("?{}", query.join("&"))
                };
                format!(
                    "trojan://{}@{}{}#{}",
                    urlencoding::encode(password),
                    self.authority(),
                    query,
                    fragment
                )
            }
        }
    }

    /// Render one entry of a Clash `proxies:` list.
    pub fn to_clash_proxy(&self) -> Mapping {
        let mut map = Mapping::new();
        insert_str(&mut map, "name", &self.name);
        insert_str(&mut map, "type", self.protocol().clash_type());
        insert_str(&mut map, "server", &self.host);
        map.insert("port".into(), Value::Number(self.port.into()));
        map.insert("udp".into(), Value::Bool(self.udp_enabled()));

        match &self.options {
            ProtocolOptions::Shadowsocks { cipher, password } => {
                insert_str(&mut map, "cipher", cipher.as_deref().unwrap_or(DEFAULT_SS_CIPHER));
                insert_str(&mut map, "password", password);
            }
            ProtocolOptions::Vmess {
                uuid,
                alter_id,
                cipher,
                network,
                path,
                host_header,
            } => {
                insert_str(&mut map, "uuid", uuid);
                let alter_id = alter_id.as_deref().unwrap_or(DEFAULT_ALTER_ID);
                let alter_id = match alter_id.parse::<u16>() {
                    Ok(n) => Value::Number(n.into()),
                    Err(_) => Value::String(alter_id.to_string()),
                };
                map.insert("alterId".into(), alter_id);
                insert_str(&mut map, "cipher", cipher.as_deref().unwrap_or(DEFAULT_VMESS_CIPHER));
                let network = network.as_deref().unwrap_or(DEFAULT_TRANSPORT);
                insert_str(&mut map, "network", network);
                if self.tls {
                    map.insert("tls".into(), Value::Bool(true));
                    if let Some(sni) = &self.sni {
                        insert_str(&mut map, "servername", sni);
                    }
                    map.insert("skip-cert-verify".into(), Value::Bool(self.skip_cert_verify));
                }
                if network == "ws" {
                    let mut ws_opts = Mapping::new();
                    if let Some(path) = path.as_deref().filter(|p| !p.is_empty()) {
                        insert_str(&mut ws_opts, "path", path);
                    }
                    if let Some(host) = host_header.as_deref().filter(|h| !h.is_empty()) {
                        let mut headers = Mapping::new();
                        insert_str(&mut headers, "Host", host);
                        ws_opts.insert("headers".into(), Value::Mapping(headers));
                    }
                    if !ws_opts.is_empty() {
                        map.insert("ws-opts".into(), Value::Mapping(ws_opts));
                    }
                }
            }
            ProtocolOptions::Trojan { password } => {
                insert_str(&mut map, "password", password);
                if let Some(sni) = &self.sni {
                    insert_str(&mut map, "sni", sni);
                }
                map.insert("skip-cert-verify".into(), Value::Bool(self.skip_cert_verify));
            }
        }

        map
    }
}

pub fn synthesize_name(protocol: Protocol, host: &str, port: u16) -> String {
    format!("{}-{}:{}", protocol.label(), host, port)
}

/// Render a `proxies:` document for the given descriptors.
pub fn descriptors_to_clash_yaml(descriptors: &[ProxyDescriptor]) -> Result<String, serde_yaml::Error> {
    let proxies = descriptors
        .iter()
        .map(|d| Value::Mapping(d.to_clash_proxy()))
        .collect();
    let mut doc = Mapping::new();
    doc.insert("proxies".into(), Value::Sequence(proxies));
    serde_yaml::to_string(&doc)
}

fn insert_str(map: &mut Mapping, key: &str, value: &str) {
    map.insert(Value::String(key.to_string()), Value::String(value.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trojan() -> ProxyDescriptor {
        ProxyDescriptor {
            name: "HK 01".into(),
            host: "hk.example.com".into(),
            port: 443,
            tls: true,
            sni: Some("cdn.example.com".into()),
            skip_cert_verify: true,
            udp: None,
            options: ProtocolOptions::Trojan {
                password: "p@ss".into(),
            },
        }
    }

    #[test]
    fn trojan_link_carries_query_and_escaped_parts() {
        let link = trojan().to_link();
        assert_eq!(
            link,
            "trojan://p%40ss@hk.example.com:443?sni=cdn.example.com&allowInsecure=1#HK%2001"
        );
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let mut d = trojan();
        d.host = "2001:db8::1".into();
        assert_eq!(d.authority(), "[2001:db8::1]:443");
    }

    #[test]
    fn clash_proxy_for_vmess_ws() {
        let d = ProxyDescriptor {
            name: "JP".into(),
            host: "jp.example.com".into(),
            port: 8443,
            tls: true,
            sni: Some("jp.example.com".into()),
            skip_cert_verify: false,
            udp: Some(false),
            options: ProtocolOptions::Vmess {
                uuid: "b831381d-6324-4d53-ad4f-8cda48b30811".into(),
                alter_id: Some("0".into()),
                cipher: None,
                network: Some("ws".into()),
                path: Some("/ray".into()),
                host_header: Some("jp.example.com".into()),
            },
        };
        let map = d.to_clash_proxy();
        assert_eq!(map.get("type").and_then(Value::as_str), Some("vmess"));
        assert_eq!(map.get("alterId").and_then(Value::as_u64), Some(0));
        assert_eq!(map.get("cipher").and_then(Value::as_str), Some("auto"));
        assert_eq!(map.get("udp").and_then(Value::as_bool), Some(false));
        let ws = map.get("ws-opts").and_then(Value::as_mapping).unwrap();
        assert_eq!(ws.get("path").and_then(Value::as_str), Some("/ray"));
    }

    #[test]
    fn clash_yaml_document_lists_every_descriptor() {
        let yaml = descriptors_to_clash_yaml(&[trojan()]).unwrap();
        assert!(yaml.starts_with("proxies:"));
        assert!(yaml.contains("server: hk.example.com"));
    }
}
