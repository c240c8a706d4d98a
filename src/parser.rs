use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::descriptor::{
    DEFAULT_ALTER_ID, DEFAULT_TRANSPORT, DEFAULT_VMESS_CIPHER, Protocol, ProtocolOptions,
    ProxyDescriptor, synthesize_name,
};
use crate::error::{BundleError, DecodeError};
use crate::normalize::normalize;
use crate::subscription::{decode_base64, decode_base64_text};

const PREVIEW_LEN: usize = 32;

/// One bundle entry that did not become a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedItem {
    /// 1-based line (or `proxies:` entry) number.
    pub line: usize,
    pub preview: String,
    pub error: DecodeError,
}

impl SkippedItem {
    /// Unsupported schemes and duplicates are skipped; everything else is an error.
    pub fn is_error(&self) -> bool {
        bundle_item_is_error(&self.error)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecodedBundle {
    pub descriptors: Vec<ProxyDescriptor>,
    pub skipped: Vec<SkippedItem>,
}

impl DecodedBundle {
    pub fn succeeded(&self) -> usize {
        self.descriptors.len()
    }

    pub fn skipped_unsupported(&self) -> usize {
        self.skipped.iter().filter(|s| !s.is_error()).count()
    }

    pub fn errored(&self) -> usize {
        self.skipped.iter().filter(|s| s.is_error()).count()
    }
}

/// Decode a single share link. The result is not normalized.
pub fn decode_link(link: &str) -> Result<ProxyDescriptor, DecodeError> {
    let link = link.trim();
    if let Some(body) = link.strip_prefix("ss://") {
        decode_shadowsocks(body)
    } else if let Some(body) = link.strip_prefix("vmess://") {
        decode_vmess(body)
    } else if link.starts_with("trojan://") {
        decode_trojan(link)
    } else {
        let scheme = link.split_once("://").map(|(s, _)| s).unwrap_or(link);
        Err(DecodeError::UnsupportedProtocol(truncate(scheme, PREVIEW_LEN)))
    }
}

/// Decode a subscription blob: Base64 or plain text, either a list of share
/// links or a Clash document with a `proxies:` list.
///
/// Bad entries are collected in [`DecodedBundle::skipped`]; the call only
/// fails when nothing usable is left.
pub fn decode_bundle(blob: &str) -> Result<DecodedBundle, BundleError> {
    let compact: String = blob.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let content = match decode_base64_text(&compact) {
        Some(decoded) => {
            debug!("Subscription decoded from base64 ({} bytes)", decoded.len());
            decoded
        }
        None => blob.to_string(),
    };

    let entries = match clash_proxies(&content) {
        Some(proxies) => proxies
            .iter()
            .enumerate()
            .map(|(i, value)| (i + 1, preview_yaml(value), decode_clash_proxy(value)))
            .collect::<Vec<_>>(),
        None => content
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
            .map(|(n, line)| (n, truncate(line, PREVIEW_LEN), decode_link(line)))
            .collect(),
    };

    let mut bundle = DecodedBundle::default();
    let mut seen = HashSet::new();
    for (line, preview, result) in entries {
        let error = match result {
            Ok(descriptor) => {
                let descriptor = normalize(descriptor);
                if seen.insert(descriptor.name.clone()) {
                    bundle.descriptors.push(descriptor);
                    continue;
                }
                DecodeError::DuplicateName(descriptor.name)
            }
            Err(e) => e,
        };
        if bundle_item_is_error(&error) {
            warn!("Skipping entry {} ({}): {}", line, preview, error);
        } else {
            debug!("Skipping entry {} ({}): {}", line, preview, error);
        }
        bundle.skipped.push(SkippedItem {
            line,
            preview,
            error,
        });
    }

    if bundle.descriptors.is_empty() {
        return Err(BundleError::NoValidProxies {
            skipped: bundle.skipped.len(),
        });
    }
    Ok(bundle)
}

fn bundle_item_is_error(error: &DecodeError) -> bool {
    !matches!(
        error,
        DecodeError::UnsupportedProtocol(_) | DecodeError::DuplicateName(_)
    )
}

fn decode_shadowsocks(body: &str) -> Result<ProxyDescriptor, DecodeError> {
    let (body, name) = split_fragment(body);

    // ss://BASE64(method:password)@host:port first, then ss://BASE64(method:password@host:port).
    let userinfo_form = body.split_once('@').and_then(|(userinfo, endpoint)| {
        decode_base64(userinfo)
            .ok()
            .map(|raw| (raw, endpoint.to_string()))
    });
    let (userinfo, endpoint) = match userinfo_form {
        Some((raw, endpoint)) => (utf8(raw)?, endpoint),
        None => {
            let decoded = utf8(
                decode_base64(body).map_err(|e| DecodeError::InvalidBase64(e.to_string()))?,
            )?;
            let (userinfo, endpoint) = decoded
                .rsplit_once('@')
                .ok_or_else(|| DecodeError::MalformedUri("missing '@' in shadowsocks body".into()))?;
            (userinfo.to_string(), endpoint.to_string())
        }
    };

    let (cipher, password) = userinfo
        .split_once(':')
        .ok_or_else(|| DecodeError::MalformedUri("expected method:password".into()))?;
    if cipher.is_empty() {
        return Err(DecodeError::MalformedUri("empty shadowsocks method".into()));
    }
    // SIP002 plugin parameters follow the port.
    let endpoint = endpoint
        .split('?')
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');
    let (host, port) = split_host_port(endpoint)?;

    Ok(ProxyDescriptor {
        name: name.unwrap_or_else(|| synthesize_name(Protocol::Shadowsocks, &host, port)),
        host,
        port,
        tls: false,
        sni: None,
        skip_cert_verify: false,
        udp: None,
        options: ProtocolOptions::Shadowsocks {
            cipher: Some(cipher.to_string()),
            password: password.to_string(),
        },
    })
}

fn decode_vmess(body: &str) -> Result<ProxyDescriptor, DecodeError> {
    let raw = decode_base64(body).map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;
    let config: JsonValue =
        serde_json::from_slice(&raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let config = config
        .as_object()
        .ok_or_else(|| DecodeError::InvalidJson("vmess config is not an object".into()))?;

    let field = |key: &str| config.get(key).and_then(json_scalar).filter(|v| !v.is_empty());

    let host_header = field("host");
    let host = field("add")
        .or_else(|| host_header.clone())
        .ok_or(DecodeError::MissingField("add"))?;
    let port = field("port").ok_or(DecodeError::MissingField("port"))?;
    let port = parse_port(&port)?;
    let uuid = field("id").ok_or(DecodeError::MissingField("id"))?;

    let name = field("ps")
        .or_else(|| field("remarks"))
        .unwrap_or_else(|| synthesize_name(Protocol::Vmess, &host, port));
    let tls = field("tls").is_some_and(|t| t == "tls");
    let sni = field("sni").or_else(|| host_header.clone());

    Ok(ProxyDescriptor {
        name,
        host,
        port,
        tls,
        sni,
        skip_cert_verify: false,
        udp: None,
        options: ProtocolOptions::Vmess {
            uuid,
            alter_id: Some(field("aid").unwrap_or_else(|| DEFAULT_ALTER_ID.to_string())),
            cipher: Some(
                field("security")
                    .or_else(|| field("scy"))
                    .or_else(|| field("cipher"))
                    .unwrap_or_else(|| DEFAULT_VMESS_CIPHER.to_string()),
            ),
            network: Some(field("net").unwrap_or_else(|| DEFAULT_TRANSPORT.to_string())),
            path: field("path"),
            host_header,
        },
    })
}

fn decode_trojan(link: &str) -> Result<ProxyDescriptor, DecodeError> {
    let url = url::Url::parse(link).map_err(|e| DecodeError::MalformedUri(e.to_string()))?;

    if url.username().is_empty() {
        return Err(DecodeError::MissingField("password"));
    }
    let mut password = percent_decode(url.username());
    if let Some(rest) = url.password() {
        password = format!("{}:{}", password, percent_decode(rest));
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| DecodeError::MalformedUri("missing host".into()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = url
        .port()
        .filter(|p| *p != 0)
        .ok_or_else(|| DecodeError::MalformedUri("missing port".into()))?;

    let mut peer = None;
    let mut sni = None;
    let mut skip_cert_verify = false;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "peer" if !value.is_empty() => peer = Some(value.into_owned()),
            "sni" if !value.is_empty() => sni = Some(value.into_owned()),
            "allowInsecure" => skip_cert_verify = value == "1" || value == "true",
            _ => {}
        }
    }

    let name = url
        .fragment()
        .map(percent_decode)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| synthesize_name(Protocol::Trojan, &host, port));

    Ok(ProxyDescriptor {
        name,
        host,
        port,
        tls: true,
        sni: peer.or(sni),
        skip_cert_verify,
        udp: None,
        options: ProtocolOptions::Trojan { password },
    })
}

/// Convert one mapping of a Clash `proxies:` list.
pub fn decode_clash_proxy(value: &YamlValue) -> Result<ProxyDescriptor, DecodeError> {
    let map = value
        .as_mapping()
        .ok_or_else(|| DecodeError::MalformedUri("proxy entry is not a mapping".into()))?;
    let field = |key: &str| map.get(key).and_then(yaml_scalar).filter(|v| !v.is_empty());
    let flag = |key: &str| map.get(key).and_then(YamlValue::as_bool);

    let kind = field("type").ok_or(DecodeError::MissingField("type"))?;
    let host = field("server").ok_or(DecodeError::MissingField("server"))?;
    let port = parse_port(&field("port").ok_or(DecodeError::MissingField("port"))?)?;

    let (protocol, options, tls) = match kind.as_str() {
        "ss" | "shadowsocks" => (
            Protocol::Shadowsocks,
            ProtocolOptions::Shadowsocks {
                cipher: field("cipher"),
                password: field("password").ok_or(DecodeError::MissingField("password"))?,
            },
            false,
        ),
        "vmess" => {
            let ws_opts = map.get("ws-opts").and_then(YamlValue::as_mapping);
            let path = ws_opts
                .and_then(|o| o.get("path"))
                .and_then(yaml_scalar)
                .or_else(|| field("ws-path"));
            let host_header = ws_opts
                .and_then(|o| o.get("headers"))
                .and_then(|h| h.get("Host"))
                .and_then(yaml_scalar);
            (
                Protocol::Vmess,
                ProtocolOptions::Vmess {
                    uuid: field("uuid").ok_or(DecodeError::MissingField("uuid"))?,
                    alter_id: field("alterId"),
                    cipher: field("cipher"),
                    network: field("network"),
                    path,
                    host_header,
                },
                flag("tls").unwrap_or(false),
            )
        }
        "trojan" => (
            Protocol::Trojan,
            ProtocolOptions::Trojan {
                password: field("password").ok_or(DecodeError::MissingField("password"))?,
            },
            true,
        ),
        other => return Err(DecodeError::UnsupportedProtocol(other.to_string())),
    };

    Ok(ProxyDescriptor {
        name: field("name").unwrap_or_else(|| synthesize_name(protocol, &host, port)),
        host,
        port,
        tls,
        sni: field("sni").or_else(|| field("servername")),
        skip_cert_verify: flag("skip-cert-verify").unwrap_or(false),
        udp: flag("udp"),
        options,
    })
}

fn clash_proxies(content: &str) -> Option<Vec<YamlValue>> {
    let doc: YamlValue = serde_yaml::from_str(content).ok()?;
    doc.get("proxies")?.as_sequence().cloned()
}

fn split_fragment(body: &str) -> (&str, Option<String>) {
    match body.split_once('#') {
        Some((rest, fragment)) => {
            let name = percent_decode(fragment);
            (rest, Some(name).filter(|n| !n.is_empty()))
        }
        None => (body, None),
    }
}

fn split_host_port(endpoint: &str) -> Result<(String, u16), DecodeError> {
    let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| DecodeError::MalformedUri(format!("unterminated ipv6 host: {}", endpoint)))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| DecodeError::MalformedUri(format!("missing port: {}", endpoint)))?;
        (host, port)
    } else {
        endpoint
            .rsplit_once(':')
            .ok_or_else(|| DecodeError::MalformedUri(format!("expected host:port, got {}", endpoint)))?
    };
    if host.is_empty() {
        return Err(DecodeError::MalformedUri("empty host".into()));
    }
    Ok((host.to_string(), parse_port(port)?))
}

fn parse_port(port: &str) -> Result<u16, DecodeError> {
    match port.trim().parse::<u16>() {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(DecodeError::MalformedUri(format!("invalid port: {}", port))),
    }
}

fn json_scalar(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn yaml_scalar(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.trim().to_string()),
        YamlValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn percent_decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

fn utf8(raw: Vec<u8>) -> Result<String, DecodeError> {
    String::from_utf8(raw).map_err(|e| DecodeError::MalformedUri(e.to_string()))
}

fn preview_yaml(value: &YamlValue) -> String {
    value
        .get("name")
        .and_then(yaml_scalar)
        .unwrap_or_else(|| "<unnamed>".to_string())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
