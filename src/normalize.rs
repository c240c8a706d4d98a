use crate::descriptor::{
    DEFAULT_ALTER_ID, DEFAULT_SS_CIPHER, DEFAULT_TRANSPORT, DEFAULT_VMESS_CIPHER, ProtocolOptions,
    ProxyDescriptor,
};

/// Back-fill protocol defaults. Total and idempotent.
pub fn normalize(mut descriptor: ProxyDescriptor) -> ProxyDescriptor {
    if descriptor.name.trim().is_empty() {
        descriptor.name = descriptor.synthesized_name();
    }
    descriptor.udp.get_or_insert(true);

    match &mut descriptor.options {
        ProtocolOptions::Shadowsocks { cipher, .. } => {
            fill(cipher, DEFAULT_SS_CIPHER);
        }
        ProtocolOptions::Vmess {
            cipher,
            alter_id,
            network,
            ..
        } => {
            fill(cipher, DEFAULT_VMESS_CIPHER);
            fill(alter_id, DEFAULT_ALTER_ID);
            fill(network, DEFAULT_TRANSPORT);
        }
        ProtocolOptions::Trojan { .. } => {
            descriptor.tls = true;
        }
    }

    descriptor
}

fn fill(field: &mut Option<String>, default: &str) {
    if field.as_deref().is_none_or(|v| v.trim().is_empty()) {
        *field = Some(default.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Protocol;

    fn bare(options: ProtocolOptions) -> ProxyDescriptor {
        ProxyDescriptor {
            name: String::new(),
            host: "example.com".into(),
            port: 443,
            tls: false,
            sni: None,
            skip_cert_verify: false,
            udp: None,
            options,
        }
    }

    fn samples() -> Vec<ProxyDescriptor> {
        vec![
            bare(ProtocolOptions::Shadowsocks {
                cipher: None,
                password: "pw".into(),
            }),
            bare(ProtocolOptions::Vmess {
                uuid: "id".into(),
                alter_id: None,
                cipher: Some(String::new()),
                network: None,
                path: None,
                host_header: None,
            }),
            bare(ProtocolOptions::Trojan {
                password: "pw".into(),
            }),
        ]
    }

    #[test]
    fn fills_protocol_defaults() {
        let [ss, vmess, trojan]: [ProxyDescriptor; 3] =
            samples().into_iter().map(normalize).collect::<Vec<_>>().try_into().unwrap();

        assert_eq!(ss.cipher(), Some("aes-256-gcm"));
        assert_eq!(ss.name, "SS-example.com:443");
        assert_eq!(vmess.cipher(), Some("auto"));
        assert_eq!(vmess.alter_id(), Some("0"));
        assert_eq!(vmess.transport(), Some("tcp"));
        assert_eq!(trojan.protocol(), Protocol::Trojan);
        assert!(trojan.tls);
        assert!(!trojan.skip_cert_verify);
        for d in [&ss, &vmess, &trojan] {
            assert_eq!(d.udp, Some(true));
        }
    }

    #[test]
    fn keeps_explicit_values() {
        let mut d = bare(ProtocolOptions::Shadowsocks {
            cipher: Some("chacha20-ietf-poly1305".into()),
            password: "pw".into(),
        });
        d.name = "Mine".into();
        d.udp = Some(false);
        let d = normalize(d);
        assert_eq!(d.cipher(), Some("chacha20-ietf-poly1305"));
        assert_eq!(d.name, "Mine");
        assert_eq!(d.udp, Some(false));
    }

    #[test]
    fn is_idempotent() {
        for d in samples() {
            let once = normalize(d);
            assert_eq!(normalize(once.clone()), once);
        }
    }
}
