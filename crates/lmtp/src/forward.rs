/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use ahash::AHashMap;
use base64::{engine::general_purpose::STANDARD, Engine};

/// `XRCPTFORWARD=<base64(key=value[\tkey=value]*)>` RCPT parameter carrying
/// identity metadata across a proxy hop. `proxy` and `originating-ip` are
/// consumed here; unknown keys are preserved since the set is open-ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardParams {
    pub proxy: Option<String>,
    pub originating_ip: Option<String>,
    pub variables: AHashMap<String, String>,
}

impl ForwardParams {
    pub fn decode(encoded: &str) -> Option<ForwardParams> {
        let decoded = STANDARD.decode(encoded).ok()?;
        let text = String::from_utf8(decoded).ok()?;

        let mut params = ForwardParams::default();
        for pair in text.split('\t') {
            let (key, value) = pair.split_once('=')?;
            match key {
                "proxy" => params.proxy = Some(value.to_string()),
                "originating-ip" => params.originating_ip = Some(value.to_string()),
                _ => {
                    params
                        .variables
                        .insert(key.to_string(), value.to_string());
                }
            }
        }
        Some(params)
    }

    pub fn encode(&self) -> String {
        let mut pairs = Vec::new();
        if let Some(proxy) = &self.proxy {
            pairs.push(format!("proxy={proxy}"));
        }
        if let Some(originating_ip) = &self.originating_ip {
            pairs.push(format!("originating-ip={originating_ip}"));
        }
        for (key, value) in &self.variables {
            pairs.push(format!("{key}={value}"));
        }
        STANDARD.encode(pairs.join("\t"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut params = ForwardParams {
            proxy: Some("10.0.0.5".to_string()),
            originating_ip: Some("203.0.113.9".to_string()),
            variables: AHashMap::new(),
        };
        params
            .variables
            .insert("session".to_string(), "abc123".to_string());

        let decoded = ForwardParams::decode(&params.encode()).unwrap();
        assert_eq!(decoded.proxy.as_deref(), Some("10.0.0.5"));
        assert_eq!(decoded.originating_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(decoded.variables.get("session").unwrap(), "abc123");
    }

    #[test]
    fn unknown_keys_survive() {
        let encoded = STANDARD.encode("proxy=1.2.3.4\tfuture-key=value");
        let decoded = ForwardParams::decode(&encoded).unwrap();
        assert_eq!(decoded.variables.get("future-key").unwrap(), "value");
    }

    #[test]
    fn rejects_garbage() {
        assert!(ForwardParams::decode("!!!").is_none());
        let encoded = STANDARD.encode("no-equals-sign");
        assert!(ForwardParams::decode(&encoded).is_none());
    }
}
