use std::net::Ipv6Addr;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::address::{Address, NetLocation};
use crate::doh::DEFAULT_DOH_URL;
use crate::uuid_util::{generate_uuid, parse_uuid};

const CONFIG_FILE: &str = "config.json";
const DEFAULT_PORT: u16 = 8000;

/// The retry target for upstreams that accept the dial but never answer.
/// Given as `host` or `host:port`; without an explicit port the retry uses
/// the port of the original request.
#[derive(Debug, Clone)]
pub struct FallbackAddr {
    address: Address,
    port: Option<u16>,
}

impl FallbackAddr {
    pub fn parse(s: &str) -> std::io::Result<Self> {
        // A bare IPv6 literal contains colons that are not a port separator.
        if let Ok(addr) = s.parse::<Ipv6Addr>() {
            return Ok(Self {
                address: Address::Ipv6(addr),
                port: None,
            });
        }

        let (host, port) = match s.rfind(':') {
            Some(i) => match s[i + 1..].parse::<u16>() {
                Ok(port) => (&s[..i], Some(port)),
                Err(_) => (s, None),
            },
            None => (s, None),
        };

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        Ok(Self {
            address: Address::from(host)?,
            port,
        })
    }

    pub fn to_location(&self, request_port: u16) -> NetLocation {
        NetLocation::new(self.address.clone(), self.port.unwrap_or(request_port))
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedConfig {
    uuid: String,
}

/// Process-wide configuration, assembled once at startup and immutable
/// afterwards.
#[derive(Debug)]
pub struct ServerConfig {
    pub user_uuid: [u8; 16],
    pub uuid_string: String,
    pub fallback: Option<FallbackAddr>,
    pub credit: String,
    pub doh_url: String,
    pub port: u16,
}

impl ServerConfig {
    /// Builds the configuration from the environment (`UUID`, `PROXYIP`,
    /// `CREDIT`, `PORT`) and the optional `config.json` in the working
    /// directory. A valid `UUID` env var wins over the file; otherwise the
    /// file's UUID is used, and when neither yields a valid UUID a fresh one
    /// is generated and persisted best-effort.
    pub async fn load() -> Self {
        let uuid_string = resolve_uuid().await;
        let user_uuid = parse_uuid(&uuid_string).expect("resolved uuid must be valid");

        let fallback = match std::env::var("PROXYIP") {
            Ok(value) if !value.trim().is_empty() => match FallbackAddr::parse(value.trim()) {
                Ok(fallback) => Some(fallback),
                Err(e) => {
                    warn!("Ignoring unparseable PROXYIP value: {e}");
                    None
                }
            },
            _ => None,
        };

        let credit = std::env::var("CREDIT").unwrap_or_else(|_| "wless".to_string());

        let port = match std::env::var("PORT") {
            Ok(value) => match value.parse::<u16>() {
                Ok(port) => port,
                Err(e) => {
                    warn!("Ignoring unparseable PORT value {value:?}: {e}");
                    DEFAULT_PORT
                }
            },
            Err(_) => DEFAULT_PORT,
        };

        Self {
            user_uuid,
            uuid_string,
            fallback,
            credit,
            doh_url: DEFAULT_DOH_URL.to_string(),
            port,
        }
    }
}

async fn resolve_uuid() -> String {
    if let Ok(value) = std::env::var("UUID") {
        let value = value.trim();
        if !value.is_empty() {
            match parse_uuid(value) {
                Ok(bytes) => {
                    // normalize to the canonical dashed form
                    return crate::uuid_util::format_uuid(&bytes);
                }
                Err(e) => {
                    warn!("Ignoring invalid UUID env var: {e}");
                }
            }
        }
    }

    match read_persisted_uuid().await {
        Some(uuid) => uuid,
        None => {
            let uuid = generate_uuid();
            info!("Generated new user id: {uuid}");
            write_persisted_uuid(&uuid).await;
            uuid
        }
    }
}

async fn read_persisted_uuid() -> Option<String> {
    let bytes = match tokio::fs::read(CONFIG_FILE).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Could not read {CONFIG_FILE}: {e}");
            return None;
        }
    };

    let persisted: PersistedConfig = match serde_json::from_slice(&bytes) {
        Ok(p) => p,
        Err(e) => {
            warn!("Could not parse {CONFIG_FILE}: {e}");
            return None;
        }
    };

    match parse_uuid(&persisted.uuid) {
        Ok(bytes) => Some(crate::uuid_util::format_uuid(&bytes)),
        Err(e) => {
            warn!("Ignoring invalid uuid in {CONFIG_FILE}: {e}");
            None
        }
    }
}

async fn write_persisted_uuid(uuid: &str) {
    let body = serde_json::to_vec_pretty(&PersistedConfig {
        uuid: uuid.to_string(),
    })
    .expect("persisted config must serialize");

    if let Err(e) = tokio::fs::write(CONFIG_FILE, body).await {
        // Non-fatal: the in-memory UUID stays valid for this process.
        warn!("Could not write {CONFIG_FILE}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_bare_host() {
        let fallback = FallbackAddr::parse("203.0.113.9").unwrap();
        assert_eq!(fallback.to_location(80).to_string(), "203.0.113.9:80");
        assert_eq!(fallback.to_location(443).to_string(), "203.0.113.9:443");
    }

    #[test]
    fn test_fallback_host_with_port() {
        let fallback = FallbackAddr::parse("proxy.example.com:8443").unwrap();
        assert_eq!(
            fallback.to_location(80).to_string(),
            "proxy.example.com:8443"
        );
    }

    #[test]
    fn test_fallback_bare_ipv6() {
        let fallback = FallbackAddr::parse("2001:db8::1").unwrap();
        assert_eq!(fallback.to_location(80).to_string(), "[2001:db8::1]:80");
    }

    #[test]
    fn test_fallback_bracketed_ipv6_with_port() {
        let fallback = FallbackAddr::parse("[2001:db8::1]:8443").unwrap();
        assert_eq!(fallback.to_location(80).to_string(), "[2001:db8::1]:8443");
    }

    #[test]
    fn test_persisted_config_shape() {
        let parsed: PersistedConfig =
            serde_json::from_str(r#"{"uuid": "e5185305-1984-4084-81e0-f77271159c62"}"#).unwrap();
        assert_eq!(parsed.uuid, "e5185305-1984-4084-81e0-f77271159c62");
    }
}
