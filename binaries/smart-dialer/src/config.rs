//! Strategy schema and parser (component A).
//!
//! Parses the user-supplied YAML strategy menu into a typed [`StrategyConfig`]. Parsing is
//! strict: unknown fields at any level are rejected so that a typo in a strategy entry fails
//! loudly instead of silently being skipped during the race.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SmartDialerError};

/// One DNS resolver candidate. Exactly one variant is ever populated; the tag comes from the
/// YAML mapping key (`system`, `udp`, `tcp`, `tls`, `https`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum DnsEntry {
    /// The ambient OS resolver. Only usable when the base stream dialer is the plain TCP dialer.
    System {},
    /// DNS-over-UDP against `address`.
    Udp {
        address: String,
    },
    /// DNS-over-TCP against `address`.
    Tcp {
        address: String,
    },
    /// DNS-over-TLS. `name` is used as both the SNI and, if `address` is absent, the connect
    /// host; the default port is 853.
    #[serde(rename = "tls")]
    Dot {
        name: String,
        #[serde(default)]
        address: Option<String>,
    },
    /// DNS-over-HTTPS. `name` is the request host (and, absent `address`, the connect host);
    /// the default port is 443 and the request path is always `/dns-query`.
    #[serde(rename = "https")]
    Doh {
        name: String,
        #[serde(default)]
        address: Option<String>,
    },
}

/// One candidate fallback (full-proxy) strategy: either a bare URL-like string, or a structured
/// entry carrying an opaque configuration subtree under a recognized key.
///
/// The only recognized structured key today is `psiphon`; every other mapping shape is a parse
/// error. Parsed element-wise by YAML shape rather than via `#[serde(untagged)]`, which cannot
/// be combined with `deny_unknown_fields` and so cannot itself reject a mapping with an extra key
/// alongside `psiphon`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FallbackEntry {
    Url(String),
    Psiphon {
        psiphon: serde_yaml::Value,
    },
}

impl<'de> Deserialize<'de> for FallbackEntry {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::String(s) => Ok(FallbackEntry::Url(s)),
            serde_yaml::Value::Mapping(ref map) if map.len() == 1 => {
                match map.get(&serde_yaml::Value::String("psiphon".to_string())) {
                    Some(psiphon) => Ok(FallbackEntry::Psiphon {
                        psiphon: psiphon.clone(),
                    }),
                    None => Err(serde::de::Error::custom(
                        "fallback mapping must have a single `psiphon` key",
                    )),
                }
            }
            other => Err(serde::de::Error::custom(format!(
                "fallback entry must be a URL string or a single-key {{psiphon: ...}} mapping, got {other:?}"
            ))),
        }
    }
}

impl FallbackEntry {
    /// A short, log-safe description that never leaks bulky secret material.
    pub fn signature(&self) -> String {
        match self {
            FallbackEntry::Url(u) => {
                let scheme = u.split("://").next().unwrap_or(u);
                format!("{scheme}://...")
            }
            FallbackEntry::Psiphon { psiphon } => {
                let propagation_channel_id = psiphon
                    .get("PropagationChannelId")
                    .and_then(|v| v.as_str())
                    .unwrap_or("?");
                let sponsor_id = psiphon
                    .get("SponsorId")
                    .and_then(|v| v.as_str())
                    .unwrap_or("?");
                format!(
                    "Psiphon: {{PropagationChannelId: {propagation_channel_id}, SponsorId: {sponsor_id}}}"
                )
            }
        }
    }
}

/// The parsed strategy menu: three ordered candidate lists. List order is the user's tie-break
/// preference, consulted by the staggered race scheduler (component D) and by cache resume
/// (component H).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    #[serde(default)]
    pub dns: Vec<DnsEntry>,
    #[serde(default)]
    pub tls: Vec<String>,
    #[serde(default)]
    pub fallback: Vec<FallbackEntry>,
}

/// Parses a strategy menu from YAML (JSON parses fine too, since it is a YAML subset).
pub fn parse_config(bytes: &[u8]) -> Result<StrategyConfig> {
    serde_yaml::from_slice(bytes).map_err(|e| SmartDialerError::ConfigParse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_menu() {
        let yaml = r#"
dns:
  - system: {}
  - udp:
      address: "1.1.1.1"
  - https:
      name: "dns.google"
tls:
  - ""
  - "split:1"
fallback:
  - "ss://KEY@1.2.3.4:9999/"
  - psiphon:
      PropagationChannelId: "ABCD"
      SponsorId: "EFGH"
"#;
        let cfg = parse_config(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.dns.len(), 3);
        assert_eq!(cfg.dns[0], DnsEntry::System {});
        assert_eq!(
            cfg.dns[2],
            DnsEntry::Doh {
                name: "dns.google".to_string(),
                address: None
            }
        );
        assert_eq!(cfg.tls, vec!["".to_string(), "split:1".to_string()]);
        assert_eq!(cfg.fallback.len(), 2);
        assert!(matches!(cfg.fallback[0], FallbackEntry::Url(_)));
        assert!(matches!(cfg.fallback[1], FallbackEntry::Psiphon { .. }));
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let yaml = "dns: []\nbogus: 1\n";
        assert!(parse_config(yaml.as_bytes()).is_err());
    }

    #[test]
    fn rejects_unknown_dns_fields() {
        let yaml = "dns:\n  - udp:\n      address: \"1.1.1.1\"\n      bogus: 1\n";
        assert!(parse_config(yaml.as_bytes()).is_err());
    }

    #[test]
    fn rejects_dot_without_name() {
        let yaml = "dns:\n  - tls:\n      address: \"1.1.1.1\"\n";
        assert!(parse_config(yaml.as_bytes()).is_err());
    }

    #[test]
    fn rejects_malformed_fallback_shape() {
        let yaml = "fallback:\n  - nonsense_key: 1\n";
        assert!(parse_config(yaml.as_bytes()).is_err());
    }

    #[test]
    fn psiphon_signature_hides_secrets() {
        let entry = FallbackEntry::Psiphon {
            psiphon: serde_yaml::from_str(
                "PropagationChannelId: ABCD\nSponsorId: EFGH\nSecret: verysecret\n",
            )
            .unwrap(),
        };
        let sig = entry.signature();
        assert!(sig.contains("ABCD"));
        assert!(sig.contains("EFGH"));
        assert!(!sig.contains("verysecret"));
    }
}
