//! Result Cache & Resume (component H). Grounded on the key-value `misc` table pattern used
//! elsewhere in this codebase for small persisted blobs, adapted to the Smart Dialer's own
//! `StrategyResultCache` contract (§6): `Get(key) -> (bytes, present)`, `Put(key, bytes|null)`.

use std::{path::Path, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{pool::PoolOptions, sqlite::SqliteConnectOptions, Row, SqlitePool};

use crate::config::{DnsEntry, FallbackEntry, StrategyConfig};

pub const WINNING_STRATEGY_KEY: &str = "winning_strategy";

/// The subset of a successful call's shape needed to reconstruct the next dialer deterministically
/// (§3). Exactly one of `Proxyless`/`Fallback` is ever stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WinningConfig {
    Proxyless {
        #[serde(default)]
        dns: Option<DnsEntry>,
        #[serde(default)]
        tls: Option<String>,
    },
    Fallback {
        entry: FallbackEntry,
    },
}

/// Abstract key→bytes store (§3, §6). The cache is advisory: a broken implementation must never
/// prevent `new_dialer` from succeeding, only slow down a warm start back to a cold one.
#[async_trait]
pub trait StrategyResultCache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    /// `None` removes the entry.
    async fn put(&self, key: &str, value: Option<Vec<u8>>) -> anyhow::Result<()>;
}

/// A SQLite-backed [`StrategyResultCache`], the same `misc(key, value)` shape used for other
/// small persisted blobs in this codebase.
pub struct SqliteResultCache {
    pool: SqlitePool,
}

impl SqliteResultCache {
    pub async fn open(path: Option<&Path>) -> anyhow::Result<Self> {
        let db_path = path
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| ":memory:".to_string());
        let options = SqliteConnectOptions::from_str(&db_path)?.create_if_missing(true);
        let pool = PoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .connect_lazy_with(options);

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS misc (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl StrategyResultCache for SqliteResultCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM misc WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn put(&self, key: &str, value: Option<Vec<u8>>) -> anyhow::Result<()> {
        match value {
            Some(bytes) => {
                sqlx::query(
                    "INSERT INTO misc (key, value) VALUES (?, ?) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )
                .bind(key)
                .bind(bytes)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM misc WHERE key = ?")
                    .bind(key)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Loads and parses the cached winner, per the resume contract's first step (§4.H): any failure
/// to read or parse is treated as "no cache", never surfaced as an error.
pub async fn load_cached_winner(cache: &dyn StrategyResultCache) -> Option<WinningConfig> {
    let bytes = match cache.get(WINNING_STRATEGY_KEY).await {
        Ok(Some(bytes)) => bytes,
        _ => return None,
    };
    serde_yaml::from_slice(&bytes).ok()
}

pub fn serialize_winner(winner: &WinningConfig) -> anyhow::Result<Vec<u8>> {
    Ok(serde_yaml::to_string(winner)?.into_bytes())
}

/// What the orchestrator should do given a cached winner and the current config (§4.H steps 2-3).
pub enum ResumePlan {
    /// Try this single fallback entry first, alone.
    FallbackFirstTry(FallbackEntry),
    /// `config`'s DNS/TLS lists have been reordered in place; run the normal search.
    Reordered,
    /// No usable cache; run the normal search with the original config.
    None,
}

/// Computes and applies a resume plan, mutating `config` in place for the `Reordered` case.
/// Equality is structural (§4.H "Equality is structural"); matching missing entries contributes
/// nothing, and the original list order is otherwise preserved.
pub fn plan_resume(config: &mut StrategyConfig, winner: Option<WinningConfig>) -> ResumePlan {
    match winner {
        None => ResumePlan::None,
        Some(WinningConfig::Fallback { entry }) => {
            if config.fallback.iter().any(|e| e == &entry) {
                ResumePlan::FallbackFirstTry(entry)
            } else {
                ResumePlan::None
            }
        }
        Some(WinningConfig::Proxyless { dns, tls }) => {
            let mut matched = false;
            if let Some(dns_entry) = dns {
                if let Some(pos) = config.dns.iter().position(|e| *e == dns_entry) {
                    let entry = config.dns.remove(pos);
                    config.dns.insert(0, entry);
                    matched = true;
                }
            }
            if let Some(tls_entry) = tls {
                if let Some(pos) = config.tls.iter().position(|e| *e == tls_entry) {
                    let entry = config.tls.remove(pos);
                    config.tls.insert(0, entry);
                    matched = true;
                }
            }
            if matched {
                ResumePlan::Reordered
            } else {
                ResumePlan::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_cache_round_trips() {
        smolscale::block_on(async {
            let cache = SqliteResultCache::open(None).await.unwrap();
            assert!(cache.get(WINNING_STRATEGY_KEY).await.unwrap().is_none());

            let winner = WinningConfig::Proxyless {
                dns: Some(DnsEntry::System {}),
                tls: Some("".to_string()),
            };
            let bytes = serialize_winner(&winner).unwrap();
            cache
                .put(WINNING_STRATEGY_KEY, Some(bytes.clone()))
                .await
                .unwrap();
            assert_eq!(
                cache.get(WINNING_STRATEGY_KEY).await.unwrap(),
                Some(bytes)
            );

            cache.put(WINNING_STRATEGY_KEY, None).await.unwrap();
            assert!(cache.get(WINNING_STRATEGY_KEY).await.unwrap().is_none());
        });
    }

    #[test]
    fn resume_moves_matching_dns_and_tls_to_front() {
        let mut config = StrategyConfig {
            dns: vec![
                DnsEntry::Udp {
                    address: "1.1.1.1".to_string(),
                },
                DnsEntry::System {},
            ],
            tls: vec!["".to_string(), "split:1".to_string()],
            fallback: vec![],
        };
        let winner = WinningConfig::Proxyless {
            dns: Some(DnsEntry::System {}),
            tls: Some("split:1".to_string()),
        };
        let plan = plan_resume(&mut config, Some(winner));
        assert!(matches!(plan, ResumePlan::Reordered));
        assert_eq!(config.dns[0], DnsEntry::System {});
        assert_eq!(config.tls[0], "split:1");
    }

    #[test]
    fn resume_ignores_a_winner_absent_from_the_current_config() {
        let mut config = StrategyConfig {
            dns: vec![DnsEntry::System {}],
            tls: vec![],
            fallback: vec![],
        };
        let winner = WinningConfig::Proxyless {
            dns: Some(DnsEntry::Udp {
                address: "9.9.9.9".to_string(),
            }),
            tls: None,
        };
        let plan = plan_resume(&mut config, Some(winner));
        assert!(matches!(plan, ResumePlan::None));
        assert_eq!(config.dns[0], DnsEntry::System {});
    }

    #[test]
    fn resume_picks_fallback_first_try_when_present() {
        let mut config = StrategyConfig {
            dns: vec![],
            tls: vec![],
            fallback: vec![FallbackEntry::Url("ss://a@1.2.3.4:1/".to_string())],
        };
        let winner = WinningConfig::Fallback {
            entry: FallbackEntry::Url("ss://a@1.2.3.4:1/".to_string()),
        };
        let plan = plan_resume(&mut config, Some(winner));
        assert!(matches!(plan, ResumePlan::FallbackFirstTry(_)));
    }
}
