//! Orchestrator (component I): wires components A-H together and implements the
//! resume+search+persist happy path (§4.I).

use std::sync::Arc;

use anyhow::Context as _;

use crate::{
    cache::{load_cached_winner, plan_resume, serialize_winner, ResumePlan, StrategyResultCache, WinningConfig, WINNING_STRATEGY_KEY},
    cancel::CancelToken,
    config::{parse_config, DnsEntry, StrategyConfig},
    error::{Result, SmartDialerError},
    fallback::{build_fallback_dialer, search_fallback, FallbackDialerFactory},
    host_dialer::{DnsBoundHostDialer, HostDialer, SystemHostDialer},
    prober::probe_end_to_end_all,
    race::staggered_race_default,
    resolver::SmartResolver,
    tls_search::search_tls_strategy,
};

/// Appends a trailing dot if missing, per §3 "test domains are canonicalized to fully qualified
/// form before probing".
pub fn canonicalize_domain(domain: &str) -> String {
    if domain.ends_with('.') {
        domain.to_string()
    } else {
        format!("{domain}.")
    }
}

/// The sole orchestrator entry point (§6). Races candidate circumvention strategies against
/// `test_domains` and returns a dialer backed by the first one observed to work end to end.
///
/// `cancel` is checked at every phase boundary and, inside each race, by the scheduler itself
/// (§4.D event (i)); once it fires, `new_dialer` returns [`SmartDialerError::Cancelled`] without
/// waiting out whatever candidates were still in flight (§7, §8 property 3). `fallback_factory`
/// is the extension point for fallback URL schemes this crate does not implement natively (e.g.
/// `ss://`) -- pass `None` to only ever use the built-in HTTP-CONNECT/SOCKS5/Psiphon dialers.
pub async fn new_dialer(
    test_domains: &[String],
    config_bytes: &[u8],
    cache: &dyn StrategyResultCache,
    cancel: &CancelToken,
    fallback_factory: Option<Arc<dyn FallbackDialerFactory>>,
) -> Result<Arc<dyn HostDialer>> {
    let mut config = parse_config(config_bytes)?;
    let test_domains: Vec<String> = test_domains.iter().map(|d| canonicalize_domain(d)).collect();

    let cached_winner = load_cached_winner(cache).await;
    let plan = plan_resume(&mut config, cached_winner);

    if let ResumePlan::FallbackFirstTry(entry) = &plan {
        if cancel.is_cancelled() {
            return Err(SmartDialerError::Cancelled);
        }
        if let Ok(dialer) =
            try_fallback_entry(entry, &test_domains, cancel, fallback_factory.as_ref()).await
        {
            persist_winner(cache, Some(WinningConfig::Fallback { entry: entry.clone() })).await;
            return Ok(dialer);
        }
        tracing::info!("cached fallback winner no longer works, running a full search");
    }

    if cancel.is_cancelled() {
        return Err(SmartDialerError::Cancelled);
    }

    match search_proxyless(&config, &test_domains, cancel).await {
        Ok((dialer, winner)) => {
            persist_winner(cache, Some(winner)).await;
            Ok(dialer)
        }
        Err(SmartDialerError::Cancelled) => Err(SmartDialerError::Cancelled),
        Err(proxyless_err) => {
            if config.fallback.is_empty() {
                persist_winner(cache, None).await;
                return Err(SmartDialerError::AllCandidatesFailed {
                    summary: proxyless_err.to_string(),
                });
            }
            match search_fallback(
                &config.fallback,
                &test_domains,
                cancel,
                fallback_factory.as_ref(),
            )
            .await
            {
                Ok(winner) => {
                    persist_winner(
                        cache,
                        Some(WinningConfig::Fallback {
                            entry: winner.entry,
                        }),
                    )
                    .await;
                    Ok(winner.dialer)
                }
                Err(SmartDialerError::Cancelled) => Err(SmartDialerError::Cancelled),
                Err(fallback_err) => {
                    persist_winner(cache, None).await;
                    Err(SmartDialerError::AllCandidatesFailed {
                        summary: format!("proxyless: {proxyless_err}; fallback: {fallback_err}"),
                    })
                }
            }
        }
    }
}

async fn try_fallback_entry(
    entry: &crate::config::FallbackEntry,
    test_domains: &[String],
    cancel: &CancelToken,
    factory: Option<&Arc<dyn FallbackDialerFactory>>,
) -> anyhow::Result<Arc<dyn HostDialer>> {
    if cancel.is_cancelled() {
        anyhow::bail!(SmartDialerError::Cancelled);
    }
    let dialer = build_fallback_dialer(entry, factory.map(|f| f.as_ref()))?;
    probe_end_to_end_all(dialer.as_ref(), test_domains).await?;
    Ok(dialer)
}

async fn persist_winner(cache: &dyn StrategyResultCache, winner: Option<WinningConfig>) {
    let value = match winner.as_ref().map(serialize_winner) {
        Some(Ok(bytes)) => Some(bytes),
        Some(Err(e)) => {
            tracing::debug!(err = %e, "failed to serialize winning config");
            None
        }
        None => None,
    };
    if let Err(e) = cache.put(WINNING_STRATEGY_KEY, value).await {
        tracing::debug!(err = %e, "strategy result cache write failed");
    }
}

/// The proxyless path (§4.I steps 4a-4d): race DNS, build a DNS-bound dialer, then (if any TLS
/// entries are configured) race TLS obfuscation atop it.
async fn search_proxyless(
    config: &StrategyConfig,
    test_domains: &[String],
    cancel: &CancelToken,
) -> Result<(Arc<dyn HostDialer>, WinningConfig)> {
    if config.dns.is_empty() {
        return Err(SmartDialerError::AllCandidatesFailed {
            summary: "no DNS entries configured".to_string(),
        });
    }

    let (dns_idx, resolver) = staggered_race_default(&config.dns, cancel, |_, entry| {
        let entry = entry.clone();
        let test_domains = test_domains.to_vec();
        async move {
            let resolver = SmartResolver::from_entry(&entry)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            probe_dns_against_all_domains(&resolver, &test_domains).await?;
            anyhow::Ok(resolver)
        }
    })
    .await?;

    let winning_dns_entry: DnsEntry = config.dns[dns_idx].clone();

    let base_dialer: Arc<dyn HostDialer> = if resolver.is_system() {
        Arc::new(SystemHostDialer)
    } else {
        Arc::new(DnsBoundHostDialer::new(Arc::new(resolver)))
    };

    if config.tls.is_empty() {
        return Ok((
            base_dialer,
            WinningConfig::Proxyless {
                dns: Some(winning_dns_entry),
                tls: None,
            },
        ));
    }

    let (tls_idx, dialer) =
        search_tls_strategy(&config.tls, base_dialer, test_domains, cancel).await?;
    let winning_tls_entry = config.tls[tls_idx].clone();

    Ok((
        dialer,
        WinningConfig::Proxyless {
            dns: Some(winning_dns_entry),
            tls: Some(winning_tls_entry),
        },
    ))
}

async fn probe_dns_against_all_domains(
    resolver: &SmartResolver,
    test_domains: &[String],
) -> anyhow::Result<()> {
    for domain in test_domains {
        crate::prober::probe_resolver(resolver, domain)
            .await
            .with_context(|| format!("DNS probe failed against {domain}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_appends_trailing_dot_once() {
        assert_eq!(canonicalize_domain("example.com"), "example.com.");
        assert_eq!(canonicalize_domain("example.com."), "example.com.");
    }
}
