//! TLS-Strategy Searcher (component F): races obfuscation layers atop a DNS-qualified base
//! dialer, then wraps the winner so only TLS/DoT-shaped ports actually go through it.

use std::sync::Arc;

use crate::{
    cancel::CancelToken,
    host_dialer::HostDialer,
    obfs::{build_obfuscated_dialer, PortRoutingHostDialer},
    prober::probe_end_to_end_all,
    race::staggered_race_default,
};

/// Races `tls_entries` atop `base` (§4.F). Returns the winning entry's index and a dialer that
/// routes ports 443/853 through the obfuscated dialer and everything else through `base`.
pub async fn search_tls_strategy(
    tls_entries: &[String],
    base: Arc<dyn HostDialer>,
    test_domains: &[String],
    cancel: &CancelToken,
) -> crate::error::Result<(usize, Arc<dyn HostDialer>)> {
    let (idx, obfuscated) = staggered_race_default(tls_entries, cancel, |_, entry| {
        let base = base.clone();
        let test_domains = test_domains.to_vec();
        let entry = entry.clone();
        async move {
            let dialer = build_obfuscated_dialer(&entry, base)?;
            probe_end_to_end_all(dialer.as_ref(), &test_domains).await?;
            anyhow::Ok(dialer)
        }
    })
    .await?;

    let routed: Arc<dyn HostDialer> = Arc::new(PortRoutingHostDialer {
        obfuscated,
        base,
    });
    Ok((idx, routed))
}
