//! DNS Prober (component C) and End-to-End Dialer Prober (component E).

use std::time::Duration;

use anyhow::{bail, Context};
use async_native_tls::TlsConnector;
use futures_util::{AsyncReadExt, AsyncWriteExt};
use simple_dns::{Packet, RCODE, TYPE};
use smol_timeout2::TimeoutExt;

use crate::{
    addrcheck::is_globally_routable,
    dns_wire::{
        answer_addresses, answers_are_all_cname, build_query, first_question_name,
        is_empty_answer_with_single_soa, random_query_id, randomize_case,
    },
    host_dialer::HostDialer,
    resolver::{SmartResolver, TEST_TIMEOUT},
};

/// Validates `resolver` against `test_domain` per §4.C: a case-randomized A/AAAA query with
/// answer sanity checks, plus (for plaintext resolvers) a CNAME query.
pub async fn probe_resolver(resolver: &SmartResolver, test_domain: &str) -> anyhow::Result<()> {
    let randomized = randomize_case(test_domain);

    if resolver.is_system() {
        // The ambient OS resolver exposes no wire-level RCode/CNAME detail; we validate the one
        // thing we can observe, the returned addresses, and skip the CNAME step entirely since
        // there is no channel authentication either way to fall back on.
        let addrs = resolver
            .resolve_system(&randomized)
            .await
            .context("system resolution failed")?;
        if addrs.is_empty() {
            bail!("system resolver returned no addresses for {test_domain}");
        }
        if !addrs.iter().all(is_globally_routable) {
            bail!("system resolver returned a non-routable address for {test_domain}");
        }
        return Ok(());
    }

    validate_a_query(resolver, &randomized, test_domain).await?;

    if !resolver.secure {
        validate_cname_query(resolver, &randomized).await?;
    }

    Ok(())
}

async fn validate_a_query(
    resolver: &SmartResolver,
    randomized_name: &str,
    original_name: &str,
) -> anyhow::Result<()> {
    let query = build_query(random_query_id(), randomized_name, TYPE::A)?;
    let raw = resolver
        .query_raw(&query.build_bytes_vec_compressed()?)
        .await
        .context("A query failed")?;
    let response = Packet::parse(&raw).context("malformed A response")?;

    if response.rcode() != RCODE::NoError {
        bail!("A query got RCode {:?}", response.rcode());
    }

    let addrs = answer_addresses(&response);
    if addrs.is_empty() {
        bail!("A query for {original_name} returned no A/AAAA answers");
    }
    if !addrs.iter().all(is_globally_routable) {
        bail!("A query for {original_name} returned a non-routable address");
    }

    if !resolver.secure {
        let echoed = first_question_name(&response)
            .context("response to A query carries no question section")?;
        // simple_dns Names compare case-insensitively; we need the exact wire text instead to
        // catch a censor's forged answer that didn't bother echoing case.
        if echoed != randomized_name.trim_end_matches('.') && echoed != randomized_name {
            bail!("A response echoed a different-case question name");
        }
    }

    Ok(())
}

async fn validate_cname_query(
    resolver: &SmartResolver,
    randomized_name: &str,
) -> anyhow::Result<()> {
    let query = build_query(random_query_id(), randomized_name, TYPE::CNAME)?;
    let raw = resolver
        .query_raw(&query.build_bytes_vec_compressed()?)
        .await
        .context("CNAME query failed")?;
    let response = Packet::parse(&raw).context("malformed CNAME response")?;

    let accepted = answers_are_all_cname(&response) || is_empty_answer_with_single_soa(&response);
    if !accepted {
        bail!("CNAME query answer shape looks forged");
    }
    Ok(())
}

/// End-to-End Dialer Prober (component E): TCP→TLS→HTTP HEAD against `host`, bounded by
/// [`TEST_TIMEOUT`] end to end.
pub async fn probe_end_to_end(dialer: &dyn HostDialer, host: &str) -> anyhow::Result<()> {
    let fut = async {
        let pipe = dialer
            .dial_host(&format!("{host}:443"))
            .await
            .context("TCP dial failed")?;
        let connector = TlsConnector::new();
        let mut tls = connector
            .connect(host, pipe)
            .await
            .context("TLS handshake failed")?;

        let request = format!(
            "HEAD / HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"
        );
        tls.write_all(request.as_bytes())
            .await
            .context("failed to write HTTP request")?;
        tls.flush().await?;

        let mut buf = [0u8; 256];
        let n = tls
            .read(&mut buf)
            .await
            .context("failed to read HTTP response header")?;
        if n == 0 {
            bail!("connection closed before any response header was read");
        }
        Ok(())
    };
    fut.timeout(TEST_TIMEOUT)
        .await
        .context("end-to-end probe timed out")?
}

/// Runs [`probe_end_to_end`] sequentially across every test domain; all must succeed (§4.F, §4.G).
pub async fn probe_end_to_end_all(dialer: &dyn HostDialer, test_domains: &[String]) -> anyhow::Result<()> {
    for domain in test_domains {
        probe_end_to_end(dialer, domain)
            .await
            .with_context(|| format!("end-to-end probe failed against {domain}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_use_the_same_constant() {
        assert_eq!(TEST_TIMEOUT, Duration::from_secs(5));
    }
}
