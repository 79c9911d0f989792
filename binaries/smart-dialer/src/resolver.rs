//! Resolver Factory (component B): turns one [`DnsEntry`] into a queryable [`SmartResolver`].

use std::{net::IpAddr, net::SocketAddr, time::Duration};

use anyhow::Context;
use async_native_tls::TlsConnector;
use futures_concurrency::future::Join;
use futures_util::{AsyncReadExt, AsyncWriteExt};
use sillad::{dialer::Dialer, tcp::TcpDialer, Pipe};
use simple_dns::{Packet, TYPE};
use smol::net::UdpSocket;
use smol_timeout2::TimeoutExt;

use crate::{
    config::DnsEntry,
    dns_wire::{answer_addresses, build_query, random_query_id},
    error::{Result, SmartDialerError},
};

/// Per-query timeout used by every resolver transport. The DNS prober (component C) additionally
/// bounds the whole multi-query probe with the same constant.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// What a [`SmartResolver`] actually talks to on the wire.
enum Transport {
    /// The ambient OS resolver. Not wire-queryable; [`SmartResolver::resolve_system`] is the only
    /// usable entry point, and the DNS prober treats it specially.
    System,
    Udp { addr: SocketAddr },
    Tcp { addr: SocketAddr },
    Tls { addr: SocketAddr, sni: String },
    /// `client` is pinned (via `reqwest::ClientBuilder::resolve`) to the `SocketAddr` this
    /// resolver was built with, so the DoH request actually reaches that address even if the
    /// system resolver for `name` is itself censored or poisoned (§4.B).
    Https { url: String, client: reqwest::Client },
}

/// A DNS resolver candidate paired with the bookkeeping the prober and orchestrator need: a
/// human-readable id (for logs and cache signatures), the `secure` bit (true for DoT/DoH, meaning
/// the channel itself authenticates the answer so the prober can skip the CNAME sanity check),
/// and the originating [`DnsEntry`] (kept around for structural-equality cache resume).
pub struct SmartResolver {
    pub id: String,
    pub secure: bool,
    pub entry: DnsEntry,
    transport: Transport,
}

fn default_port_address(address: &str, default_port: u16) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    // bracketed IPv6 literal with an explicit port already has a closing `]:`; anything else
    // that contains a colon not inside brackets is assumed to already carry a port.
    if address.starts_with('[') && address.ends_with(']') {
        return format!("{address}:{default_port}");
    }
    if address.contains(':') {
        return address.to_string();
    }
    format!("{address}:{default_port}")
}

async fn resolve_one(address: &str) -> anyhow::Result<SocketAddr> {
    smol::net::resolve(address)
        .await?
        .into_iter()
        .next()
        .context("resolver address did not resolve to anything")
}

impl SmartResolver {
    /// Builds a resolver from one menu entry (component B). This only validates and resolves
    /// addresses; no network probing happens here.
    pub async fn from_entry(entry: &DnsEntry) -> Result<Self> {
        match entry {
            DnsEntry::System {} => Ok(Self {
                id: "system".to_string(),
                secure: false,
                entry: entry.clone(),
                transport: Transport::System,
            }),
            DnsEntry::Udp { address } => {
                let addr = resolve_one(&default_port_address(address, 53))
                    .await
                    .map_err(|e| SmartDialerError::ConfigParse(e.to_string()))?;
                Ok(Self {
                    id: format!("udp:{address}"),
                    secure: false,
                    entry: entry.clone(),
                    transport: Transport::Udp { addr },
                })
            }
            DnsEntry::Tcp { address } => {
                let addr = resolve_one(&default_port_address(address, 53))
                    .await
                    .map_err(|e| SmartDialerError::ConfigParse(e.to_string()))?;
                Ok(Self {
                    id: format!("tcp:{address}"),
                    secure: false,
                    entry: entry.clone(),
                    transport: Transport::Tcp { addr },
                })
            }
            DnsEntry::Dot { name, address } => {
                let host = address.clone().unwrap_or_else(|| name.clone());
                let addr = resolve_one(&default_port_address(&host, 853))
                    .await
                    .map_err(|e| SmartDialerError::ConfigParse(e.to_string()))?;
                Ok(Self {
                    id: format!("tls:{name}"),
                    secure: true,
                    entry: entry.clone(),
                    transport: Transport::Tls {
                        addr,
                        sni: name.clone(),
                    },
                })
            }
            DnsEntry::Doh { name, address } => {
                let host = address.clone().unwrap_or_else(|| name.clone());
                let addr = resolve_one(&default_port_address(&host, 443))
                    .await
                    .map_err(|e| SmartDialerError::ConfigParse(e.to_string()))?;
                let sni_host = name.trim_end_matches('.');
                let client = reqwest::ClientBuilder::new()
                    .resolve(sni_host, addr)
                    .build()
                    .map_err(|e| SmartDialerError::ConfigParse(e.to_string()))?;
                Ok(Self {
                    id: format!("https:{name}"),
                    secure: true,
                    entry: entry.clone(),
                    transport: Transport::Https {
                        url: format!("https://{name}/dns-query"),
                        client,
                    },
                })
            }
        }
    }

    /// Sends a raw DNS wire query and returns the raw wire response. Every transport except
    /// [`Transport::System`] supports this; calling it on `System` is a programmer error on the
    /// caller's part (the prober never does so).
    pub async fn query_raw(&self, query: &[u8]) -> anyhow::Result<Vec<u8>> {
        let fut = async {
            match &self.transport {
                Transport::System => anyhow::bail!("the system resolver is not wire-queryable"),
                Transport::Udp { addr } => {
                    let socket = UdpSocket::bind("0.0.0.0:0").await?;
                    socket.connect(addr).await?;
                    socket.send(query).await?;
                    let mut buf = [0u8; 4096];
                    let n = socket.recv(&mut buf).await?;
                    Ok(buf[..n].to_vec())
                }
                Transport::Tcp { addr } => {
                    let dialer = TcpDialer { dest_addr: *addr };
                    let pipe = dialer.dial().await?;
                    stream_query(pipe, query).await
                }
                Transport::Tls { addr, sni } => {
                    let dialer = sillad_native_tls::TlsDialer::new(
                        TcpDialer { dest_addr: *addr },
                        TlsConnector::new(),
                        sni.clone(),
                    );
                    let pipe = dialer.dial().await?;
                    stream_query(pipe, query).await
                }
                Transport::Https { url, client } => doh_query(client, url, query).await,
            }
        };
        fut.timeout(TEST_TIMEOUT)
            .await
            .context("resolver query timed out")?
    }

    /// Resolves `name` through the ambient OS resolver. Only usable for [`Transport::System`].
    pub async fn resolve_system(&self, name: &str) -> anyhow::Result<Vec<std::net::IpAddr>> {
        if !matches!(self.transport, Transport::System) {
            anyhow::bail!("resolve_system called on a non-system resolver");
        }
        let addrs = smol::net::resolve(format!("{name}:0"))
            .timeout(TEST_TIMEOUT)
            .await
            .context("system resolution timed out")??;
        Ok(addrs.into_iter().map(|a| a.ip()).collect())
    }

    pub fn is_system(&self) -> bool {
        matches!(self.transport, Transport::System)
    }

    /// Production-path lookup used by [`crate::host_dialer::DnsBoundHostDialer`] once this
    /// resolver has already won a probe: A and AAAA queries in parallel, merged. Unlike the
    /// prober, this does not re-apply the private/loopback sanity checks -- those vetted the
    /// resolver itself, not every individual future answer.
    pub async fn resolve(&self, name: &str) -> anyhow::Result<Vec<IpAddr>> {
        if self.is_system() {
            return self.resolve_system(name).await;
        }
        let a_query = build_query(random_query_id(), name, TYPE::A)?;
        let aaaa_query = build_query(random_query_id(), name, TYPE::AAAA)?;
        let (a_raw, aaaa_raw) = (
            self.query_raw(&a_query.build_bytes_vec_compressed()?),
            self.query_raw(&aaaa_query.build_bytes_vec_compressed()?),
        )
            .join()
            .await;

        let mut addrs = Vec::new();
        if let Ok(raw) = a_raw {
            if let Ok(packet) = Packet::parse(&raw) {
                addrs.extend(answer_addresses(&packet));
            }
        }
        if let Ok(raw) = aaaa_raw {
            if let Ok(packet) = Packet::parse(&raw) {
                addrs.extend(answer_addresses(&packet));
            }
        }
        if addrs.is_empty() {
            anyhow::bail!("no A/AAAA answers for {name}");
        }
        Ok(addrs)
    }
}

async fn stream_query<P: Pipe + Unpin>(mut pipe: P, query: &[u8]) -> anyhow::Result<Vec<u8>> {
    let len = u16::try_from(query.len()).context("query too large for a 2-byte length prefix")?;
    pipe.write_all(&len.to_be_bytes()).await?;
    pipe.write_all(query).await?;
    pipe.flush().await?;

    let mut len_buf = [0u8; 2];
    pipe.read_exact(&mut len_buf).await?;
    let resp_len = u16::from_be_bytes(len_buf) as usize;
    let mut resp = vec![0u8; resp_len];
    pipe.read_exact(&mut resp).await?;
    Ok(resp)
}

async fn doh_query(client: &reqwest::Client, url: &str, query: &[u8]) -> anyhow::Result<Vec<u8>> {
    let resp = client
        .post(url)
        .header("content-type", "application/dns-message")
        .header("accept", "application/dns-message")
        .body(query.to_vec())
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.bytes().await?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_address_appends_only_when_missing() {
        assert_eq!(default_port_address("1.1.1.1", 53), "1.1.1.1:53");
        assert_eq!(default_port_address("1.1.1.1:5353", 53), "1.1.1.1:5353");
        assert_eq!(default_port_address("dns.google", 443), "dns.google:443");
    }
}
