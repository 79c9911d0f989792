//! The Smart Dialer's own stream-dialer contract: unlike [`sillad::dialer::Dialer`], which is
//! bound to one fixed destination, a [`HostDialer`] accepts an arbitrary `"host:port"` address at
//! dial time (§6, "The returned StreamDialer accepts host:port addresses"). This is the type
//! `new_dialer` ultimately returns, and what the TLS and fallback searchers race.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use moka::future::Cache;
use sillad::{dialer::Dialer, tcp::HappyEyeballsTcpDialer};
use sillad::Pipe;

use crate::resolver::SmartResolver;

/// Bounded LRU for resolved addresses (§4.I step 4b): 100 entries, 60s TTL.
pub const DNS_CACHE_CAPACITY: u64 = 100;
pub const DNS_CACHE_TTL: Duration = Duration::from_secs(60);

#[async_trait]
pub trait HostDialer: Send + Sync {
    async fn dial_host(&self, addr: &str) -> std::io::Result<Box<dyn Pipe>>;
}

fn split_host_port(addr: &str) -> std::io::Result<(String, u16)> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{addr} is not a host:port address"),
        )
    })?;
    let port: u16 = port
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad port"))?;
    Ok((host.trim_start_matches('[').trim_end_matches(']').to_string(), port))
}

/// Routes through the ambient OS resolver and a plain TCP happy-eyeballs dial. Used only when the
/// system DNS entry wins the proxyless race (§4.I step 4b).
pub struct SystemHostDialer;

#[async_trait]
impl HostDialer for SystemHostDialer {
    async fn dial_host(&self, addr: &str) -> std::io::Result<Box<dyn Pipe>> {
        let addrs = smol::net::resolve(addr).await?;
        let pipe = HappyEyeballsTcpDialer(addrs).dial().await?;
        Ok(Box::new(pipe))
    }
}

/// Routes through a specific [`SmartResolver`] (any wire-queryable DNS entry), with a bounded LRU
/// cache in front of the resolver so repeated dials to the same host do not re-query (§4.I step
/// 4b, §5 "the LRU DNS cache is shared by the returned dialer").
pub struct DnsBoundHostDialer {
    resolver: Arc<SmartResolver>,
    cache: Cache<String, Vec<SocketAddr>>,
}

impl DnsBoundHostDialer {
    pub fn new(resolver: Arc<SmartResolver>) -> Self {
        Self {
            resolver,
            cache: Cache::builder()
                .max_capacity(DNS_CACHE_CAPACITY)
                .time_to_live(DNS_CACHE_TTL)
                .build(),
        }
    }
}

#[async_trait]
impl HostDialer for DnsBoundHostDialer {
    async fn dial_host(&self, addr: &str) -> std::io::Result<Box<dyn Pipe>> {
        let (host, port) = split_host_port(addr)?;
        let resolver = self.resolver.clone();
        let host_for_lookup = host.clone();
        let addrs = self
            .cache
            .try_get_with(addr.to_string(), async move {
                let ips = resolver.resolve(&host_for_lookup).await?;
                anyhow::Ok::<Vec<SocketAddr>>(
                    ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect(),
                )
            })
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let pipe = HappyEyeballsTcpDialer(addrs).dial().await?;
        Ok(Box::new(pipe))
    }
}
