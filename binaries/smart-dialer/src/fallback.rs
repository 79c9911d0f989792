//! Fallback Searcher (component G) and the configurable-dialer module's fallback half: builds a
//! [`HostDialer`] out of each [`FallbackEntry`] and races them (§4.G). The protocols themselves
//! (Shadowsocks, SOCKS5, HTTP CONNECT, Psiphon) are external collaborators per §6 -- the core only
//! needs to select and invoke one. HTTP CONNECT and SOCKS5 are simple enough to implement directly
//! here; Psiphon is gated behind its own build feature; any other scheme (including `ss://`) is
//! handed to an injectable [`FallbackDialerFactory`] if the caller supplied one, and only surfaces
//! `UnsupportedFallback` when it didn't.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{AsyncReadExt, AsyncWriteExt};
use sillad::{dialer::Dialer, Pipe};

use crate::{
    cancel::CancelToken,
    config::FallbackEntry,
    error::{Result, SmartDialerError},
    host_dialer::HostDialer,
    prober::probe_end_to_end_all,
    race::staggered_race_default,
};

/// External collaborator extension point (§6, "Configurable-dialer module"): builds a
/// [`HostDialer`] for a fallback entry whose URL scheme `build_fallback_dialer` does not
/// implement natively. A caller that needs `ss://` (or any other scheme) supplies one of these to
/// [`crate::new_dialer`] rather than this crate re-implementing every protocol in existence.
pub trait FallbackDialerFactory: Send + Sync {
    fn build(&self, entry: &FallbackEntry) -> Result<Arc<dyn HostDialer>>;
}

/// A fallback candidate paired with the log-safe signature the winner is recorded under (§4.G).
pub struct FallbackWinner {
    pub entry: FallbackEntry,
    pub signature: String,
    pub dialer: Arc<dyn HostDialer>,
}

pub async fn search_fallback(
    entries: &[FallbackEntry],
    test_domains: &[String],
    cancel: &CancelToken,
    factory: Option<&Arc<dyn FallbackDialerFactory>>,
) -> crate::error::Result<FallbackWinner> {
    let (idx, dialer) = staggered_race_default(entries, cancel, |_, entry| {
        let entry = entry.clone();
        let test_domains = test_domains.to_vec();
        let factory = factory.cloned();
        async move {
            let dialer = build_fallback_dialer(&entry, factory.as_deref())?;
            probe_end_to_end_all(dialer.as_ref(), &test_domains).await?;
            anyhow::Ok(dialer)
        }
    })
    .await?;

    let entry = entries[idx].clone();
    Ok(FallbackWinner {
        signature: entry.signature(),
        entry,
        dialer,
    })
}

/// Builds a dialer for a single fallback entry, dispatching by URL scheme / structured key.
pub fn build_fallback_dialer(
    entry: &FallbackEntry,
    factory: Option<&dyn FallbackDialerFactory>,
) -> Result<Arc<dyn HostDialer>> {
    match entry {
        FallbackEntry::Url(url) => {
            let parsed = url::Url::parse(url)
                .map_err(|e| SmartDialerError::ConfigParse(format!("bad fallback URL: {e}")))?;
            match parsed.scheme() {
                "http" => Ok(Arc::new(HttpConnectHostDialer::from_url(&parsed)?)),
                "socks5" => Ok(Arc::new(Socks5HostDialer::from_url(&parsed)?)),
                scheme => match factory {
                    Some(factory) => factory.build(entry),
                    None => Err(SmartDialerError::UnsupportedFallback(format!(
                        "unrecognized fallback scheme {scheme}; no dialer factory was supplied for it"
                    ))),
                },
            }
        }
        FallbackEntry::Psiphon { .. } => build_psiphon_dialer(entry),
    }
}

#[cfg(feature = "psiphon")]
fn build_psiphon_dialer(entry: &FallbackEntry) -> Result<Arc<dyn HostDialer>> {
    let FallbackEntry::Psiphon { psiphon } = entry else {
        unreachable!()
    };
    Ok(Arc::new(crate::psiphon_ffi::PsiphonHostDialer::start(
        psiphon,
    )?))
}

#[cfg(not(feature = "psiphon"))]
fn build_psiphon_dialer(_entry: &FallbackEntry) -> Result<Arc<dyn HostDialer>> {
    Err(SmartDialerError::UnsupportedFallback(
        "this build was not compiled with the psiphon feature".to_string(),
    ))
}

fn proxy_userinfo(url: &url::Url) -> Option<(String, String)> {
    if url.username().is_empty() {
        None
    } else {
        Some((
            url.username().to_string(),
            url.password().unwrap_or("").to_string(),
        ))
    }
}

fn proxy_host_port(url: &url::Url, default_port: u16) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| SmartDialerError::ConfigParse("fallback URL has no host".to_string()))?;
    Ok(format!("{host}:{}", url.port().unwrap_or(default_port)))
}

/// HTTP proxy fallback: issues a plaintext `CONNECT host:port` to the configured proxy and hands
/// back the raw tunneled pipe.
struct HttpConnectHostDialer {
    proxy_addr: String,
    auth: Option<(String, String)>,
}

impl HttpConnectHostDialer {
    fn from_url(url: &url::Url) -> Result<Self> {
        Ok(Self {
            proxy_addr: proxy_host_port(url, 8080)?,
            auth: proxy_userinfo(url),
        })
    }
}

#[async_trait]
impl HostDialer for HttpConnectHostDialer {
    async fn dial_host(&self, addr: &str) -> std::io::Result<Box<dyn Pipe>> {
        let resolved = smol::net::resolve(&self.proxy_addr).await?;
        let dest_addr = resolved
            .into_iter()
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "proxy did not resolve"))?;
        let mut pipe = sillad::tcp::TcpDialer { dest_addr }.dial().await?;

        let mut request = format!("CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n");
        if let Some((user, pass)) = &self.auth {
            use base64::Engine;
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{user}:{pass}"));
            request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
        }
        request.push_str("\r\n");

        pipe.write_all(request.as_bytes()).await?;
        pipe.flush().await?;

        let mut buf = [0u8; 1024];
        let n = pipe.read(&mut buf).await?;
        let response = String::from_utf8_lossy(&buf[..n]);
        let status_line = response.lines().next().unwrap_or("");
        if !status_line.contains(" 200 ") {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("HTTP proxy CONNECT failed: {status_line}"),
            ));
        }
        Ok(Box::new(pipe))
    }
}

/// SOCKS5 fallback (RFC 1928): no-auth or username/password subnegotiation, then a CONNECT
/// request. Mirrors the byte-level framing the server side already speaks elsewhere in this
/// codebase, just from the client's chair.
struct Socks5HostDialer {
    proxy_addr: String,
    auth: Option<(String, String)>,
}

impl Socks5HostDialer {
    fn from_url(url: &url::Url) -> Result<Self> {
        Ok(Self {
            proxy_addr: proxy_host_port(url, 1080)?,
            auth: proxy_userinfo(url),
        })
    }
}

#[async_trait]
impl HostDialer for Socks5HostDialer {
    async fn dial_host(&self, addr: &str) -> std::io::Result<Box<dyn Pipe>> {
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad host:port")
        })?;
        let port: u16 = port
            .parse()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad port"))?;

        let resolved = smol::net::resolve(&self.proxy_addr).await?;
        let dest_addr = resolved
            .into_iter()
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "proxy did not resolve"))?;
        let mut pipe = sillad::tcp::TcpDialer { dest_addr }.dial().await?;

        // Greeting: version 5, offer no-auth and, if we have credentials, user/pass.
        let methods: &[u8] = if self.auth.is_some() { &[0x00, 0x02] } else { &[0x00] };
        let mut greeting = vec![0x05, methods.len() as u8];
        greeting.extend_from_slice(methods);
        pipe.write_all(&greeting).await?;
        pipe.flush().await?;

        let mut chosen = [0u8; 2];
        pipe.read_exact(&mut chosen).await?;
        if chosen[0] != 0x05 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "proxy did not speak SOCKS5",
            ));
        }
        match chosen[1] {
            0x00 => {}
            0x02 => {
                let (user, pass) = self.auth.as_ref().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "proxy demanded auth")
                })?;
                let mut req = vec![0x01, user.len() as u8];
                req.extend_from_slice(user.as_bytes());
                req.push(pass.len() as u8);
                req.extend_from_slice(pass.as_bytes());
                pipe.write_all(&req).await?;
                pipe.flush().await?;
                let mut resp = [0u8; 2];
                pipe.read_exact(&mut resp).await?;
                if resp[1] != 0x00 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "SOCKS5 auth rejected",
                    ));
                }
            }
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "proxy requires an unsupported auth method",
                ));
            }
        }

        // CONNECT request, domain-name address type (0x03).
        let mut req = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
        req.extend_from_slice(host.as_bytes());
        req.extend_from_slice(&port.to_be_bytes());
        pipe.write_all(&req).await?;
        pipe.flush().await?;

        let mut reply_head = [0u8; 4];
        pipe.read_exact(&mut reply_head).await?;
        if reply_head[1] != 0x00 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("SOCKS5 CONNECT failed with reply code {}", reply_head[1]),
            ));
        }
        // Skip the bound address the server echoes back: it is sized by address type.
        let skip = match reply_head[3] {
            0x01 => 4,
            0x03 => {
                let mut len = [0u8];
                pipe.read_exact(&mut len).await?;
                len[0] as usize
            }
            0x04 => 16,
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "unknown SOCKS5 bound address type",
                ))
            }
        };
        let mut discard = vec![0u8; skip + 2];
        pipe.read_exact(&mut discard).await?;

        Ok(Box::new(pipe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ss_scheme_is_unsupported_without_a_dialer_factory() {
        let entry = FallbackEntry::Url("ss://YWVzLTI1Ni1nY206cGFzcw==@1.2.3.4:9999/".to_string());
        assert!(build_fallback_dialer(&entry, None).is_err());
    }

    #[test]
    fn unknown_scheme_is_rejected_without_a_dialer_factory() {
        let entry = FallbackEntry::Url("ftp://1.2.3.4/".to_string());
        assert!(build_fallback_dialer(&entry, None).is_err());
    }

    struct StubFactory;

    impl FallbackDialerFactory for StubFactory {
        fn build(&self, _entry: &FallbackEntry) -> Result<Arc<dyn HostDialer>> {
            Ok(Arc::new(HttpConnectHostDialer {
                proxy_addr: "1.2.3.4:9999".to_string(),
                auth: None,
            }))
        }
    }

    #[test]
    fn ss_scheme_uses_an_injected_dialer_factory() {
        let entry = FallbackEntry::Url("ss://YWVzLTI1Ni1nY206cGFzcw==@1.2.3.4:9999/".to_string());
        let factory: &dyn FallbackDialerFactory = &StubFactory;
        assert!(build_fallback_dialer(&entry, Some(factory)).is_ok());
    }
}
