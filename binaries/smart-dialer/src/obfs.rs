//! The configurable-dialer module (§6): interprets a TLS-entry mini-language string and wraps a
//! base [`HostDialer`] with whatever obfuscation it names. The Smart Dialer core treats these
//! strings as opaque and only races them (§4.F); this module is the concrete implementation
//! backing that contract inside this build.
//!
//! Recognized grammar, applied left to right and composable with `|`:
//! - `""` — identity, no wrapping.
//! - `split:N` / `tlsfrag:N` — splits the first write on the resulting pipe (the TLS ClientHello,
//!   in practice) into an `N`-byte write followed by the remainder, so the record crosses a TCP
//!   segment boundary.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures_util::{AsyncRead, AsyncWrite};
use pin_project::pin_project;
use sillad::Pipe;

use crate::{
    error::{Result, SmartDialerError},
    host_dialer::HostDialer,
};

#[pin_project]
struct FragmentPipe {
    #[pin]
    inner: Box<dyn Pipe>,
    fragment_size: usize,
    fragmented: bool,
}

impl AsyncRead for FragmentPipe {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl AsyncWrite for FragmentPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        if !*this.fragmented && buf.len() > *this.fragment_size {
            let n = *this.fragment_size;
            let result = this.inner.poll_write(cx, &buf[..n]);
            if let Poll::Ready(Ok(written)) = result {
                if written == n {
                    *this.fragmented = true;
                }
            }
            result
        } else {
            *this.fragmented = true;
            this.inner.poll_write(cx, buf)
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_close(cx)
    }
}

impl Pipe for FragmentPipe {
    fn protocol(&self) -> &str {
        self.inner.protocol()
    }

    fn remote_addr(&self) -> Option<&str> {
        self.inner.remote_addr()
    }
}

/// Wraps another [`HostDialer`], fragmenting the first write of every dial by `fragment_size`.
struct FragmentingHostDialer {
    inner: Arc<dyn HostDialer>,
    fragment_size: usize,
}

#[async_trait]
impl HostDialer for FragmentingHostDialer {
    async fn dial_host(&self, addr: &str) -> std::io::Result<Box<dyn Pipe>> {
        let inner = self.inner.dial_host(addr).await?;
        Ok(Box::new(FragmentPipe {
            inner,
            fragment_size: self.fragment_size,
            fragmented: false,
        }))
    }
}

/// One step of the `|`-composed mini-language.
enum Step {
    Identity,
    Fragment(usize),
}

fn parse_step(step: &str) -> Result<Step> {
    let step = step.trim();
    if step.is_empty() {
        return Ok(Step::Identity);
    }
    if let Some(n) = step
        .strip_prefix("split:")
        .or_else(|| step.strip_prefix("tlsfrag:"))
    {
        let n: usize = n.parse().map_err(|_| {
            SmartDialerError::UnsupportedFallback(format!("bad fragment size in {step:?}"))
        })?;
        return Ok(Step::Fragment(n));
    }
    Err(SmartDialerError::UnsupportedFallback(format!(
        "unrecognized TLS strategy entry {step:?}"
    )))
}

/// Builds an obfuscating dialer atop `base` from an opaque TLS-entry string (§4.F).
pub fn build_obfuscated_dialer(entry: &str, base: Arc<dyn HostDialer>) -> Result<Arc<dyn HostDialer>> {
    let mut dialer = base;
    for step in entry.split('|') {
        dialer = match parse_step(step)? {
            Step::Identity => dialer,
            Step::Fragment(n) => Arc::new(FragmentingHostDialer {
                inner: dialer,
                fragment_size: n,
            }),
        };
    }
    Ok(dialer)
}

/// Routes destination ports {443, 853} through `obfuscated`, everything else through `base`
/// (§4.F: obfuscation must never touch non-TLS traffic it would corrupt).
pub struct PortRoutingHostDialer {
    pub obfuscated: Arc<dyn HostDialer>,
    pub base: Arc<dyn HostDialer>,
}

#[async_trait]
impl HostDialer for PortRoutingHostDialer {
    async fn dial_host(&self, addr: &str) -> std::io::Result<Box<dyn Pipe>> {
        let port = addr
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse::<u16>().ok())
            .unwrap_or(0);
        if port == 443 || port == 853 {
            self.obfuscated.dial_host(addr).await
        } else {
            self.base.dial_host(addr).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_entry_is_identity() {
        assert!(matches!(parse_step("").unwrap(), Step::Identity));
    }

    #[test]
    fn split_and_tlsfrag_are_synonyms() {
        assert!(matches!(parse_step("split:4").unwrap(), Step::Fragment(4)));
        assert!(matches!(parse_step("tlsfrag:4").unwrap(), Step::Fragment(4)));
    }

    #[test]
    fn unknown_step_is_rejected() {
        assert!(parse_step("ss://whatever").is_err());
    }
}
