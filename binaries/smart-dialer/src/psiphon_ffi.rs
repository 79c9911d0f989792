//! FFI boundary to the Psiphon tunnel-core client library, linked only when this binary is built
//! with the `psiphon` feature. Psiphon's own client is a process-wide singleton with its own
//! start/stop lifecycle (§9 "no singletons except as bounded to the Psiphon adapter") -- this
//! module only adapts it to [`HostDialer`].

use std::{
    os::fd::FromRawFd,
    pin::Pin,
    task::{Context, Poll},
};

use async_io::Async;
use async_trait::async_trait;
use futures_util::{AsyncRead, AsyncWrite};
use pin_project::pin_project;
use sillad::Pipe;

use crate::{error::SmartDialerError, host_dialer::HostDialer};

#[allow(non_snake_case)]
mod ffi {
    extern "C" {
        /// Starts (or reuses) the process-wide Psiphon tunnel with the given JSON config, and
        /// dials `addr` through it. Returns a native socket descriptor on success, negative on
        /// failure. This is the sole point of contact with the external Psiphon library.
        pub fn psiphon_tunnel_dial(
            config_json: *const libc::c_char,
            config_len: usize,
            addr: *const libc::c_char,
            addr_len: usize,
        ) -> i32;
    }
}

/// Wraps the raw socket descriptor `psiphon_tunnel_dial` hands back so it reads/writes through
/// the same non-blocking reactor as every other transport in this crate.
#[pin_project]
struct PsiphonPipe(#[pin] Async<std::net::TcpStream>, String);

impl AsyncRead for PsiphonPipe {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().0.poll_read(cx, buf)
    }
}

impl AsyncWrite for PsiphonPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().0.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().0.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().0.poll_close(cx)
    }
}

impl Pipe for PsiphonPipe {
    fn protocol(&self) -> &str {
        "psiphon"
    }

    fn remote_addr(&self) -> Option<&str> {
        Some(&self.1)
    }
}

pub struct PsiphonHostDialer {
    config_json: String,
}

impl PsiphonHostDialer {
    pub fn start(config: &serde_yaml::Value) -> crate::error::Result<Self> {
        let config_json = serde_json::to_string(config)
            .map_err(|e| SmartDialerError::ConfigParse(format!("bad psiphon config: {e}")))?;
        Ok(Self { config_json })
    }
}

#[async_trait]
impl HostDialer for PsiphonHostDialer {
    async fn dial_host(&self, addr: &str) -> std::io::Result<Box<dyn Pipe>> {
        let config_json = self.config_json.clone();
        let dial_addr = addr.to_string();
        let fd = smol::unblock(move || unsafe {
            let fd = ffi::psiphon_tunnel_dial(
                config_json.as_ptr() as *const libc::c_char,
                config_json.len(),
                dial_addr.as_ptr() as *const libc::c_char,
                dial_addr.len(),
            );
            if fd < 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "psiphon_tunnel_dial failed",
                ));
            }
            Ok(fd)
        })
        .await?;

        // SAFETY: psiphon_tunnel_dial hands back a freshly opened, uniquely owned socket
        // descriptor on success; we take ownership of it here.
        let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
        std_stream.set_nonblocking(true)?;
        let async_stream = Async::new(std_stream)?;
        Ok(Box::new(PsiphonPipe(async_stream, addr.to_string())))
    }
}
