use std::time::Duration;

use async_trait::async_trait;

use crate::{EitherPipe, Pipe};

#[async_trait]
/// Dialers create pipes by initiating a connection to some sort of "other side". Failures are indicated by the standard I/O error type.
pub trait Dialer: Sync + Send + Sized {
    type P: Pipe;
    async fn dial(&self) -> std::io::Result<Self::P>;
}

/// Object-safe counterpart of [`Dialer`], auto-implemented for every `Dialer`. This indirection
/// exists because `Dialer::dial` returns `Self::P` by value, which would otherwise make the
/// trait impossible to turn into a trait object.
#[async_trait]
trait ErasedDialer: Sync + Send {
    async fn dial_erased(&self) -> std::io::Result<Box<dyn Pipe>>;
}

#[async_trait]
impl<D: Dialer> ErasedDialer for D {
    async fn dial_erased(&self) -> std::io::Result<Box<dyn Pipe>> {
        Ok(Box::new(self.dial().await?))
    }
}

/// A type-erased dialer, for when a dialer's concrete type cannot be named (e.g. when
/// [`HappyEyeballsTcpDialer`](crate::tcp::HappyEyeballsTcpDialer) folds a variable-length list of
/// per-address dialers into one).
#[derive(Clone)]
pub struct DynDialer(std::sync::Arc<dyn ErasedDialer>);

#[async_trait]
impl Dialer for DynDialer {
    type P = Box<dyn Pipe>;
    async fn dial(&self) -> std::io::Result<Self::P> {
        self.0.dial_erased().await
    }
}

pub trait DialerExt: Dialer {
    fn race<D: Dialer>(self, other: D) -> RaceDialer<Self, D> {
        RaceDialer(self, other)
    }

    /// Waits `duration` before even starting to dial. Used to stagger happy-eyeballs attempts.
    fn delay(self, duration: Duration) -> DelayDialer<Self>
    where
        Self: Sized,
    {
        DelayDialer {
            inner: self,
            duration,
        }
    }

    /// Erases this dialer's concrete type, producing a [`DynDialer`].
    fn dynamic(self) -> DynDialer
    where
        Self: Sized + 'static,
    {
        DynDialer(std::sync::Arc::new(self))
    }
}

impl<T: Dialer> DialerExt for T {}

/// RaceDialer is a dialer that races between two dialers.
pub struct RaceDialer<L: Dialer, R: Dialer>(pub L, pub R);

#[async_trait]
impl<L: Dialer, R: Dialer> Dialer for RaceDialer<L, R> {
    type P = EitherPipe<L::P, R::P>;
    async fn dial(&self) -> std::io::Result<Self::P> {
        futures_lite::future::race(
            async { Ok(EitherPipe::Left(self.0.dial().await?)) },
            async { Ok(EitherPipe::Right(self.1.dial().await?)) },
        )
        .await
    }
}

/// DelayDialer waits `duration` before dialing the inner dialer. Useful for staggering races.
pub struct DelayDialer<D: Dialer> {
    inner: D,
    duration: Duration,
}

#[async_trait]
impl<D: Dialer> Dialer for DelayDialer<D> {
    type P = D::P;
    async fn dial(&self) -> std::io::Result<Self::P> {
        async_io::Timer::after(self.duration).await;
        self.inner.dial().await
    }
}
