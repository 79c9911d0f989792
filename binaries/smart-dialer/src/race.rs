//! Staggered Race Scheduler (component D): a generic bounded-parallel first-success selector,
//! reused by the TLS-strategy searcher, the fallback searcher, and (indirectly, via the DNS
//! prober) the proxyless DNS race. Grounded on the broker's own priority-race transport, which
//! staggers a BTreeMap of delayed candidates and races them to the first success.

use std::{future::Future, time::Duration};

use futures_util::{future::BoxFuture, FutureExt};
use smol::channel::{Receiver, Sender};

use crate::{cancel::CancelToken, error::SmartDialerError};

/// The default stagger interval between launching successive candidates.
pub const DEFAULT_STAGGER: Duration = Duration::from_millis(250);

struct ProbeOutcome<T> {
    index: usize,
    result: anyhow::Result<T>,
}

/// Races `candidates` through `probe`, launching one every `stagger` until either a probe
/// succeeds, all have been launched and have reported failure, or `cancel` fires (§4.D event (i)).
/// Returns the first successful `(index, value)`, an error summarizing every failure, or
/// [`SmartDialerError::Cancelled`] -- whichever happens first. On cancellation every still-running
/// candidate task is dropped immediately rather than awaited out.
///
/// `index` is the candidate's position in the input list: callers use it to recover which
/// candidate actually won (this function is generic over the candidate type and does not keep
/// one around itself beyond handing it to `probe`).
pub async fn staggered_race<C, T, F, Fut>(
    candidates: &[C],
    stagger: Duration,
    cancel: &CancelToken,
    probe: F,
) -> crate::error::Result<(usize, T)>
where
    C: Sync,
    T: Send + 'static,
    F: Fn(usize, &C) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    if candidates.is_empty() {
        return Err(SmartDialerError::AllCandidatesFailed {
            summary: "no candidates to race".to_string(),
        });
    }
    if cancel.is_cancelled() {
        return Err(SmartDialerError::Cancelled);
    }

    let (tx, rx): (Sender<ProbeOutcome<T>>, Receiver<ProbeOutcome<T>>) = smol::channel::unbounded();
    let mut tasks = Vec::with_capacity(candidates.len());
    let mut next = 0usize;
    let mut pending = 0usize;
    let mut errors: Vec<(usize, String)> = Vec::new();
    let mut ready: BoxFuture<'static, ()> = async {}.boxed();

    loop {
        if next == candidates.len() && pending == 0 {
            break;
        }

        enum Event<T> {
            LaunchReady,
            Outcome(ProbeOutcome<T>),
            Cancelled,
        }

        let launch_ready = async {
            if next < candidates.len() {
                (&mut ready).await;
                Event::LaunchReady
            } else {
                std::future::pending().await
            }
        };
        let outcome = async {
            match rx.recv().await {
                Ok(outcome) => Event::Outcome(outcome),
                Err(_) => std::future::pending().await,
            }
        };
        let cancelled = async {
            cancel.cancelled().await;
            Event::Cancelled
        };

        let event = futures_util::future::select(
            Box::pin(launch_ready),
            futures_util::future::select(Box::pin(outcome), Box::pin(cancelled)),
        )
        .await;
        let event = match event {
            futures_util::future::Either::Left((e, _)) => e,
            futures_util::future::Either::Right((inner, _)) => match inner {
                futures_util::future::Either::Left((e, _)) => e,
                futures_util::future::Either::Right((e, _)) => e,
            },
        };

        match event {
            Event::LaunchReady => {
                let idx = next;
                next += 1;
                pending += 1;
                let fut = probe(idx, &candidates[idx]);
                let tx = tx.clone();
                let task = smolscale::spawn(async move {
                    let result = fut.await;
                    let _ = tx.send(ProbeOutcome { index: idx, result }).await;
                });
                tasks.push(task);
                ready = if next < candidates.len() {
                    async move {
                        async_io::Timer::after(stagger).await;
                    }
                    .boxed()
                } else {
                    std::future::pending().boxed()
                };
            }
            Event::Outcome(outcome) => {
                pending -= 1;
                match outcome.result {
                    Ok(value) => {
                        drop(tasks);
                        return Ok((outcome.index, value));
                    }
                    Err(e) => {
                        let failure = SmartDialerError::ProbeFailure(e);
                        tracing::debug!(candidate = outcome.index, err = %failure, "candidate probe failed");
                        errors.push((outcome.index, failure.to_string()));
                    }
                }
            }
            Event::Cancelled => {
                drop(tasks);
                return Err(SmartDialerError::Cancelled);
            }
        }
    }

    drop(tasks);
    let summary = errors
        .into_iter()
        .map(|(idx, e)| format!("[{idx}] {e}"))
        .collect::<Vec<_>>()
        .join("; ");
    Err(SmartDialerError::AllCandidatesFailed { summary })
}

/// Races `candidates` with [`DEFAULT_STAGGER`].
pub async fn staggered_race_default<C, T, F, Fut>(
    candidates: &[C],
    cancel: &CancelToken,
    probe: F,
) -> crate::error::Result<(usize, T)>
where
    C: Sync,
    T: Send + 'static,
    F: Fn(usize, &C) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    staggered_race(candidates, DEFAULT_STAGGER, cancel, probe).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_candidate_wins_among_equal_latency() {
        smolscale::block_on(async {
            let candidates = vec![0, 1, 2];
            let (idx, value) = staggered_race(
                &candidates,
                Duration::from_millis(10),
                &CancelToken::new(),
                |i, _| {
                    Box::pin(async move {
                        async_io::Timer::after(Duration::from_millis(5)).await;
                        anyhow::Ok(i)
                    }) as BoxFuture<'static, anyhow::Result<usize>>
                },
            )
            .await
            .unwrap();
            assert_eq!(idx, 0);
            assert_eq!(value, 0);
        });
    }

    #[test]
    fn all_failing_candidates_produce_an_error() {
        smolscale::block_on(async {
            let candidates = vec![0, 1];
            let result = staggered_race(
                &candidates,
                Duration::from_millis(1),
                &CancelToken::new(),
                |_, _| {
                    Box::pin(async move { anyhow::bail!("nope") })
                        as BoxFuture<'static, anyhow::Result<()>>
                },
            )
            .await;
            assert!(matches!(
                result,
                Err(SmartDialerError::AllCandidatesFailed { .. })
            ));
        });
    }

    #[test]
    fn a_later_faster_candidate_still_wins() {
        smolscale::block_on(async {
            let candidates = vec![0, 1];
            let (idx, _) = staggered_race(
                &candidates,
                Duration::from_millis(20),
                &CancelToken::new(),
                |i, _| {
                    Box::pin(async move {
                        if i == 0 {
                            async_io::Timer::after(Duration::from_millis(200)).await;
                        }
                        anyhow::Ok(i)
                    }) as BoxFuture<'static, anyhow::Result<usize>>
                },
            )
            .await
            .unwrap();
            assert_eq!(idx, 1);
        });
    }

    #[test]
    fn cancelling_mid_race_returns_cancelled_without_waiting_for_probes() {
        smolscale::block_on(async {
            let candidates = vec![0, 1];
            let cancel = CancelToken::new();
            let canceller = cancel.clone();
            smolscale::spawn(async move {
                async_io::Timer::after(Duration::from_millis(10)).await;
                canceller.cancel();
            })
            .detach();

            let result = staggered_race(
                &candidates,
                Duration::from_millis(1),
                &cancel,
                |_, _| {
                    Box::pin(async move {
                        async_io::Timer::after(Duration::from_secs(5)).await;
                        anyhow::Ok(())
                    }) as BoxFuture<'static, anyhow::Result<()>>
                },
            )
            .await;
            assert!(matches!(result, Err(SmartDialerError::Cancelled)));
        });
    }
}
