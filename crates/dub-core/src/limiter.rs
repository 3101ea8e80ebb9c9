//! Token bucket gating handler invocations.
//!
//! A feeder task pushes one token per `1s / rate` into a channel of capacity
//! `rate`, so at most one second's worth of tokens can be banked for a burst.

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{errors::Error, Result};

/// Returned by [`Tokens::acquire`] once the token source has shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("rate limiter cancelled")]
pub struct Cancelled;

#[derive(Clone, Copy, Debug)]
pub struct TokenBucketLimiter {
    rate_per_sec: u32,
}

impl TokenBucketLimiter {
    /// A zero rate can never admit anything, so it is rejected here rather than at runtime.
    pub fn new(rate_per_sec: u32) -> Result<Self> {
        if rate_per_sec == 0 {
            return Err(Error::Config(
                "rate limit must be at least 1 token per second".to_string(),
            ));
        }
        Ok(Self { rate_per_sec })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(1) / self.rate_per_sec
    }

    /// Spawn the feeder task. It runs until `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> Tokens {
        let (tx, rx) = mpsc::channel::<()>(self.rate_per_sec as usize);
        let interval = self.interval();
        let feeder_cancel = cancel.clone();

        let feeder = tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    _ = feeder_cancel.cancelled() => break,
                    permit = tx.reserve() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };
                permit.send(());

                tokio::select! {
                    _ = feeder_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("token feeder stopped");
        });

        Tokens {
            rx: Arc::new(Mutex::new(rx)),
            cancel,
            feeder: Arc::new(std::sync::Mutex::new(Some(feeder))),
        }
    }
}

/// Shared handle to a running token source.
#[derive(Clone)]
pub struct Tokens {
    rx: Arc<Mutex<mpsc::Receiver<()>>>,
    cancel: CancellationToken,
    feeder: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl Tokens {
    /// Wait for one admission token.
    ///
    /// Fails with [`Cancelled`] once the source is cancelled, even if tokens are still banked.
    pub async fn acquire(&self) -> std::result::Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let mut rx = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Cancelled),
            rx = self.rx.lock() => rx,
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Cancelled),
            token = rx.recv() => token.ok_or(Cancelled),
        }
    }

    /// Cancel the source and wait for the feeder task to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let feeder = self
            .feeder
            .lock()
            .map(|mut guard| guard.take())
            .unwrap_or(None);
        if let Some(handle) = feeder {
            let _ = handle.await;
        }
    }
}
