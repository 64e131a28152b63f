#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Hot-restart supervisor for a sidecar proxy.
//!
//! The agent serializes configuration updates into monotonic restart
//! epochs: each accepted configuration launches one child proxy whose
//! lifetime may overlap its predecessor's while the proxy pair hands off
//! connections. Failed launches are retried with bounded exponential
//! backoff; a configuration that exhausts its budget is left alone until a
//! different one arrives.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, info, warn};

/// Launches and cleans up one child proxy per epoch.
///
/// `run` resolves when the child exits: an `Err` covers both a failed start
/// and a non-zero exit, and either feeds the agent's retry path. `cleanup`
/// runs after the child is gone, whatever the outcome.
#[async_trait::async_trait]
pub trait Proxy: Send + Sync + 'static {
    type Config: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;

    async fn run(&self, config: &Self::Config, epoch: u32) -> Result<(), Error>;

    fn cleanup(&self, epoch: u32);
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to write proxy configuration: {0}")]
    Config(#[source] std::io::Error),

    #[error("failed to start proxy: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("proxy exited with {0}")]
    Exited(std::process::ExitStatus),

    /// The agent tore the child down while draining.
    #[error("proxy aborted")]
    Aborted,
}

/// Submits desired configurations to a running [`Agent`].
///
/// The mailbox holds a single slot: rapid submissions coalesce and only the
/// latest value is guaranteed to be reconciled.
pub struct AgentHandle<C> {
    tx: Arc<watch::Sender<Option<C>>>,
}

/// The reconciliation task owning the supervised children.
pub struct Agent<P: Proxy> {
    proxy: Arc<P>,
    budget: u32,
    base_delay: Duration,
    // A sender clone is retained so the mailbox never closes under us.
    _tx: Arc<watch::Sender<Option<P::Config>>>,
    rx: watch::Receiver<Option<P::Config>>,
}

struct Exit<C> {
    epoch: u32,
    config: C,
    result: Result<(), Error>,
}

struct Retry<C> {
    attempts: u32,
    target: Option<C>,
}

// === impl AgentHandle ===

impl<C> Clone for AgentHandle<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C: Clone + PartialEq + Send + Sync + 'static> AgentHandle<C> {
    /// Submits a new desired configuration. Non-blocking; last writer wins.
    pub fn schedule_config_update(&self, config: C) {
        self.tx.send_replace(Some(config));
    }
}

// === impl Agent ===

impl<P: Proxy> Agent<P> {
    /// Creates an agent with a retry budget and a base backoff delay.
    pub fn new(proxy: P, budget: u32, base_delay: Duration) -> (Self, AgentHandle<P::Config>) {
        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);
        let agent = Self {
            proxy: Arc::new(proxy),
            budget,
            base_delay,
            _tx: tx.clone(),
            rx,
        };
        (agent, AgentHandle { tx })
    }

    /// Drives reconciliation until `stop` is signaled, then aborts the
    /// remaining children and returns once they are cleaned up.
    pub async fn run(mut self, stop: drain::Watch) {
        let (status_tx, mut status_rx) = mpsc::unbounded_channel::<Exit<P::Config>>();
        let (abort_tx, abort_rx) = watch::channel(false);

        // Config of every live child, keyed by epoch. The highest epoch is
        // the accepted configuration.
        let mut children: BTreeMap<u32, P::Config> = BTreeMap::new();
        let mut retry = Retry {
            attempts: 0,
            target: None,
        };
        let mut retry_at: Option<Instant> = None;

        let shutdown = stop.signaled();
        tokio::pin!(shutdown);

        let release = loop {
            self.reconcile(&mut children, &mut retry, &mut retry_at, &status_tx, &abort_rx);

            tokio::select! {
                res = self.rx.changed() => {
                    // The agent retains a sender, so the mailbox stays open.
                    debug_assert!(res.is_ok());
                }
                Some(exit) = status_rx.recv() => {
                    self.handle_exit(exit, &mut children, &mut retry, &mut retry_at);
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)),
                    if retry_at.is_some() =>
                {
                    retry_at = None;
                }
                release = &mut shutdown => break release,
            }
        };

        info!("agent draining");
        let _ = abort_tx.send(true);
        while !children.is_empty() {
            match status_rx.recv().await {
                Some(exit) => {
                    children.remove(&exit.epoch);
                }
                None => break,
            }
        }
        drop(release);
    }

    /// Spawns a new epoch when the desired configuration differs from the
    /// accepted one and neither a backoff sleep nor an exhausted budget is
    /// in the way.
    fn reconcile(
        &mut self,
        children: &mut BTreeMap<u32, P::Config>,
        retry: &mut Retry<P::Config>,
        retry_at: &mut Option<Instant>,
        status_tx: &mpsc::UnboundedSender<Exit<P::Config>>,
        abort_rx: &watch::Receiver<bool>,
    ) {
        let desired = self.rx.borrow_and_update().clone();
        let Some(desired) = desired else { return };

        // Equality is structural, so idempotent re-submissions are no-ops.
        if children.values().next_back() == Some(&desired) {
            return;
        }

        if retry.target.as_ref() != Some(&desired) {
            // A fresh configuration starts over: drop any pending backoff.
            retry.attempts = 0;
            retry.target = None;
            *retry_at = None;
        } else if retry.attempts >= self.budget {
            debug!("desired configuration exhausted its retry budget; awaiting a new one");
            return;
        }

        if retry_at.is_some() {
            return;
        }

        let epoch = children.keys().next_back().map_or(0, |e| e + 1);
        info!(epoch, "launching proxy");
        children.insert(epoch, desired.clone());

        let proxy = self.proxy.clone();
        let status_tx = status_tx.clone();
        let mut abort_rx = abort_rx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                res = proxy.run(&desired, epoch) => res,
                _ = abort_rx.wait_for(|aborted| *aborted) => Err(Error::Aborted),
            };
            proxy.cleanup(epoch);
            let _ = status_tx.send(Exit {
                epoch,
                config: desired,
                result,
            });
        });
    }

    /// Removes the exited child and, when it carried the newest epoch,
    /// feeds the retry path. Crash and graceful exit both schedule a
    /// relaunch, but a clean exit resets the attempt counter first: only
    /// consecutive failures can exhaust the budget.
    fn handle_exit(
        &self,
        exit: Exit<P::Config>,
        children: &mut BTreeMap<u32, P::Config>,
        retry: &mut Retry<P::Config>,
        retry_at: &mut Option<Instant>,
    ) {
        children.remove(&exit.epoch);
        match &exit.result {
            Ok(()) => info!(epoch = exit.epoch, "proxy exited"),
            Err(error) => warn!(epoch = exit.epoch, %error, "proxy exited abnormally"),
        }

        let superseded = children.keys().next_back().is_some_and(|&e| e > exit.epoch);
        if superseded {
            // An old epoch ending is the normal tail of a hot restart.
            return;
        }

        if exit.result.is_ok() {
            // A successful spawn re-arms the budget.
            retry.attempts = 0;
        }
        if retry.target.as_ref() != Some(&exit.config) {
            retry.attempts = 0;
            retry.target = Some(exit.config);
        }
        retry.attempts += 1;

        if retry.attempts >= self.budget {
            warn!(
                attempts = retry.attempts,
                "proxy retry budget exhausted; giving up on this configuration"
            );
            return;
        }

        let delay = self.base_delay * 2u32.saturating_pow(retry.attempts - 1);
        warn!(?delay, attempt = retry.attempts, "retrying proxy launch");
        *retry_at = Some(Instant::now() + delay);
    }
}
