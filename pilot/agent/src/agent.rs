use crate::{Error, Proxy};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{self, Instant},
};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

#[cfg(test)]
mod tests;

/// How long the agent waits before reconciling when no retry is pending.
const IDLE_DELAY: Duration = Duration::from_secs(60 * 60);

/// Drives a [`Proxy`] toward the most recently scheduled configuration.
pub struct Agent<P: Proxy> {
    proxy: Arc<P>,
    retry: Retry,
    updates: Updates<P::Config>,
}

/// Schedules configuration updates for an [`Agent`].
///
/// Updates are coalesced: only the latest scheduled configuration is
/// applied.
pub struct Handle<C> {
    tx: Arc<watch::Sender<Option<C>>>,
}

pub struct Updates<C> {
    pub(crate) rx: watch::Receiver<Option<C>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Retry {
    /// Restarts attempted for one desired configuration before giving up.
    pub budget: u32,
    pub initial_delay: Duration,
}

type Status = (u32, anyhow::Result<()>);

struct State<P: Proxy> {
    proxy: Arc<P>,
    status_tx: mpsc::UnboundedSender<Status>,
    desired: Option<P::Config>,
    current: Option<P::Config>,
    epochs: BTreeMap<u32, Epoch<P::Config>>,
    budget: u32,
}

struct Epoch<C> {
    config: C,
    abort: Option<oneshot::Sender<()>>,
}

pub fn channel<C>() -> (Handle<C>, Updates<C>) {
    let (tx, rx) = watch::channel(None);
    (Handle { tx: Arc::new(tx) }, Updates { rx })
}

// === impl Agent ===

impl<P: Proxy> Agent<P> {
    pub fn new(proxy: P, retry: Retry, updates: Updates<P::Config>) -> Self {
        Self {
            proxy: Arc::new(proxy),
            retry,
            updates,
        }
    }

    /// Runs until shutdown is signaled or the retry budget for the desired
    /// configuration is exhausted.
    pub async fn run(self, shutdown: drain::Watch) -> Result<(), Error> {
        let Self {
            proxy,
            retry,
            updates: Updates { rx: mut updates },
        } = self;
        let (status_tx, mut statuses) = mpsc::unbounded_channel();
        let mut state = State {
            proxy,
            status_tx,
            desired: None,
            current: None,
            epochs: BTreeMap::new(),
            budget: retry.budget,
        };

        // Only reset by a new desired config or an epoch's exit, so that
        // repeated schedules of the same config cannot postpone a retry.
        let timer = time::sleep(IDLE_DELAY);
        tokio::pin!(timer);
        let mut updates_open = true;
        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                res = updates.changed(), if updates_open => {
                    if res.is_err() {
                        debug!("Config updates closed");
                        updates_open = false;
                        continue;
                    }
                    let Some(config) = updates.borrow_and_update().clone() else {
                        continue;
                    };
                    if state.desired.as_ref() == Some(&config) {
                        trace!("Desired config unchanged");
                        continue;
                    }
                    debug!(?config, "Desired config updated");
                    state.budget = retry.budget;
                    state.desired = Some(config);
                    timer.as_mut().reset(Instant::now() + IDLE_DELAY);
                    state.reconcile();
                }

                Some((epoch, res)) = statuses.recv() => {
                    match state.exited(epoch, res, &retry) {
                        Ok(Some(retry_in)) => timer.as_mut().reset(Instant::now() + retry_in),
                        Ok(None) => {}
                        Err(error) => {
                            state.abort_all(&mut statuses).await;
                            return Err(error);
                        }
                    }
                }

                () = &mut timer => {
                    timer.as_mut().reset(Instant::now() + IDLE_DELAY);
                    state.reconcile();
                }

                handle = &mut shutdown => {
                    info!(epochs = state.epochs.len(), "Stopping proxy");
                    state.abort_all(&mut statuses).await;
                    drop(handle);
                    return Ok(());
                }
            }
        }
    }
}

// === impl Handle ===

impl<C> Handle<C> {
    /// Replaces the pending configuration.
    pub fn schedule(&self, config: C) {
        self.tx.send_replace(Some(config));
    }
}

impl<C> Clone for Handle<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

// === impl Retry ===

impl Default for Retry {
    fn default() -> Self {
        Self {
            budget: 10,
            initial_delay: Duration::from_millis(200),
        }
    }
}

impl Retry {
    /// The delay before the next attempt when `remaining` attempts are left.
    fn backoff(&self, remaining: u32) -> Duration {
        let exp = self.budget.saturating_sub(remaining).saturating_add(1);
        self.initial_delay.saturating_mul(2u32.saturating_pow(exp))
    }
}

// === impl State ===

impl<P: Proxy> State<P> {
    fn reconcile(&mut self) {
        let Some(desired) = self.desired.clone() else {
            return;
        };
        if self.current.as_ref() == Some(&desired) {
            trace!("Proxy config is current");
            return;
        }

        let epoch = self.epochs.keys().next_back().map_or(0, |e| e + 1);
        let (abort_tx, abort_rx) = oneshot::channel();
        self.epochs.insert(
            epoch,
            Epoch {
                config: desired.clone(),
                abort: Some(abort_tx),
            },
        );
        self.current = Some(desired.clone());

        info!(epoch, "Starting proxy");
        let proxy = self.proxy.clone();
        let status_tx = self.status_tx.clone();
        tokio::spawn(
            async move {
                let res = proxy.run(desired, epoch, abort_rx).await;
                let _ = status_tx.send((epoch, res));
            }
            .instrument(info_span!("proxy", epoch)),
        );
    }

    /// Records an epoch's exit and returns the delay before a retry, if one
    /// is needed.
    fn exited(
        &mut self,
        epoch: u32,
        res: anyhow::Result<()>,
        retry: &Retry,
    ) -> Result<Option<Duration>, Error> {
        self.proxy.cleanup(epoch);
        self.epochs.remove(&epoch);
        self.current = self
            .epochs
            .values()
            .next_back()
            .map(|e| e.config.clone());

        let error = match res {
            Ok(()) => {
                info!(epoch, "Proxy exited");
                return Ok(None);
            }
            Err(error) => error,
        };
        warn!(epoch, %error, "Proxy exited with an error");
        if self.desired == self.current {
            return Ok(None);
        }

        if self.budget == 0 {
            error!(attempts = retry.budget, "Retry budget exhausted");
            return Err(Error::Fatal {
                attempts: retry.budget,
                error,
            });
        }
        let delay = retry.backoff(self.budget);
        self.budget -= 1;
        info!(?delay, remaining = self.budget, "Scheduling proxy restart");
        Ok(Some(delay))
    }

    async fn abort_all(&mut self, statuses: &mut mpsc::UnboundedReceiver<Status>) {
        for (epoch, e) in self.epochs.iter_mut() {
            if let Some(abort) = e.abort.take() {
                debug!(epoch, "Aborting proxy");
                let _ = abort.send(());
            }
        }
        while !self.epochs.is_empty() {
            let Some((epoch, res)) = statuses.recv().await else {
                break;
            };
            if let Err(error) = res {
                debug!(epoch, %error, "Aborted proxy exited with an error");
            }
            self.proxy.cleanup(epoch);
            self.epochs.remove(&epoch);
        }
        self.current = None;
    }
}
