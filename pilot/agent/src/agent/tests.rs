use super::*;
use crate::Abort;
use pretty_assertions::assert_eq;
use std::sync::Mutex;
use tokio::time::Instant;

/// A proxy whose epochs exit when the test says so.
#[derive(Clone, Default)]
struct FakeProxy {
    runs: Arc<Mutex<Option<mpsc::UnboundedSender<Run>>>>,
    aborted: Arc<Mutex<Vec<u32>>>,
    cleaned: Arc<Mutex<Vec<u32>>>,
}

struct Run {
    config: u32,
    epoch: u32,
    exit: oneshot::Sender<anyhow::Result<()>>,
}

struct Harness {
    proxy: FakeProxy,
    handle: Handle<u32>,
    runs: mpsc::UnboundedReceiver<Run>,
    signal: drain::Signal,
    task: tokio::task::JoinHandle<Result<(), Error>>,
}

#[async_trait::async_trait]
impl Proxy for FakeProxy {
    type Config = u32;

    async fn run(&self, config: u32, epoch: u32, abort: Abort) -> anyhow::Result<()> {
        let (exit, exited) = oneshot::channel();
        if let Some(runs) = &*self.runs.lock().unwrap() {
            runs.send(Run {
                config,
                epoch,
                exit,
            })
            .unwrap();
        }
        tokio::select! {
            res = exited => res.unwrap_or(Ok(())),
            _ = abort => {
                self.aborted.lock().unwrap().push(epoch);
                Ok(())
            }
        }
    }

    fn cleanup(&self, epoch: u32) {
        self.cleaned.lock().unwrap().push(epoch);
    }
}

fn start(retry: Retry) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();

    let proxy = FakeProxy::default();
    let (runs_tx, runs) = mpsc::unbounded_channel();
    *proxy.runs.lock().unwrap() = Some(runs_tx);
    let (handle, updates) = channel();
    let (signal, shutdown) = drain::channel();
    let task = tokio::spawn(Agent::new(proxy.clone(), retry, updates).run(shutdown));
    Harness {
        proxy,
        handle,
        runs,
        signal,
        task,
    }
}

impl Harness {
    async fn next_run(&mut self) -> Run {
        self.runs.recv().await.expect("agent must start a proxy")
    }

    /// Lets the agent settle and checks that it started nothing new.
    async fn assert_idle(&mut self) {
        time::sleep(Duration::from_secs(1)).await;
        assert!(self.runs.try_recv().is_err(), "unexpected proxy start");
    }

    fn cleaned(&self) -> Vec<u32> {
        self.proxy.cleaned.lock().unwrap().clone()
    }
}

#[tokio::test(start_paused = true)]
async fn new_configs_start_new_epochs() {
    let mut h = start(Retry::default());

    h.handle.schedule(1);
    let first = h.next_run().await;
    assert_eq!((first.config, first.epoch), (1, 0));

    h.handle.schedule(2);
    let second = h.next_run().await;
    assert_eq!((second.config, second.epoch), (2, 1));

    // The previous epoch drains away once the new one is up.
    first.exit.send(Ok(())).unwrap();
    h.assert_idle().await;
    assert_eq!(h.cleaned(), [0]);

    // Rescheduling the running config is a no-op.
    h.handle.schedule(2);
    h.assert_idle().await;
    drop(second);
}

#[tokio::test(start_paused = true)]
async fn updates_are_coalesced() {
    let mut h = start(Retry::default());

    h.handle.schedule(1);
    h.handle.schedule(2);
    h.handle.schedule(3);
    let run = h.next_run().await;
    assert_eq!((run.config, run.epoch), (3, 0));
    h.assert_idle().await;
}

#[tokio::test(start_paused = true)]
async fn stale_epoch_failure_is_not_retried() {
    let mut h = start(Retry::default());

    h.handle.schedule(1);
    let first = h.next_run().await;
    h.handle.schedule(2);
    let _second = h.next_run().await;

    first.exit.send(Err(anyhow::anyhow!("crashed"))).unwrap();
    time::sleep(IDLE_DELAY * 2).await;
    assert!(h.runs.try_recv().is_err());
    assert_eq!(h.cleaned(), [0]);
}

#[tokio::test(start_paused = true)]
async fn failures_are_retried_with_backoff() {
    let mut h = start(Retry {
        budget: 3,
        initial_delay: Duration::from_millis(100),
    });

    h.handle.schedule(7);
    let mut run = h.next_run().await;
    for expected in [200, 400, 800] {
        run.exit.send(Err(anyhow::anyhow!("exit status 1"))).unwrap();
        let start = Instant::now();
        run = h.next_run().await;
        assert_eq!(start.elapsed(), Duration::from_millis(expected));
        assert_eq!((run.config, run.epoch), (7, 0));
    }

    // A new desired config resets the budget.
    h.handle.schedule(8);
    let next = h.next_run().await;
    assert_eq!((next.config, next.epoch), (8, 1));
    next.exit.send(Err(anyhow::anyhow!("exit status 1"))).unwrap();
    let start = Instant::now();
    let next = h.next_run().await;
    assert_eq!(start.elapsed(), Duration::from_millis(200));
    assert_eq!((next.config, next.epoch), (8, 1));
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_is_fatal() {
    let mut h = start(Retry {
        budget: 2,
        initial_delay: Duration::from_millis(100),
    });

    h.handle.schedule(1);
    let mut run = h.next_run().await;
    for expected in [200, 400] {
        run.exit.send(Err(anyhow::anyhow!("exit status 1"))).unwrap();
        let start = Instant::now();
        run = h.next_run().await;
        assert_eq!(start.elapsed(), Duration::from_millis(expected));
        assert_eq!((run.config, run.epoch), (1, 0));
    }

    run.exit.send(Err(anyhow::anyhow!("exit status 1"))).unwrap();
    let err = h.task.await.unwrap().unwrap_err();
    assert!(
        matches!(err, Error::Fatal { attempts: 2, .. }),
        "unexpected error: {err}"
    );
    assert_eq!(*h.proxy.cleaned.lock().unwrap(), [0, 0, 0]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_every_epoch() {
    let mut h = start(Retry::default());

    h.handle.schedule(1);
    let _first = h.next_run().await;
    h.handle.schedule(2);
    let _second = h.next_run().await;

    h.signal.drain().await;
    h.task.await.unwrap().unwrap();

    let mut aborted = h.proxy.aborted.lock().unwrap().clone();
    aborted.sort_unstable();
    assert_eq!(aborted, [0, 1]);
    let mut cleaned = h.proxy.cleaned.lock().unwrap().clone();
    cleaned.sort_unstable();
    assert_eq!(cleaned, [0, 1]);
}

#[tokio::test(start_paused = true)]
async fn runs_until_shutdown() {
    let mut h = start(Retry::default());
    h.handle.schedule(1);
    let _run = h.next_run().await;

    drop(h.handle);
    let mut task = tokio_test::task::spawn(h.task);
    time::sleep(IDLE_DELAY * 2).await;
    tokio_test::assert_pending!(task.poll());

    h.signal.drain().await;
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_pending_retry() {
    let mut h = start(Retry {
        budget: 3,
        initial_delay: Duration::from_secs(10),
    });

    h.handle.schedule(1);
    let run = h.next_run().await;
    run.exit.send(Err(anyhow::anyhow!("exit status 1"))).unwrap();
    h.assert_idle().await;

    h.signal.drain().await;
    h.task.await.unwrap().unwrap();
    assert!(h.runs.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn rescheduling_the_same_config_does_not_delay_retries() {
    let mut h = start(Retry {
        budget: 3,
        initial_delay: Duration::from_secs(1),
    });

    h.handle.schedule(1);
    let mut run = h.next_run().await;

    // Publishes the same config more often than any backoff.
    let republish = tokio::spawn({
        let handle = h.handle.clone();
        async move {
            let mut interval = time::interval(Duration::from_millis(500));
            loop {
                interval.tick().await;
                handle.schedule(1);
            }
        }
    });

    for expected in [2, 4, 8] {
        run.exit.send(Err(anyhow::anyhow!("exit status 1"))).unwrap();
        let start = Instant::now();
        run = h.next_run().await;
        assert_eq!(start.elapsed(), Duration::from_secs(expected));
        assert_eq!((run.config, run.epoch), (1, 0));
    }

    run.exit.send(Err(anyhow::anyhow!("exit status 1"))).unwrap();
    let err = h.task.await.unwrap().unwrap_err();
    assert!(
        matches!(err, Error::Fatal { attempts: 3, .. }),
        "unexpected error: {err}"
    );
    republish.abort();
}

#[test]
fn backoff_doubles() {
    let retry = Retry {
        budget: 3,
        initial_delay: Duration::from_millis(100),
    };
    assert_eq!(retry.backoff(3), Duration::from_millis(200));
    assert_eq!(retry.backoff(2), Duration::from_millis(400));
    assert_eq!(retry.backoff(1), Duration::from_millis(800));
}
