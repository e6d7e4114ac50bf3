use anyhow::{anyhow, bail, Context, Result};
use std::sync::{Arc, Mutex};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, EventBus};
use crate::config::Config;
use crate::destination::{self, Destination};
use crate::mqtt;
use crate::pool::WorkerPool;
use crate::stats::PipelineStats;
use crate::validator::{ValidatorApi, ValidatorClient};

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGTERM: i32 = 15;

const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a clean run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Signal(i32),
    Timeout,
    Canceled,
}

/// Maps a finished run onto the process exit code: 128+signum for a
/// signal-induced shutdown, 0 for any other clean end, 255 otherwise.
pub fn exit_code(result: &Result<Shutdown>) -> i32 {
    match result {
        Ok(Shutdown::Signal(signum)) => 128 + signum,
        Ok(_) => 0,
        Err(_) => 255,
    }
}

/// Brings the pipeline up in dependency order, waits for a signal, the
/// optional run timeout, or cancellation, then drains everything LIFO.
pub async fn run(cfg: Config) -> Result<Shutdown> {
    let cancel = CancellationToken::new();
    let batcher = Batcher::new(&cfg, cancel.clone()).await?;
    if let Err(err) = batcher.start(&cfg).await {
        batcher.stop().await;
        return Err(err);
    }

    let run_timeout = (cfg.batcher.timeout_secs > 0)
        .then(|| Duration::from_secs(cfg.batcher.timeout_secs));

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    tracing::info!("batcher is running");
    let shutdown = tokio::select! {
        _ = sigint.recv() => Shutdown::Signal(SIGINT),
        _ = sigterm.recv() => Shutdown::Signal(SIGTERM),
        _ = sighup.recv() => Shutdown::Signal(SIGHUP),
        _ = run_deadline(run_timeout) => Shutdown::Timeout,
        _ = cancel.cancelled() => Shutdown::Canceled,
    };

    match shutdown {
        Shutdown::Signal(signum) => tracing::info!(signum, "shutdown signal received"),
        Shutdown::Timeout => tracing::info!("run timeout reached"),
        Shutdown::Canceled => tracing::info!("run canceled"),
    }

    cancel.cancel();
    batcher.stop().await;
    Ok(shutdown)
}

async fn run_deadline(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => futures::future::pending::<()>().await,
    }
}

struct Batcher {
    cancel: CancellationToken,
    bus: Arc<EventBus<BusEvent>>,
    pool: Arc<WorkerPool>,
    destination: Arc<dyn Destination>,
    validator: Option<Arc<ValidatorClient>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    mqtt_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Batcher {
    async fn new(cfg: &Config, cancel: CancellationToken) -> Result<Self> {
        let validator = match cfg
            .destination
            .buffer
            .as_ref()
            .and_then(|buffer| buffer.validator.as_ref())
        {
            Some(validator_cfg) => Some(Arc::new(ValidatorClient::connect(validator_cfg).await?)),
            None => None,
        };
        let validator_api = validator
            .as_ref()
            .map(|client| Arc::clone(client) as Arc<dyn ValidatorApi>);

        let stats = Arc::new(PipelineStats::new());
        let destination =
            destination::create(&cfg.destination, validator_api, Arc::clone(&stats), &cancel)
                .await?;
        let bus = Arc::new(EventBus::new());
        let pool = Arc::new(WorkerPool::new(
            &cfg.pool,
            Arc::clone(&destination),
            stats,
            cancel.clone(),
        ));

        Ok(Self {
            cancel,
            bus,
            pool,
            destination,
            validator,
            listener: Mutex::new(None),
            mqtt_task: Mutex::new(None),
        })
    }

    async fn start(&self, cfg: &Config) -> Result<()> {
        tracing::info!("starting batcher");

        let (_, mut events) = self.bus.subscribe(cfg.pool.capacity.max(1));
        let pool = Arc::clone(&self.pool);
        let cancel = self.cancel.clone();
        let listener = tokio::spawn(async move {
            tracing::debug!("event listener started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => pool.submit(event).await,
                        None => break,
                    }
                }
            }
            tracing::debug!("event listener stopped");
        });
        *self.listener.lock().expect("batcher poisoned") = Some(listener);

        self.pool.start();

        let (ready_tx, ready_rx) = oneshot::channel();
        let mqtt_cfg = cfg.mqtt.clone();
        let bus = Arc::clone(&self.bus);
        let cancel = self.cancel.clone();
        let mqtt_task =
            tokio::spawn(async move { mqtt::run(mqtt_cfg, bus, cancel, ready_tx).await });
        *self.mqtt_task.lock().expect("batcher poisoned") = Some(mqtt_task);

        match tokio::time::timeout(BROKER_CONNECT_TIMEOUT, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                // The reader quit before it ever connected; surface its error.
                let task = self.mqtt_task.lock().expect("batcher poisoned").take();
                let err = match task {
                    Some(task) => match task.await {
                        Ok(Ok(())) => anyhow!("mqtt reader exited before connecting"),
                        Ok(Err(err)) => err,
                        Err(join_err) => anyhow!(join_err),
                    },
                    None => anyhow!("mqtt reader missing"),
                };
                return Err(err.context("connecting to broker"));
            }
            Err(_) => bail!(
                "timed out connecting to broker after {BROKER_CONNECT_TIMEOUT:?}"
            ),
        }

        tracing::info!("batcher started");
        Ok(())
    }

    /// Teardown mirrors startup in reverse: broker reader first so nothing
    /// new is accepted, then the bus, the pool, the destination (which runs
    /// its final flush), and last the validator client.
    async fn stop(&self) {
        tracing::info!("initiating batcher shutdown");
        self.cancel.cancel();

        if let Some(task) = self.mqtt_task.lock().expect("batcher poisoned").take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!(error = %err, "mqtt reader failed"),
                Err(err) => tracing::error!(error = %err, "mqtt reader panicked"),
            }
        }

        self.bus.close();

        if let Some(listener) = self.listener.lock().expect("batcher poisoned").take() {
            if let Err(err) = listener.await {
                tracing::error!(error = %err, "event listener panicked");
            }
        }

        self.pool.wait().await;

        if let Err(err) = self.destination.close().await {
            tracing::error!(error = %err, "failed to close destination");
        }

        if let Some(validator) = &self.validator {
            validator.close();
        }
        tracing::info!("batcher shutdown complete");
    }
}
