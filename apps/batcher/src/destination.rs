use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::buffer::{FlushOutcome, FlushWriter, MicrobatchBuffer, WindowParams};
use crate::config::DestinationConfig;
use crate::outcome::{Outcome, RealTimeDerRow};
use crate::stats::PipelineStats;
use crate::validator::ValidatorApi;
use crate::warehouse::{Rows, WarehouseClient, TABLE_DER_DATA, TABLE_PROJECT_AVERAGES};

/// Sink for executed task outcomes. Workers only see this surface; the
/// variant decides whether an add buffers, streams, or prints.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn add(&self, outcome: Outcome) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Builds the destination named by the config type tag. Unknown tags fail
/// fast at startup.
pub async fn create(
    cfg: &DestinationConfig,
    validator: Option<Arc<dyn ValidatorApi>>,
    stats: Arc<PipelineStats>,
    cancel: &CancellationToken,
) -> Result<Arc<dyn Destination>> {
    match cfg.kind.as_str() {
        "event" => {
            Ok(EventDestination::create(cfg, required_validator(validator)?, stats, cancel).await?)
        }
        "stream" => Ok(StreamDestination::create(cfg).await?),
        "file" => Ok(FileDestination::create(cfg, required_validator(validator)?, stats, cancel)?),
        "stdout" => {
            Ok(StdoutDestination::create(cfg, required_validator(validator)?, stats, cancel)?)
        }
        other => bail!("invalid destination type: {other}"),
    }
}

fn required_validator(validator: Option<Arc<dyn ValidatorApi>>) -> Result<Arc<dyn ValidatorApi>> {
    validator.context("buffered destinations require a validator client")
}

fn window_params(cfg: &DestinationConfig) -> Result<WindowParams> {
    let buffer = cfg
        .buffer
        .as_ref()
        .context("buffered destinations require a buffer config")?;
    Ok(WindowParams {
        // file/stdout runs anchor to process start when no epoch is set.
        start_time: buffer.start_time.unwrap_or_else(Utc::now),
        interval: Duration::from_secs(buffer.interval_secs),
        offset: Duration::from_secs(buffer.offset_secs),
    })
}

struct EventDestination {
    buffer: Arc<MicrobatchBuffer>,
    warehouse: Arc<WarehouseClient>,
}

impl EventDestination {
    async fn create(
        cfg: &DestinationConfig,
        validator: Arc<dyn ValidatorApi>,
        stats: Arc<PipelineStats>,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Destination>> {
        let db_cfg = cfg
            .database
            .as_ref()
            .context("event destination requires a database config")?;
        let warehouse = Arc::new(WarehouseClient::connect(db_cfg).await?);
        let writer = Arc::new(EventWriter {
            warehouse: Arc::clone(&warehouse),
        });
        let buffer = MicrobatchBuffer::new(window_params(cfg)?, validator, writer, stats);
        buffer.start(cancel);
        tracing::info!("event destination created");
        Ok(Arc::new(Self { buffer, warehouse }))
    }
}

#[async_trait]
impl Destination for EventDestination {
    async fn add(&self, outcome: Outcome) -> Result<()> {
        self.buffer.add(outcome);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.buffer.stop().await;
        self.warehouse.close().await;
        tracing::info!("event destination closed");
        Ok(())
    }
}

struct EventWriter {
    warehouse: Arc<WarehouseClient>,
}

#[async_trait]
impl FlushWriter for EventWriter {
    async fn flush(&self, data: &FlushOutcome) -> Result<()> {
        let der_rows: Vec<RealTimeDerRow> = data
            .outcomes
            .iter()
            .flat_map(|o| o.data.iter().cloned())
            .collect();

        self.warehouse
            .put_all(&[
                (TABLE_DER_DATA, Rows::Der(&der_rows)),
                (TABLE_PROJECT_AVERAGES, Rows::Averages(&data.avg_outputs)),
            ])
            .await?;

        tracing::debug!(
            der_records = der_rows.len(),
            avg_records = data.avg_outputs.len(),
            "flushed window to warehouse"
        );
        Ok(())
    }
}

struct StreamDestination {
    warehouse: Arc<WarehouseClient>,
}

impl StreamDestination {
    async fn create(cfg: &DestinationConfig) -> Result<Arc<dyn Destination>> {
        let db_cfg = cfg
            .database
            .as_ref()
            .context("stream destination requires a database config")?;
        let warehouse = Arc::new(WarehouseClient::connect(db_cfg).await?);
        tracing::info!("stream destination created");
        Ok(Arc::new(Self { warehouse }))
    }
}

#[async_trait]
impl Destination for StreamDestination {
    async fn add(&self, outcome: Outcome) -> Result<()> {
        self.warehouse
            .stream_put(TABLE_DER_DATA, Rows::Der(&outcome.data))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.warehouse.close().await;
        tracing::info!("stream destination closed");
        Ok(())
    }
}

struct FileDestination {
    buffer: Arc<MicrobatchBuffer>,
}

impl FileDestination {
    fn create(
        cfg: &DestinationConfig,
        validator: Arc<dyn ValidatorApi>,
        stats: Arc<PipelineStats>,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Destination>> {
        let path = cfg
            .path
            .as_ref()
            .context("file destination requires a path")?;
        let writer = Arc::new(FileWriter::open(path)?);
        let buffer = MicrobatchBuffer::new(window_params(cfg)?, validator, writer, stats);
        buffer.start(cancel);
        tracing::info!(path = %path.display(), "file destination created");
        Ok(Arc::new(Self { buffer }))
    }
}

#[async_trait]
impl Destination for FileDestination {
    async fn add(&self, outcome: Outcome) -> Result<()> {
        self.buffer.add(outcome);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.buffer.stop().await;
        tracing::info!("file destination closed");
        Ok(())
    }
}

struct FileWriter {
    file: Mutex<File>,
}

impl FileWriter {
    fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating output directory {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening output file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl FlushWriter for FileWriter {
    async fn flush(&self, data: &FlushOutcome) -> Result<()> {
        let rendered = serde_json::to_string_pretty(data)?;
        let mut file = self.file.lock().expect("file writer poisoned");
        writeln!(file, "{rendered}")?;
        file.flush()?;
        Ok(())
    }
}

struct StdoutDestination {
    buffer: Arc<MicrobatchBuffer>,
}

impl StdoutDestination {
    fn create(
        cfg: &DestinationConfig,
        validator: Arc<dyn ValidatorApi>,
        stats: Arc<PipelineStats>,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Destination>> {
        let buffer =
            MicrobatchBuffer::new(window_params(cfg)?, validator, Arc::new(StdoutWriter), stats);
        buffer.start(cancel);
        tracing::info!("stdout destination created");
        Ok(Arc::new(Self { buffer }))
    }
}

#[async_trait]
impl Destination for StdoutDestination {
    async fn add(&self, outcome: Outcome) -> Result<()> {
        self.buffer.add(outcome);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.buffer.stop().await;
        tracing::info!("stdout destination closed");
        Ok(())
    }
}

struct StdoutWriter;

// One process-wide lock so interleaved flushes never shear a record.
fn stdout_guard() -> &'static Mutex<()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD.get_or_init(|| Mutex::new(()))
}

#[async_trait]
impl FlushWriter for StdoutWriter {
    async fn flush(&self, data: &FlushOutcome) -> Result<()> {
        let _guard = stdout_guard().lock().expect("stdout guard poisoned");
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        for outcome in &data.outcomes {
            let rendered = serde_json::to_string_pretty(outcome)?;
            writeln!(handle, "{rendered}")?;
        }
        handle.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::validator::{proto, ValidatorError};
    use std::path::PathBuf;

    struct NullValidator;

    #[async_trait]
    impl ValidatorApi for NullValidator {
        async fn send_averages(&self, _: Vec<proto::AverageOutput>) -> Result<(), ValidatorError> {
            Ok(())
        }

        async fn notify_project(&self, _: &str) -> Result<(), ValidatorError> {
            Ok(())
        }
    }

    fn buffered_config(kind: &str, path: Option<PathBuf>) -> DestinationConfig {
        DestinationConfig {
            kind: kind.to_string(),
            path,
            buffer: Some(BufferConfig {
                interval_secs: 3600,
                offset_secs: 30,
                start_time: None,
                validator: None,
            }),
            database: None,
        }
    }

    fn outcome(project: &str) -> Outcome {
        let payload = format!(
            r#"[{{"project_id": "{project}", "der_id": "d1", "current_output": 3.0, "power_meter_measurement": 10.0}}]"#
        );
        crate::task::Task::new(payload.into_bytes())
            .execute(0)
            .expect("execute")
    }

    #[tokio::test]
    async fn factory_rejects_unknown_type() {
        let cfg = DestinationConfig {
            kind: "carrier-pigeon".to_string(),
            path: None,
            buffer: None,
            database: None,
        };
        let err = create(
            &cfg,
            None,
            Arc::new(PipelineStats::new()),
            &CancellationToken::new(),
        )
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("invalid destination type"));
    }

    #[tokio::test]
    async fn buffered_factory_requires_a_validator() {
        let cfg = buffered_config("stdout", None);
        let err = create(
            &cfg,
            None,
            Arc::new(PipelineStats::new()),
            &CancellationToken::new(),
        )
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("validator"));
    }

    #[tokio::test]
    async fn stdout_destination_accepts_and_closes() {
        let cfg = buffered_config("stdout", None);
        let dest = create(
            &cfg,
            Some(Arc::new(NullValidator)),
            Arc::new(PipelineStats::new()),
            &CancellationToken::new(),
        )
            .await
            .expect("create stdout destination");
        dest.add(outcome("p1")).await.expect("add");
        dest.close().await.expect("close");
    }

    #[tokio::test]
    async fn file_destination_writes_flush_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("out.json");
        let cfg = buffered_config("file", Some(path.clone()));

        let dest = create(
            &cfg,
            Some(Arc::new(NullValidator)),
            Arc::new(PipelineStats::new()),
            &CancellationToken::new(),
        )
            .await
            .expect("create file destination");
        let added = outcome("proj-file");
        let task_id = added.task_id.clone();
        dest.add(added).await.expect("add");
        dest.close().await.expect("close");

        let contents = std::fs::read_to_string(&path).expect("read output");
        assert!(contents.contains("proj-file"));
        assert!(contents.contains(&task_id));
        assert!(contents.contains("avg_outputs"));
    }

    #[tokio::test]
    async fn file_destination_requires_a_path() {
        let cfg = buffered_config("file", None);
        let err = create(
            &cfg,
            Some(Arc::new(NullValidator)),
            Arc::new(PipelineStats::new()),
            &CancellationToken::new(),
        )
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("path"));
    }
}
