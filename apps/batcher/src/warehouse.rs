use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::config::DatabaseConfig;
use crate::outcome::{AverageOutput, RealTimeDerRow};

pub const TABLE_DER_DATA: &str = "der_data";
pub const TABLE_PROJECT_AVERAGES: &str = "project_averages";

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("unknown table {0:?}")]
    UnknownTable(String),
    #[error("row type does not match table {table:?}")]
    RowMismatch { table: &'static str },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    DerData,
    ProjectAverages,
}

impl Table {
    fn from_name(name: &str) -> Result<Self, WarehouseError> {
        match name {
            TABLE_DER_DATA => Ok(Table::DerData),
            TABLE_PROJECT_AVERAGES => Ok(Table::ProjectAverages),
            other => Err(WarehouseError::UnknownTable(other.to_string())),
        }
    }
}

/// Rows accepted by the warehouse, one variant per known table.
pub enum Rows<'a> {
    Der(&'a [RealTimeDerRow]),
    Averages(&'a [AverageOutput]),
}

impl Rows<'_> {
    fn len(&self) -> usize {
        match self {
            Rows::Der(rows) => rows.len(),
            Rows::Averages(rows) => rows.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Table-insert client over the warehouse dataset. `dataset_id` maps onto the
/// connection's schema search path; `project_id` only labels log lines.
pub struct WarehouseClient {
    pool: PgPool,
    project_id: String,
}

impl WarehouseClient {
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        let url = read_creds(&cfg.creds_path)?;
        let dataset = cfg.dataset_id.clone();
        let pool = PgPoolOptions::new()
            .max_connections(cfg.pool_size)
            .after_connect(move |conn, _meta| {
                let dataset = dataset.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {dataset}"))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await
            .with_context(|| format!("connecting to warehouse dataset {}", cfg.dataset_id))?;

        tracing::info!(
            project_id = %cfg.project_id,
            dataset_id = %cfg.dataset_id,
            "warehouse client connected"
        );
        Ok(Self {
            pool,
            project_id: cfg.project_id.clone(),
        })
    }

    /// Single streaming insert into one table.
    pub async fn stream_put(&self, table: &str, rows: Rows<'_>) -> Result<(), WarehouseError> {
        if rows.is_empty() {
            return Ok(());
        }
        match (Table::from_name(table)?, rows) {
            (Table::DerData, Rows::Der(rows)) => insert_der(&self.pool, rows).await?,
            (Table::ProjectAverages, Rows::Averages(rows)) => {
                insert_averages(&self.pool, rows).await?
            }
            (Table::DerData, _) => return Err(WarehouseError::RowMismatch { table: TABLE_DER_DATA }),
            (Table::ProjectAverages, _) => {
                return Err(WarehouseError::RowMismatch { table: TABLE_PROJECT_AVERAGES })
            }
        }
        Ok(())
    }

    /// Batched insert across tables in one transaction.
    pub async fn put_all(&self, batches: &[(&str, Rows<'_>)]) -> Result<(), WarehouseError> {
        // Validate every table name up front so a bad batch fails whole.
        for (table, _) in batches {
            Table::from_name(table)?;
        }

        let mut tx = self.pool.begin().await?;
        let mut total = 0usize;
        for (table, rows) in batches {
            if rows.is_empty() {
                continue;
            }
            total += rows.len();
            match (Table::from_name(table)?, rows) {
                (Table::DerData, Rows::Der(rows)) => insert_der(&mut *tx, rows).await?,
                (Table::ProjectAverages, Rows::Averages(rows)) => {
                    insert_averages(&mut *tx, rows).await?
                }
                (Table::DerData, _) => {
                    return Err(WarehouseError::RowMismatch { table: TABLE_DER_DATA })
                }
                (Table::ProjectAverages, _) => {
                    return Err(WarehouseError::RowMismatch { table: TABLE_PROJECT_AVERAGES })
                }
            }
        }
        tx.commit().await?;
        tracing::debug!(project_id = %self.project_id, rows = total, "warehouse batch committed");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!(project_id = %self.project_id, "warehouse client closed");
    }
}

async fn insert_der<'e, E>(executor: E, rows: &[RealTimeDerRow]) -> Result<(), sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO der_data (id, project_id, der_id, device_id, der_type, is_online, \
         timestamp, current_output, units, is_standalone, connection_start_at, current_soc, \
         nameplate_capacity, contract_threshold, baseline, power_meter_measurement) ",
    );
    builder.push_values(rows, |mut b, row| {
        b.push_bind(row.id)
            .push_bind(&row.der.project_id)
            .push_bind(&row.der.der_id)
            .push_bind(&row.der.device_id)
            .push_bind(&row.der.der_type)
            .push_bind(row.der.is_online)
            .push_bind(row.der.timestamp)
            .push_bind(row.der.current_output)
            .push_bind(&row.der.units)
            .push_bind(row.der.is_standalone)
            .push_bind(row.der.connection_start_at)
            .push_bind(row.der.current_soc)
            .push_bind(row.der.nameplate_capacity)
            .push_bind(row.der.contract_threshold)
            .push_bind(row.der.baseline)
            .push_bind(row.der.power_meter_measurement);
    });
    builder.build().execute(executor).await?;
    Ok(())
}

async fn insert_averages<'e, E>(executor: E, rows: &[AverageOutput]) -> Result<(), sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO project_averages (project_id, average_output, baseline, \
         contract_threshold, start_time, end_time) ",
    );
    builder.push_values(rows, |mut b, row| {
        b.push_bind(&row.project_id)
            .push_bind(row.average_output)
            .push_bind(row.baseline)
            .push_bind(row.contract_threshold)
            .push_bind(row.start_time)
            .push_bind(row.end_time);
    });
    builder.build().execute(executor).await?;
    Ok(())
}

fn read_creds(path: &std::path::Path) -> Result<String> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading warehouse credentials {}", path.display()))?;
    contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .with_context(|| format!("warehouse credentials {} are empty", path.display()))
}
