//! Spreadsheet ingestion: read, normalize, then write in one transaction.

pub mod coerce;
pub mod columns;
pub mod normalize;
pub mod retry;
pub mod store;
pub mod styles;
pub mod workbook;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use tempfile::TempPath;

use crate::config::config;
use normalize::{ContactUpdate, MasterRecord, RenewalImport, SheetWindow};
use workbook::SheetGrid;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Il file XLS non contiene fogli elaborabili.")]
    NoSheets,

    #[error("Il file XLS non contiene righe valide da importare.")]
    NoValidRows,

    #[error("cannot read workbook: {0}")]
    Workbook(#[from] calamine::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("ingestion task failed: {0}")]
    Task(String),
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSheets => "NO_SHEETS",
            Self::NoValidRows => "NO_VALID_ROWS",
            Self::Workbook(_) => "INVALID_WORKBOOK",
            Self::Io(_) => "IO_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Task(_) => "INGEST_FAILED",
        }
    }

    /// Problems with the uploaded file itself rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::NoSheets | Self::NoValidRows)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub base: u64,
    pub assets: u64,
    pub documents: u64,
    pub contacts_updated: u64,
    pub renewals_inserted: u64,
    pub skipped_renewals: u64,
}

/// Everything one upload will write.
#[derive(Debug, Default)]
pub struct IngestPlan {
    pub masters: Vec<MasterRecord>,
    pub renewals: Vec<RenewalImport>,
    pub contacts: Vec<ContactUpdate>,
}

/// The first sheet is the master sheet, every following sheet a renewal cycle.
pub fn plan_from_sheets(
    sheets: &[SheetGrid],
    window: SheetWindow,
    tz: Tz,
) -> Result<IngestPlan, IngestError> {
    let (master, cycles) = sheets.split_first().ok_or(IngestError::NoSheets)?;

    let masters = normalize::build_master_records(master, window, tz);
    if masters.is_empty() {
        return Err(IngestError::NoValidRows);
    }

    let renewals: Vec<RenewalImport> = cycles
        .iter()
        .flat_map(|sheet| normalize::build_renewal_records(sheet, window, tz))
        .collect();
    let contacts = normalize::contact_updates(&renewals);

    Ok(IngestPlan {
        masters,
        renewals,
        contacts,
    })
}

/// Parse and load the workbook at `path`, then delete it.
///
/// The file is removed even when the caller stops polling midway.
pub async fn ingest_file(pool: &PgPool, path: &Path) -> Result<IngestStats, IngestError> {
    let upload = TempPath::from_path(path);
    let result = run(pool, path.to_path_buf()).await;

    if let Err(e) = upload.close() {
        tracing::warn!(path = %path.display(), error = %e, "Could not remove uploaded file");
    }

    match &result {
        Ok(stats) => tracing::info!(
            base = stats.base,
            assets = stats.assets,
            documents = stats.documents,
            contacts_updated = stats.contacts_updated,
            renewals_inserted = stats.renewals_inserted,
            skipped_renewals = stats.skipped_renewals,
            "Spreadsheet imported"
        ),
        Err(e) => tracing::error!(error = %e, code = e.code(), "Spreadsheet import failed"),
    }

    result
}

async fn run(pool: &PgPool, path: PathBuf) -> Result<IngestStats, IngestError> {
    let settings = config();
    let window = settings.sheet_window;
    let tz = settings.business_tz;

    let plan = tokio::task::spawn_blocking(move || {
        let sheets = workbook::read_workbook(&path)?;
        plan_from_sheets(&sheets, window, tz)
    })
    .await
    .map_err(|e| IngestError::Task(e.to_string()))??;

    tracing::info!(
        masters = plan.masters.len(),
        renewals = plan.renewals.len(),
        contacts = plan.contacts.len(),
        "Workbook parsed"
    );

    Ok(store::apply(
        pool,
        &settings.tables,
        &settings.retry,
        settings.ingest_batch_size,
        plan,
    )
    .await?)
}
