/**
 * Statistics Routes
 * Yearly aggregates and dashboard summary counters
 */
use axum::Json;
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{
    config::{config, today},
    db::{self, models::YearCount},
    error::ApiError,
    ingest::coerce::round2,
    routes::signatures::count_expiring,
};

/// Window of the "expiring soon" counter.
const SUMMARY_EXPIRING_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearStat {
    pub year: Option<i32>,
    pub count: i64,
    pub percentage: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct YearlyStatsResponse {
    pub data: Vec<YearStat>,
    pub total: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResponse {
    pub expiring_next30: i64,
    pub unpaid_count: i64,
}

/// Attach each year's share of the total, rounded to two decimals.
pub fn with_percentages(counts: Vec<YearCount>) -> YearlyStatsResponse {
    let total: i64 = counts.iter().map(|c| c.count).sum();
    let data = counts
        .into_iter()
        .map(|c| YearStat {
            year: c.year,
            count: c.count,
            percentage: if total > 0 {
                round2(c.count as f64 * 100.0 / total as f64)
            } else {
                0.0
            },
        })
        .collect();
    YearlyStatsResponse { data, total }
}

async fn yearly_counts(table: &str, column: &str, only_dated: bool) -> Result<Vec<YearCount>, ApiError> {
    let pool = db::pool()?;
    let filter = if only_dated {
        format!(" WHERE {column} IS NOT NULL")
    } else {
        String::new()
    };
    let counts = sqlx::query_as::<_, YearCount>(&format!(
        "SELECT EXTRACT(YEAR FROM {column})::int AS year, COUNT(*) AS count \
         FROM {table}{filter} GROUP BY 1 ORDER BY 1 ASC NULLS LAST"
    ))
    .fetch_all(pool.as_ref())
    .await?;
    Ok(counts)
}

/// GET /api/signatures/stats/yearly
///
/// Signatures without an issuance date are reported under a `null` year.
pub async fn yearly_stats() -> Result<Json<YearlyStatsResponse>, ApiError> {
    let counts = yearly_counts(&config().tables.base, "data_emissione", false).await?;
    Ok(Json(with_percentages(counts)))
}

/// GET /api/signatures/stats/renewals/yearly
pub async fn renewals_yearly_stats() -> Result<Json<YearlyStatsResponse>, ApiError> {
    let counts = yearly_counts(&config().tables.renewals, "rinnovo_data", true).await?;
    Ok(Json(with_percentages(counts)))
}

/// GET /api/reports/summary
pub async fn summary() -> Result<Json<SummaryResponse>, ApiError> {
    let pool = db::pool()?;
    let from = today();
    let expiring_next30 =
        count_expiring(&pool, from, from + Duration::days(SUMMARY_EXPIRING_DAYS)).await?;
    let unpaid_count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {} WHERE NOT paid",
        config().tables.base
    ))
    .fetch_one(pool.as_ref())
    .await?;

    Ok(Json(SummaryResponse {
        expiring_next30,
        unpaid_count,
    }))
}
