/**
 * Signature Routes
 * Listing, detail, expiring alerts and edits of signature records
 */
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    Json,
};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::collections::HashSet;

use crate::{
    catalog::{self, Catalog, ItemKind, ASSET_CATALOG, DOCUMENT_CATALOG},
    config::{config, today},
    db::{
        self,
        models::{
            Association, ExpiringSignature, Renewal, SearchHit, Signature, RENEWAL_COLUMNS,
            SIGNATURE_COLUMNS,
        },
    },
    error::ApiError,
    ingest::{coerce, normalize::Flag, store, workbook::CellValue},
};

// ============================================================================
// Configuration
// ============================================================================

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 200;

const DEFAULT_EXPIRING_DAYS: i64 = 15;
const MAX_EXPIRING_DAYS: i64 = 365;

const MIN_SEARCH_LENGTH: usize = 2;
const DEFAULT_SEARCH_LIMIT: i64 = 20;
const MAX_SEARCH_LIMIT: i64 = 50;

/// Columns accepted by `sortBy`.
const SORTABLE_COLUMNS: &[&str] = &[
    "id",
    "titolare",
    "email",
    "recapito_telefonico",
    "data_emissione",
    "emesso_da",
    "costo_ie",
    "importo_ie",
    "fattura_numero",
    "fattura_tipo_invio",
    "fattura_tipo_pagamento",
    "fattura_data_pagamento",
    "paid",
    "created_at",
    "updated_at",
];

/// Text filters matched as case-insensitive substrings.
const TEXT_FILTERS: &[&str] = &[
    "titolare",
    "email",
    "recapito_telefonico",
    "fattura_numero",
    "fattura_tipo_pagamento",
    "emesso_da",
];

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query parameters for GET /api/signatures
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    pub page: Option<String>,
    #[serde(rename = "pageSize")]
    pub page_size: Option<String>,
    #[serde(rename = "sortBy")]
    pub sort_by: Option<String>,
    #[serde(rename = "sortDir")]
    pub sort_dir: Option<String>,
    pub id: Option<String>,
    pub titolare: Option<String>,
    pub email: Option<String>,
    pub recapito_telefonico: Option<String>,
    pub fattura_numero: Option<String>,
    pub fattura_tipo_pagamento: Option<String>,
    pub emesso_da: Option<String>,
    pub data_emissione: Option<String>,
    pub paid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExpiringQuery {
    pub days: Option<String>,
    pub page: Option<String>,
    #[serde(rename = "pageSize")]
    pub page_size: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub limit: Option<String>,
}

/// One page of results.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub data: Vec<T>,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DataResponse<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct SignatureDetail {
    #[serde(flatten)]
    pub signature: Signature,
    pub assets: Vec<Association>,
    pub documents: Vec<Association>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextIdResponse {
    pub next_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SavedResponse {
    pub id: i64,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaidResponse {
    pub id: i64,
    pub paid: bool,
    pub fattura_data_pagamento: Option<NaiveDate>,
}

/// Asset or document selected in a form.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ItemInput {
    pub category: String,
    pub subtype: String,
}

/// Body of POST and PUT /api/signatures. Loose types are checked in [`validate_payload`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SignaturePayload {
    pub id: Option<Value>,
    pub titolare: Option<String>,
    pub email: Option<String>,
    pub recapito_telefonico: Option<String>,
    pub data_emissione: Option<Value>,
    pub emesso_da: Option<String>,
    pub costo_ie: Option<Value>,
    pub importo_ie: Option<Value>,
    pub fattura_numero: Option<String>,
    pub fattura_tipo_invio: Option<String>,
    pub fattura_tipo_pagamento: Option<String>,
    /// `Some(Value::Null)` when the client sent an explicit `null`.
    #[serde(deserialize_with = "present")]
    pub fattura_data_pagamento: Option<Value>,
    pub paid: Option<Value>,
    pub note: Option<String>,
    pub assets: Option<Vec<ItemInput>>,
    pub documents: Option<Vec<ItemInput>>,
}

/// Keep a sent `null` apart from an absent field.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PaidPayload {
    pub paid: Option<Value>,
}

/// Validated signature fields.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureFields {
    pub titolare: String,
    pub email: Option<String>,
    pub recapito_telefonico: Option<String>,
    pub data_emissione: Option<NaiveDate>,
    pub emesso_da: Option<String>,
    pub costo_ie: Option<f64>,
    pub importo_ie: Option<f64>,
    pub fattura_numero: Option<String>,
    pub fattura_tipo_invio: Option<String>,
    pub fattura_tipo_pagamento: Option<String>,
    pub fattura_data_pagamento: Option<NaiveDate>,
    pub clear_payment_date: bool,
    pub paid: Option<bool>,
    pub note: Option<String>,
    pub assets: Option<HashSet<ItemKind>>,
    pub documents: Option<HashSet<ItemKind>>,
}

// ============================================================================
// Helper Functions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    pub page: i64,
    pub page_size: i64,
}

impl Paging {
    pub fn from_params(page: Option<&str>, page_size: Option<&str>, default_size: i64) -> Self {
        let page = parse_int(page).unwrap_or(1).max(1);
        let page_size = parse_int(page_size)
            .unwrap_or(default_size)
            .clamp(1, MAX_PAGE_SIZE);
        Self { page, page_size }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }

    pub fn wrap<T>(self, data: Vec<T>, total: i64) -> Page<T> {
        let total_pages = ((total + self.page_size - 1) / self.page_size).max(1);
        Page {
            data,
            page: self.page,
            page_size: self.page_size,
            total,
            total_pages,
        }
    }
}

fn parse_int(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| v.trim().parse::<i64>().ok())
}

/// Path ids must be positive integers.
pub fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::validation("ID non valido."))
}

/// `ORDER BY` clause from the whitelisted column and direction.
pub fn order_clause(sort_by: Option<&str>, sort_dir: Option<&str>) -> String {
    let column = sort_by
        .map(str::trim)
        .filter(|c| SORTABLE_COLUMNS.contains(c))
        .unwrap_or("id");
    let direction = match sort_dir.map(|d| d.trim().to_ascii_lowercase()) {
        Some(d) if d == "asc" => "ASC",
        _ => "DESC",
    };
    if column == "id" {
        format!(" ORDER BY id {direction}")
    } else {
        format!(" ORDER BY {column} {direction} NULLS LAST, id {direction}")
    }
}

/// `%term%` with LIKE wildcards escaped.
pub fn contains_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Id(i64),
    Contains(&'static str, String),
    Date(NaiveDate),
    Paid(bool),
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub fn parse_filters(query: &ListQuery) -> Result<Vec<Filter>, ApiError> {
    let mut filters = Vec::new();

    if let Some(id) = non_blank(&query.id) {
        let id = id
            .parse::<i64>()
            .map_err(|_| ApiError::validation("Filtro ID non valido."))?;
        filters.push(Filter::Id(id));
    }

    let text_values = [
        &query.titolare,
        &query.email,
        &query.recapito_telefonico,
        &query.fattura_numero,
        &query.fattura_tipo_pagamento,
        &query.emesso_da,
    ];
    for (&column, value) in TEXT_FILTERS.iter().zip(text_values) {
        if let Some(term) = non_blank(value) {
            filters.push(Filter::Contains(column, term.to_string()));
        }
    }

    if let Some(raw) = non_blank(&query.data_emissione) {
        let date = coerce::parse_date(&CellValue::Text(raw.to_string()), config().business_tz)
            .ok()
            .flatten()
            .ok_or_else(|| ApiError::validation("Filtro data non valido."))?;
        filters.push(Filter::Date(date));
    }

    match non_blank(&query.paid).map(str::to_ascii_lowercase).as_deref() {
        Some("1" | "true") => filters.push(Filter::Paid(true)),
        Some("0" | "false") => filters.push(Filter::Paid(false)),
        _ => {}
    }

    Ok(filters)
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filters: &[Filter]) {
    builder.push(" WHERE 1 = 1");
    for filter in filters {
        match filter {
            Filter::Id(id) => {
                builder.push(" AND id = ").push_bind(*id);
            }
            Filter::Contains(column, term) => {
                builder
                    .push(format!(" AND {column} ILIKE "))
                    .push_bind(contains_pattern(term))
                    .push(" ESCAPE '\\'");
            }
            Filter::Date(date) => {
                builder.push(" AND data_emissione = ").push_bind(*date);
            }
            Filter::Paid(paid) => {
                builder.push(" AND paid = ").push_bind(*paid);
            }
        }
    }
}

fn json_cell(value: &Value) -> CellValue {
    match value {
        Value::Null => CellValue::Empty,
        Value::Bool(b) => CellValue::Bool(*b),
        Value::Number(n) => n.as_f64().map(CellValue::Number).unwrap_or(CellValue::Empty),
        Value::String(s) => CellValue::Text(s.clone()),
        other => CellValue::Text(other.to_string()),
    }
}

/// `true`, `1`, `"si"`, `"x"`... are paid; anything else is not.
pub fn parse_paid(value: &Value) -> Option<bool> {
    match value {
        Value::Null => None,
        other => Some(coerce::parse_bool(&json_cell(other))),
    }
}

fn parse_money_input(field: &str, value: &Option<Value>) -> Result<Option<f64>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    coerce::parse_money(&json_cell(value))
        .map_err(|_| ApiError::validation(format!("Importo non valido per {}.", field)))
}

fn parse_date_input(field: &str, value: &Option<Value>) -> Result<Option<NaiveDate>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    coerce::parse_date(&json_cell(value), config().business_tz)
        .map_err(|_| ApiError::validation(format!("Data non valida per {}.", field)))
}

/// Optional client-supplied id: a positive integer or nothing.
pub fn parse_client_id(value: &Option<Value>) -> Result<Option<i64>, ApiError> {
    let invalid = || ApiError::validation("ID non valido.");
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let id = n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .ok_or_else(invalid)?;
            if id > 0 {
                Ok(Some(id))
            } else {
                Err(invalid())
            }
        }
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => parse_id(s).map(Some),
        Some(_) => Err(invalid()),
    }
}

fn clean_text(value: &Option<String>) -> Option<String> {
    non_blank(value).map(str::to_string)
}

/// Known kinds only; anything outside the catalog is dropped.
pub fn resolve_items(catalog: Catalog, items: &[ItemInput]) -> HashSet<ItemKind> {
    items
        .iter()
        .filter_map(|item| catalog::resolve(catalog, &item.category, &item.subtype))
        .collect()
}

pub fn validate_payload(payload: &SignaturePayload) -> Result<SignatureFields, ApiError> {
    let titolare = clean_text(&payload.titolare)
        .ok_or_else(|| ApiError::validation("Il campo titolare è obbligatorio."))?;

    Ok(SignatureFields {
        titolare,
        email: clean_text(&payload.email),
        recapito_telefonico: clean_text(&payload.recapito_telefonico),
        data_emissione: parse_date_input("data_emissione", &payload.data_emissione)?,
        emesso_da: clean_text(&payload.emesso_da),
        costo_ie: parse_money_input("costo_ie", &payload.costo_ie)?,
        importo_ie: parse_money_input("importo_ie", &payload.importo_ie)?,
        fattura_numero: clean_text(&payload.fattura_numero),
        fattura_tipo_invio: clean_text(&payload.fattura_tipo_invio),
        fattura_tipo_pagamento: clean_text(&payload.fattura_tipo_pagamento),
        fattura_data_pagamento: parse_date_input(
            "fattura_data_pagamento",
            &payload.fattura_data_pagamento,
        )?,
        clear_payment_date: matches!(payload.fattura_data_pagamento, Some(Value::Null)),
        paid: payload.paid.as_ref().and_then(parse_paid),
        note: clean_text(&payload.note),
        assets: payload
            .assets
            .as_deref()
            .map(|items| resolve_items(ASSET_CATALOG, items)),
        documents: payload
            .documents
            .as_deref()
            .map(|items| resolve_items(DOCUMENT_CATALOG, items)),
    })
}

/// Paid keeps an existing payment date or stamps `today`; unpaid clears it.
pub fn resolve_payment_date(
    paid: bool,
    existing: Option<NaiveDate>,
    today: NaiveDate,
) -> Option<NaiveDate> {
    if paid {
        existing.or(Some(today))
    } else {
        None
    }
}

/// Payment date after a PUT: a sent date replaces the stored one, an explicit
/// `null` clears it, an absent field keeps it. `paid` then applies on top.
pub fn updated_payment_date(
    fields: &SignatureFields,
    current: Option<NaiveDate>,
    today: NaiveDate,
) -> Option<NaiveDate> {
    let existing = if fields.clear_payment_date {
        None
    } else {
        fields.fattura_data_pagamento.or(current)
    };
    match fields.paid {
        Some(paid) => resolve_payment_date(paid, existing, today),
        None => existing,
    }
}

/// Rewrite every catalog kind for `id`, flagging the selected ones.
async fn replace_items(
    conn: &mut PgConnection,
    table: &str,
    catalog: Catalog,
    id: i64,
    selected: &HashSet<ItemKind>,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("DELETE FROM {} WHERE signature_id = $1", table))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    let flags = catalog::all_kinds(catalog)
        .map(|kind| {
            (
                id,
                Flag {
                    kind,
                    has_item: selected.contains(&kind),
                },
            )
        })
        .collect();
    store::insert_flags(conn, table, flags).await?;
    Ok(())
}

async fn fetch_items(
    pool: &sqlx::PgPool,
    table: &str,
    id: i64,
) -> Result<Vec<Association>, sqlx::Error> {
    sqlx::query_as::<_, Association>(&format!(
        "SELECT category, subtype, has_item FROM {} \
         WHERE signature_id = $1 AND has_item ORDER BY category, subtype",
        table
    ))
    .bind(id)
    .fetch_all(pool)
    .await
}

// ============================================================================
// Query Handlers
// ============================================================================

/// GET /api/signatures
pub async fn list_signatures(
    Query(query): Query<ListQuery>,
) -> Result<Json<Page<Signature>>, ApiError> {
    let filters = parse_filters(&query)?;
    let paging = Paging::from_params(
        query.page.as_deref(),
        query.page_size.as_deref(),
        DEFAULT_PAGE_SIZE,
    );
    let pool = db::pool()?;
    let base = &config().tables.base;

    let mut count: QueryBuilder<Postgres> = QueryBuilder::new(format!("SELECT COUNT(*) FROM {base}"));
    push_filters(&mut count, &filters);
    let total: i64 = count
        .build_query_scalar::<i64>()
        .fetch_one(pool.as_ref())
        .await?;

    let mut select: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("SELECT {SIGNATURE_COLUMNS} FROM {base}"));
    push_filters(&mut select, &filters);
    select.push(order_clause(query.sort_by.as_deref(), query.sort_dir.as_deref()));
    select
        .push(" LIMIT ")
        .push_bind(paging.page_size)
        .push(" OFFSET ")
        .push_bind(paging.offset());
    let rows = select
        .build_query_as::<Signature>()
        .fetch_all(pool.as_ref())
        .await?;

    Ok(Json(paging.wrap(rows, total)))
}

/// GET /api/signatures/{id}
pub async fn get_signature(
    Path(id): Path<String>,
) -> Result<Json<DataResponse<SignatureDetail>>, ApiError> {
    let id = parse_id(&id)?;
    let pool = db::pool()?;
    let tables = &config().tables;

    let signature = sqlx::query_as::<_, Signature>(&format!(
        "SELECT {SIGNATURE_COLUMNS} FROM {} WHERE id = $1",
        tables.base
    ))
    .bind(id)
    .fetch_optional(pool.as_ref())
    .await?
    .ok_or_else(|| ApiError::not_found("Firma non trovata."))?;

    let assets = fetch_items(&pool, &tables.assets, id).await?;
    let documents = fetch_items(&pool, &tables.documents, id).await?;

    Ok(Json(DataResponse {
        data: SignatureDetail {
            signature,
            assets,
            documents,
        },
    }))
}

/// GET /api/signatures/{id}/renewals
pub async fn get_renewals(
    Path(id): Path<String>,
) -> Result<Json<DataResponse<Vec<Renewal>>>, ApiError> {
    let id = parse_id(&id)?;
    let pool = db::pool()?;

    let renewals = sqlx::query_as::<_, Renewal>(&format!(
        "SELECT {RENEWAL_COLUMNS} FROM {} WHERE signature_id = $1 \
         ORDER BY data_scadenza DESC NULLS LAST, id DESC",
        config().tables.renewals
    ))
    .bind(id)
    .fetch_all(pool.as_ref())
    .await?;

    Ok(Json(DataResponse { data: renewals }))
}

/// Latest expiry per signature, joined to the signature.
fn expiring_source() -> String {
    let tables = &config().tables;
    format!(
        "FROM (SELECT signature_id, MAX(data_scadenza) AS data_scadenza FROM {renewals} \
         WHERE data_scadenza IS NOT NULL GROUP BY signature_id) AS latest \
         JOIN {base} AS s ON s.id = latest.signature_id \
         WHERE latest.data_scadenza BETWEEN $1 AND $2",
        renewals = tables.renewals,
        base = tables.base
    )
}

pub async fn count_expiring(
    pool: &sqlx::PgPool,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(&format!("SELECT COUNT(*) {}", expiring_source()))
        .bind(from)
        .bind(to)
        .fetch_one(pool)
        .await
}

/// GET /api/signatures/expiring
pub async fn list_expiring(
    Query(query): Query<ExpiringQuery>,
) -> Result<Json<Page<ExpiringSignature>>, ApiError> {
    let days = parse_int(query.days.as_deref())
        .unwrap_or(DEFAULT_EXPIRING_DAYS)
        .clamp(1, MAX_EXPIRING_DAYS);
    let paging = Paging::from_params(
        query.page.as_deref(),
        query.page_size.as_deref(),
        DEFAULT_PAGE_SIZE,
    );
    let from = today();
    let to = from + Duration::days(days);
    let pool = db::pool()?;

    let total = count_expiring(&pool, from, to).await?;
    let rows = sqlx::query_as::<_, ExpiringSignature>(&format!(
        "SELECT s.id, s.titolare, s.email, s.recapito_telefonico, latest.data_scadenza, \
         (latest.data_scadenza - $1::date)::int AS days_left {} \
         ORDER BY latest.data_scadenza ASC, s.id ASC LIMIT $3 OFFSET $4",
        expiring_source()
    ))
    .bind(from)
    .bind(to)
    .bind(paging.page_size)
    .bind(paging.offset())
    .fetch_all(pool.as_ref())
    .await?;

    Ok(Json(paging.wrap(rows, total)))
}

/// GET /api/signatures/next-id
pub async fn next_id() -> Result<Json<NextIdResponse>, ApiError> {
    let pool = db::pool()?;
    let next_id: i64 = sqlx::query_scalar(&format!(
        "SELECT COALESCE(MAX(id), 0) + 1 FROM {}",
        config().tables.base
    ))
    .fetch_one(pool.as_ref())
    .await?;

    Ok(Json(NextIdResponse { next_id }))
}

/// GET /api/signatures/search
pub async fn search_signatures(
    Query(query): Query<SearchQuery>,
) -> Result<Json<DataResponse<Vec<SearchHit>>>, ApiError> {
    let term = non_blank(&query.q).unwrap_or_default();
    if term.chars().count() < MIN_SEARCH_LENGTH {
        return Ok(Json(DataResponse { data: Vec::new() }));
    }
    let limit = parse_int(query.limit.as_deref())
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);
    let pool = db::pool()?;

    let mut search: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "SELECT id, titolare, email, recapito_telefonico FROM {} WHERE titolare ILIKE ",
        config().tables.base
    ));
    let pattern = contains_pattern(term);
    search
        .push_bind(pattern.clone())
        .push(" ESCAPE '\\' OR email ILIKE ")
        .push_bind(pattern.clone())
        .push(" ESCAPE '\\' OR recapito_telefonico ILIKE ")
        .push_bind(pattern)
        .push(" ESCAPE '\\'");
    if let Ok(id) = term.parse::<i64>() {
        search.push(" OR id = ").push_bind(id);
    }
    search.push(" ORDER BY titolare ASC, id DESC LIMIT ").push_bind(limit);

    let hits = search
        .build_query_as::<SearchHit>()
        .fetch_all(pool.as_ref())
        .await?;

    Ok(Json(DataResponse { data: hits }))
}

// ============================================================================
// Mutation Handlers
// ============================================================================

/// POST /api/signatures
pub async fn create_signature(
    Json(payload): Json<SignaturePayload>,
) -> Result<(StatusCode, Json<SavedResponse>), ApiError> {
    let fields = validate_payload(&payload)?;
    let requested_id = parse_client_id(&payload.id)?;
    let pool = db::pool()?;
    let tables = &config().tables;

    let mut tx = pool.begin().await?;
    // Serialize id allocation against concurrent creates.
    sqlx::query(&format!("LOCK TABLE {} IN SHARE ROW EXCLUSIVE MODE", tables.base))
        .execute(&mut *tx)
        .await?;

    let id = match requested_id {
        Some(id) => {
            let exists: Option<i64> =
                sqlx::query_scalar(&format!("SELECT id FROM {} WHERE id = $1", tables.base))
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if exists.is_some() {
                return Err(ApiError::Conflict("ID già esistente.".to_string()));
            }
            id
        }
        None => {
            sqlx::query_scalar(&format!("SELECT COALESCE(MAX(id), 0) + 1 FROM {}", tables.base))
                .fetch_one(&mut *tx)
                .await?
        }
    };

    let paid = fields.paid.unwrap_or(false);
    let payment_date = if paid {
        resolve_payment_date(true, fields.fattura_data_pagamento, today())
    } else {
        fields.fattura_data_pagamento
    };

    sqlx::query(&format!(
        "INSERT INTO {} (id, titolare, email, recapito_telefonico, data_emissione, emesso_da, \
         costo_ie, importo_ie, fattura_numero, fattura_tipo_invio, fattura_tipo_pagamento, \
         fattura_data_pagamento, paid, note) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        tables.base
    ))
    .bind(id)
    .bind(&fields.titolare)
    .bind(&fields.email)
    .bind(&fields.recapito_telefonico)
    .bind(fields.data_emissione)
    .bind(&fields.emesso_da)
    .bind(fields.costo_ie)
    .bind(fields.importo_ie)
    .bind(&fields.fattura_numero)
    .bind(&fields.fattura_tipo_invio)
    .bind(&fields.fattura_tipo_pagamento)
    .bind(payment_date)
    .bind(paid)
    .bind(&fields.note)
    .execute(&mut *tx)
    .await?;

    let no_items = HashSet::new();
    replace_items(
        &mut *tx,
        &tables.assets,
        ASSET_CATALOG,
        id,
        fields.assets.as_ref().unwrap_or(&no_items),
    )
    .await?;
    replace_items(
        &mut *tx,
        &tables.documents,
        DOCUMENT_CATALOG,
        id,
        fields.documents.as_ref().unwrap_or(&no_items),
    )
    .await?;

    tx.commit().await?;
    tracing::info!(id, "Signature created");

    Ok((
        StatusCode::CREATED,
        Json(SavedResponse {
            id,
            message: "Firma salvata.".to_string(),
        }),
    ))
}

/// PUT /api/signatures/{id}
///
/// Editable fields are replaced; `fattura_tipo_pagamento` and `note` only when
/// sent. `fattura_data_pagamento: null` clears the payment date. Assets and
/// documents are replaced when the lists are present.
pub async fn update_signature(
    Path(id): Path<String>,
    Json(payload): Json<SignaturePayload>,
) -> Result<Json<SavedResponse>, ApiError> {
    let id = parse_id(&id)?;
    let fields = validate_payload(&payload)?;
    let pool = db::pool()?;
    let tables = &config().tables;

    let mut tx = pool.begin().await?;
    let current: Option<Option<NaiveDate>> = sqlx::query_scalar(&format!(
        "SELECT fattura_data_pagamento FROM {} WHERE id = $1 FOR UPDATE",
        tables.base
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(current_payment) = current else {
        return Err(ApiError::not_found("Firma non trovata."));
    };

    let payment_date = updated_payment_date(&fields, current_payment, today());

    sqlx::query(&format!(
        "UPDATE {} SET titolare = $2, email = $3, recapito_telefonico = $4, \
         data_emissione = $5, emesso_da = $6, costo_ie = $7, importo_ie = $8, \
         fattura_numero = $9, fattura_tipo_invio = $10, \
         fattura_tipo_pagamento = COALESCE($11, fattura_tipo_pagamento), \
         fattura_data_pagamento = $12, paid = COALESCE($13, paid), \
         note = COALESCE($14, note), updated_at = now() \
         WHERE id = $1",
        tables.base
    ))
    .bind(id)
    .bind(&fields.titolare)
    .bind(&fields.email)
    .bind(&fields.recapito_telefonico)
    .bind(fields.data_emissione)
    .bind(&fields.emesso_da)
    .bind(fields.costo_ie)
    .bind(fields.importo_ie)
    .bind(&fields.fattura_numero)
    .bind(&fields.fattura_tipo_invio)
    .bind(&fields.fattura_tipo_pagamento)
    .bind(payment_date)
    .bind(fields.paid)
    .bind(&fields.note)
    .execute(&mut *tx)
    .await?;

    if let Some(assets) = &fields.assets {
        replace_items(&mut *tx, &tables.assets, ASSET_CATALOG, id, assets).await?;
    }
    if let Some(documents) = &fields.documents {
        replace_items(&mut *tx, &tables.documents, DOCUMENT_CATALOG, id, documents).await?;
    }

    tx.commit().await?;
    tracing::info!(id, "Signature updated");

    Ok(Json(SavedResponse {
        id,
        message: "Firma aggiornata.".to_string(),
    }))
}

/// PATCH /api/signatures/{id}/paid
pub async fn set_paid(
    Path(id): Path<String>,
    Json(payload): Json<PaidPayload>,
) -> Result<Json<PaidResponse>, ApiError> {
    let id = parse_id(&id)?;
    let paid = payload
        .paid
        .as_ref()
        .and_then(parse_paid)
        .ok_or_else(|| ApiError::validation("Il campo paid è obbligatorio."))?;
    let pool = db::pool()?;
    let base = &config().tables.base;

    let mut tx = pool.begin().await?;
    let current: Option<Option<NaiveDate>> = sqlx::query_scalar(&format!(
        "SELECT fattura_data_pagamento FROM {base} WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(existing) = current else {
        return Err(ApiError::not_found("Firma non trovata."));
    };

    let payment_date = resolve_payment_date(paid, existing, today());
    sqlx::query(&format!(
        "UPDATE {base} SET paid = $2, fattura_data_pagamento = $3, updated_at = now() WHERE id = $1"
    ))
    .bind(id)
    .bind(paid)
    .bind(payment_date)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(id, paid, "Signature payment status changed");

    Ok(Json(PaidResponse {
        id,
        paid,
        fattura_data_pagamento: payment_date,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request},
        routing::{get, patch},
        Router,
    };
    use tower::ServiceExt;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_paging_clamps_and_counts_pages() {
        let paging = Paging::from_params(Some("0"), Some("1000"), DEFAULT_PAGE_SIZE);
        assert_eq!(paging, Paging { page: 1, page_size: 200 });

        let paging = Paging::from_params(Some("3"), Some("abc"), DEFAULT_PAGE_SIZE);
        assert_eq!(paging.page_size, 20);
        assert_eq!(paging.offset(), 40);

        let page = paging.wrap(Vec::<i64>::new(), 41);
        assert_eq!(page.total_pages, 3);
        assert_eq!(paging.wrap(Vec::<i64>::new(), 0).total_pages, 1);
    }

    #[test]
    fn test_order_clause_uses_whitelist() {
        assert_eq!(order_clause(None, None), " ORDER BY id DESC");
        assert_eq!(
            order_clause(Some("titolare"), Some("ASC")),
            " ORDER BY titolare ASC NULLS LAST, id ASC"
        );
        assert_eq!(
            order_clause(Some("id; DROP TABLE x"), Some("asc")),
            " ORDER BY id ASC"
        );
    }

    #[test]
    fn test_contains_pattern_escapes_wildcards() {
        assert_eq!(contains_pattern("rossi"), "%rossi%");
        assert_eq!(contains_pattern("50%_a\\b"), "%50\\%\\_a\\\\b%");
    }

    #[test]
    fn test_parse_filters() {
        let query = ListQuery {
            id: Some(" 12 ".into()),
            titolare: Some("rossi".into()),
            email: Some("   ".into()),
            data_emissione: Some("2024-03-05".into()),
            paid: Some("true".into()),
            ..Default::default()
        };
        let filters = parse_filters(&query).unwrap();
        assert_eq!(
            filters,
            vec![
                Filter::Id(12),
                Filter::Contains("titolare", "rossi".into()),
                Filter::Date(date(2024, 3, 5)),
                Filter::Paid(true),
            ]
        );

        let bad = ListQuery {
            id: Some("abc".into()),
            ..Default::default()
        };
        assert!(parse_filters(&bad).is_err());

        let unknown_paid = ListQuery {
            paid: Some("maybe".into()),
            ..Default::default()
        };
        assert!(parse_filters(&unknown_paid).unwrap().is_empty());
    }

    #[test]
    fn test_parse_paid_accepts_loose_values() {
        assert_eq!(parse_paid(&Value::Bool(true)), Some(true));
        assert_eq!(parse_paid(&serde_json::json!(1)), Some(true));
        assert_eq!(parse_paid(&serde_json::json!(0)), Some(false));
        assert_eq!(parse_paid(&serde_json::json!("si")), Some(true));
        assert_eq!(parse_paid(&serde_json::json!("no")), Some(false));
        assert_eq!(parse_paid(&Value::Null), None);
    }

    #[test]
    fn test_parse_client_id() {
        assert_eq!(parse_client_id(&None).unwrap(), None);
        assert_eq!(parse_client_id(&Some(serde_json::json!(42))).unwrap(), Some(42));
        assert_eq!(parse_client_id(&Some(serde_json::json!("7"))).unwrap(), Some(7));
        assert_eq!(parse_client_id(&Some(serde_json::json!(""))).unwrap(), None);
        assert!(parse_client_id(&Some(serde_json::json!(0))).is_err());
        assert!(parse_client_id(&Some(serde_json::json!(1.5))).is_err());
        assert!(parse_client_id(&Some(serde_json::json!("x1"))).is_err());
    }

    #[test]
    fn test_validate_payload() {
        let payload: SignaturePayload = serde_json::from_value(serde_json::json!({
            "titolare": "  Mario Rossi ",
            "email": "",
            "data_emissione": "2024-01-31",
            "costo_ie": "1.234,56",
            "importo_ie": 20,
            "paid": 1,
            "assets": [
                {"category": "kit", "subtype": "std"},
                {"category": "smart card", "subtype": "sim"},
                {"category": "KIT", "subtype": "NOPE"}
            ]
        }))
        .unwrap();

        let fields = validate_payload(&payload).unwrap();
        assert_eq!(fields.titolare, "Mario Rossi");
        assert_eq!(fields.email, None);
        assert_eq!(fields.data_emissione, Some(date(2024, 1, 31)));
        assert_eq!(fields.costo_ie, Some(1234.56));
        assert_eq!(fields.importo_ie, Some(20.0));
        assert_eq!(fields.paid, Some(true));
        let assets = fields.assets.unwrap();
        assert_eq!(assets.len(), 2);
        assert!(assets.contains(&ItemKind {
            category: "SMART_CARD",
            subtype: "SIM"
        }));
        assert!(fields.documents.is_none());
    }

    #[test]
    fn test_validate_payload_requires_titolare() {
        let err = validate_payload(&SignaturePayload::default()).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        let payload: SignaturePayload = serde_json::from_value(serde_json::json!({
            "titolare": "A",
            "data_emissione": "not a date"
        }))
        .unwrap();
        assert!(validate_payload(&payload).is_err());
    }

    #[test]
    fn test_resolve_payment_date() {
        let today = date(2024, 6, 1);
        assert_eq!(resolve_payment_date(true, None, today), Some(today));
        assert_eq!(
            resolve_payment_date(true, Some(date(2024, 1, 1)), today),
            Some(date(2024, 1, 1))
        );
        assert_eq!(resolve_payment_date(false, Some(date(2024, 1, 1)), today), None);
    }

    fn fields_from(body: serde_json::Value) -> SignatureFields {
        let payload: SignaturePayload = serde_json::from_value(body).unwrap();
        validate_payload(&payload).unwrap()
    }

    #[test]
    fn test_updated_payment_date() {
        let today = date(2024, 6, 1);
        let stored = Some(date(2024, 1, 1));

        let absent = fields_from(serde_json::json!({"titolare": "Rossi"}));
        assert!(!absent.clear_payment_date);
        assert_eq!(updated_payment_date(&absent, stored, today), stored);

        let cleared = fields_from(serde_json::json!({
            "titolare": "Rossi",
            "fattura_data_pagamento": null
        }));
        assert!(cleared.clear_payment_date);
        assert_eq!(updated_payment_date(&cleared, stored, today), None);

        let replaced = fields_from(serde_json::json!({
            "titolare": "Rossi",
            "fattura_data_pagamento": "2024-03-05"
        }));
        assert_eq!(
            updated_payment_date(&replaced, stored, today),
            Some(date(2024, 3, 5))
        );

        let cleared_but_paid = fields_from(serde_json::json!({
            "titolare": "Rossi",
            "fattura_data_pagamento": null,
            "paid": true
        }));
        assert_eq!(updated_payment_date(&cleared_but_paid, stored, today), Some(today));
    }

    #[tokio::test]
    async fn test_invalid_path_id_is_rejected_before_database() {
        let app = Router::new()
            .route("/api/signatures/{id}", get(get_signature))
            .route("/api/signatures/{id}/paid", patch(set_paid));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/signatures/abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(
                Request::builder()
                    .method("PATCH")
                    .uri("/api/signatures/5/paid")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_without_database_is_unavailable() {
        let app = Router::new().route("/api/signatures", get(list_signatures));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/signatures?page=2&sortBy=titolare")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
