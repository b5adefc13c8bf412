//! Database Models - structs representing database tables (used by sqlx/serde).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Column list matching [`Signature`].
pub const SIGNATURE_COLUMNS: &str = "id, titolare, email, recapito_telefonico, data_emissione, \
    emesso_da, costo_ie, importo_ie, fattura_numero, fattura_tipo_invio, fattura_tipo_pagamento, \
    fattura_data_pagamento, paid, note, created_at, updated_at";

/// Signature (master) record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Signature {
    pub id: i64,
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
    pub paid: bool,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Asset or document association row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Association {
    pub category: String,
    pub subtype: String,
    pub has_item: bool,
}

pub const RENEWAL_COLUMNS: &str = "id, signature_id, sheet_name, email, recapito_telefonico, \
    certificato_cns_l, certificato_cns, certificato_cfd, certificato_cfd_r, data_emissione, \
    data_scadenza, rinnovo_data, rinnovo_da, nuova_emissione_id, costo_ie, importo_ie, \
    fattura_numero, fattura_tipo_invio, fattura_tipo_pagamento, fattura_data_pagamento, note";

/// Renewal cycle row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Renewal {
    pub id: i64,
    pub signature_id: i64,
    pub sheet_name: String,
    pub email: Option<String>,
    pub recapito_telefonico: Option<String>,
    pub certificato_cns_l: bool,
    pub certificato_cns: bool,
    pub certificato_cfd: bool,
    pub certificato_cfd_r: bool,
    pub data_emissione: Option<NaiveDate>,
    pub data_scadenza: Option<NaiveDate>,
    pub rinnovo_data: Option<NaiveDate>,
    pub rinnovo_da: Option<String>,
    pub nuova_emissione_id: Option<i64>,
    pub costo_ie: Option<f64>,
    pub importo_ie: Option<f64>,
    pub fattura_numero: Option<String>,
    pub fattura_tipo_invio: Option<String>,
    pub fattura_tipo_pagamento: Option<String>,
    pub fattura_data_pagamento: Option<NaiveDate>,
    pub note: Option<String>,
}

/// Signature whose latest renewal expires soon
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExpiringSignature {
    pub id: i64,
    pub titolare: String,
    pub email: Option<String>,
    pub recapito_telefonico: Option<String>,
    pub data_scadenza: NaiveDate,
    pub days_left: i32,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: i64,
    pub titolare: String,
    pub email: Option<String>,
    pub recapito_telefonico: Option<String>,
}

/// Per-year count; `year` is NULL for rows without a date
#[derive(Debug, Clone, FromRow)]
pub struct YearCount {
    pub year: Option<i32>,
    pub count: i64,
}

/// Application user. Never serialized: it carries the password hash.
#[derive(Debug, Clone, FromRow)]
pub struct AppUser {
    pub id: i32,
    pub username: String,
    pub password_hash: String,
    pub must_change_password: bool,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub avatar_data: Option<Vec<u8>>,
    pub avatar_mime: Option<String>,
}

pub const USER_COLUMNS: &str = "id, username, password_hash, must_change_password, full_name, \
    avatar_url, avatar_data, avatar_mime";
