//! Cell value coercion into database types.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use regex::Regex;

use super::workbook::CellValue;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoerceError {
    #[error("not a monetary amount: {0:?}")]
    Money(String),

    #[error("not a date: {0:?}")]
    Date(String),

    #[error("spreadsheet serial {0} is out of range")]
    Serial(f64),
}

const TRUTHY: &[&str] = &["■", "x", "si", "sì", "sí", "yes", "y", "true", "1"];

const MS_PER_DAY: f64 = 86_400_000.0;

// Largest serial Excel accepts (9999-12-31).
const MAX_SERIAL: f64 = 2_958_465.0;

lazy_static::lazy_static! {
    static ref DMY_DATE: Regex =
        Regex::new(r"^(\d{1,2})[/.\-](\d{1,2})[/.\-](\d{2,4})$").expect("valid date regex");
    static ref DIGITS: Regex = Regex::new(r"\d+").expect("valid digits regex");
    static ref RENEWAL_REFERENCE: Regex =
        Regex::new(r"(?i)\bNE-?\s*(\d+)").expect("valid reference regex");
}

/// NBSP to space, collapse runs of whitespace, trim.
pub fn standardise(raw: &str) -> String {
    raw.replace('\u{00A0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn parse_bool(value: &CellValue) -> bool {
    match value {
        CellValue::Empty => false,
        CellValue::Bool(b) => *b,
        CellValue::Number(n) => *n != 0.0,
        CellValue::Text(s) => {
            let token = standardise(s).to_lowercase();
            TRUTHY.contains(&token.as_str())
        }
    }
}

pub fn round2(n: f64) -> f64 {
    (n * 100.0).round() / 100.0
}

/// Parse an amount such as `"€ 1.234,56"`, `"12.50"` or a numeric cell.
pub fn parse_money(value: &CellValue) -> Result<Option<f64>, CoerceError> {
    match value {
        CellValue::Empty => Ok(None),
        CellValue::Number(n) if n.is_finite() => Ok(Some(round2(*n))),
        CellValue::Number(n) => Err(CoerceError::Money(n.to_string())),
        CellValue::Bool(b) => Err(CoerceError::Money(b.to_string())),
        CellValue::Text(raw) => {
            let cleaned: String = raw
                .chars()
                .filter(|c| *c != '€' && !c.is_whitespace())
                .collect();
            if cleaned.is_empty() || cleaned == "-" {
                return Ok(None);
            }

            let normalized = if cleaned.contains(',') {
                cleaned.replace('.', "").replace(',', ".")
            } else if is_thousands_grouped(&cleaned) {
                cleaned.replace('.', "")
            } else {
                cleaned.clone()
            };

            normalized
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(|n| Some(round2(n)))
                .ok_or(CoerceError::Money(raw.clone()))
        }
    }
}

// "1.234" and "1.234.567" use dots as thousands separators; "12.5" does not.
fn is_thousands_grouped(s: &str) -> bool {
    let digits = s.trim_start_matches(['-', '+']);
    let mut groups = digits.split('.');
    let Some(first) = groups.next() else {
        return false;
    };
    let rest: Vec<&str> = groups.collect();
    !rest.is_empty()
        && (1..=3).contains(&first.len())
        && first.chars().all(|c| c.is_ascii_digit())
        && rest
            .iter()
            .all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
}

/// Convert a 1900-system spreadsheet serial into a calendar date.
pub fn serial_to_date(serial: f64) -> Result<NaiveDate, CoerceError> {
    if !serial.is_finite() || !(1.0..=MAX_SERIAL).contains(&serial) {
        return Err(CoerceError::Serial(serial));
    }
    let ms = (serial * MS_PER_DAY).round() as i64;
    let days = ms.div_euclid(MS_PER_DAY as i64);
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30).ok_or(CoerceError::Serial(serial))?;
    epoch
        .checked_add_signed(Duration::days(days))
        .ok_or(CoerceError::Serial(serial))
}

/// Parse a date cell. Offsets in ISO timestamps are resolved in `tz`.
pub fn parse_date(value: &CellValue, tz: Tz) -> Result<Option<NaiveDate>, CoerceError> {
    match value {
        CellValue::Empty => Ok(None),
        CellValue::Number(n) => serial_to_date(*n).map(Some),
        CellValue::Bool(b) => Err(CoerceError::Date(b.to_string())),
        CellValue::Text(raw) => {
            let text = raw.trim();
            if text.is_empty() || text == "-" {
                return Ok(None);
            }
            parse_date_text(text, tz)
                .map(Some)
                .ok_or_else(|| CoerceError::Date(raw.clone()))
        }
    }
}

fn parse_date_text(text: &str, tz: Tz) -> Option<NaiveDate> {
    if is_iso_like(text) {
        return parse_iso(text, tz);
    }

    let caps = DMY_DATE.captures(text)?;
    let day: u32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let mut year: i32 = caps[3].parse().ok()?;
    if caps[3].len() == 2 {
        year += if year >= 50 { 1900 } else { 2000 };
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

fn is_iso_like(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() >= 10 && bytes[..4].iter().all(u8::is_ascii_digit) && bytes[4] == b'-'
}

fn parse_iso(text: &str, tz: Tz) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
        return Some(instant.with_timezone(&tz).date_naive());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(local) = NaiveDateTime::parse_from_str(text, format) {
            return Some(local.date());
        }
    }
    None
}

/// First run of digits as a positive id.
pub fn normalize_id(value: &CellValue) -> Option<i64> {
    match value {
        CellValue::Number(n) if n.is_finite() => {
            let id = n.trunc();
            (id >= 1.0 && id < i64::MAX as f64).then_some(id as i64)
        }
        CellValue::Text(s) => DIGITS
            .find(s)
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .filter(|id| *id > 0),
        _ => None,
    }
}

/// Trimmed text; blanks and `-` become `None`.
pub fn text_value(value: &CellValue) -> Option<String> {
    match value {
        CellValue::Empty => None,
        CellValue::Text(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty() && trimmed != "-").then(|| trimmed.to_string())
        }
        CellValue::Number(n) => Some(format_number(*n)),
        CellValue::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
    }
}

pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Extract the signature id from a `NE-<id>` renewal reference.
pub fn parse_renewal_reference(text: &str) -> Option<i64> {
    RENEWAL_REFERENCE
        .captures(text)
        .and_then(|caps| caps[1].parse::<i64>().ok())
        .filter(|id| *id > 0)
}
