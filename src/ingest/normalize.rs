//! Turning sheet grids into typed import records.

use chrono::NaiveDate;
use chrono_tz::Tz;
use std::collections::HashMap;

use super::{
    coerce::{self, standardise},
    columns::{self, BaseField, Certificate, MasterColumn, RenewalField},
    workbook::{Cell, CellValue, SheetGrid},
};
use crate::{
    catalog::{self, ItemKind, ASSET_CATALOG, CERTIFICATE_CATEGORY, DOCUMENT_CATALOG},
    config::env_or,
};

/// Payment type recorded when the payment-type cell holds a date.
pub const PAYMENT_TYPE_DATED: &str = "Altro";

/// Which spreadsheet rows hold data (1-based, inclusive) and how many header rows precede them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetWindow {
    pub start_row: usize,
    pub end_row: usize,
    pub header_rows: usize,
}

impl Default for SheetWindow {
    fn default() -> Self {
        Self {
            start_row: 10,
            end_row: 2247,
            header_rows: 2,
        }
    }
}

impl SheetWindow {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let start_row = env_or("XLS_START_ROW", defaults.start_row).max(1);
        Self {
            start_row,
            end_row: env_or("XLS_END_ROW", defaults.end_row).max(start_row),
            header_rows: env_or("XLS_HEADER_ROWS", defaults.header_rows).max(1),
        }
    }
}

/// Column names plus the data rows inside the window.
#[derive(Debug)]
pub struct PreparedSheet<'a> {
    pub columns: Vec<String>,
    pub rows: Vec<&'a [Cell]>,
}

fn row_has_values(row: &[Cell]) -> bool {
    row.iter().any(|cell| !cell.value.is_blank())
}

/// Merge header rows column by column; untitled columns become `column_<index>`.
pub fn build_column_names(header_rows: &[&[Cell]]) -> Vec<String> {
    let width = header_rows.iter().map(|row| row.len()).max().unwrap_or(0);

    (0..width)
        .map(|index| {
            let mut parts: Vec<String> = Vec::new();
            for row in header_rows {
                let part = row
                    .get(index)
                    .map(|cell| standardise(&cell.value.display()))
                    .unwrap_or_default();
                if !part.is_empty() && !parts.contains(&part) {
                    parts.push(part);
                }
            }
            if parts.is_empty() {
                format!("column_{}", index)
            } else {
                parts.join(" ")
            }
        })
        .collect()
}

pub fn prepare_sheet(grid: &SheetGrid, window: SheetWindow) -> PreparedSheet<'_> {
    let header_candidates: Vec<&[Cell]> = (1..window.start_row)
        .filter_map(|number| grid.row(number))
        .filter(|row| row_has_values(row))
        .collect();
    let skip = header_candidates.len().saturating_sub(window.header_rows);
    let columns = build_column_names(&header_candidates[skip..]);

    let rows = (window.start_row..=window.end_row)
        .map_while(|number| {
            if number > grid.rows.len() {
                None
            } else {
                Some(grid.row(number).unwrap_or(&[]))
            }
        })
        .filter(|row| row_has_values(row))
        .collect();

    PreparedSheet { columns, rows }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignatureImport {
    pub id: i64,
    pub titolare: String,
    pub data_emissione: Option<NaiveDate>,
    pub emesso_da: Option<String>,
    pub costo_ie: Option<f64>,
    pub importo_ie: Option<f64>,
    pub fattura_numero: Option<String>,
    pub fattura_tipo_invio: Option<String>,
    pub fattura_tipo_pagamento: Option<String>,
    pub fattura_data_pagamento: Option<NaiveDate>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flag {
    pub kind: ItemKind,
    pub has_item: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterRecord {
    pub signature: SignatureImport,
    pub assets: Vec<Flag>,
    pub documents: Vec<Flag>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenewalImport {
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactUpdate {
    pub id: i64,
    pub email: Option<String>,
    pub recapito_telefonico: Option<String>,
}

/// Later non-blank cells win; a blank cell only fills an empty slot.
fn assign<'a, K: std::hash::Hash + Eq>(map: &mut HashMap<K, &'a Cell>, key: K, cell: &'a Cell) {
    if !cell.value.is_blank() || !map.contains_key(&key) {
        map.insert(key, cell);
    }
}

fn date_or_warn(cell: Option<&Cell>, tz: Tz, sheet: &str, column: &str) -> Option<NaiveDate> {
    let cell = cell?;
    match coerce::parse_date(&cell.value, tz) {
        Ok(date) => date,
        Err(e) => {
            tracing::debug!(sheet, column, error = %e, "Ignoring unparseable date");
            None
        }
    }
}

fn money_or_warn(cell: Option<&Cell>, sheet: &str, column: &str) -> Option<f64> {
    let cell = cell?;
    match coerce::parse_money(&cell.value) {
        Ok(amount) => amount,
        Err(e) => {
            tracing::debug!(sheet, column, error = %e, "Ignoring unparseable amount");
            None
        }
    }
}

fn text(cell: Option<&Cell>) -> Option<String> {
    cell.and_then(|c| coerce::text_value(&c.value))
}

/// A date in the payment-type column means "paid on that date".
fn payment_fields(cell: Option<&Cell>, tz: Tz) -> (Option<String>, Option<NaiveDate>) {
    let Some(cell) = cell else {
        return (None, None);
    };
    match coerce::parse_date(&cell.value, tz) {
        Ok(Some(date)) => (Some(PAYMENT_TYPE_DATED.to_string()), Some(date)),
        _ => (coerce::text_value(&cell.value), None),
    }
}

/// Certificate cells may be ticked by colouring them instead of typing a marker.
fn certificate_flag(cell: &Cell) -> bool {
    if cell.value.is_blank() {
        cell.highlighted
    } else {
        coerce::parse_bool(&cell.value)
    }
}

fn master_record(columns: &[String], row: &[Cell], sheet: &str, tz: Tz) -> Option<MasterRecord> {
    let mut base: HashMap<BaseField, &Cell> = HashMap::new();
    let mut assets: HashMap<ItemKind, bool> = HashMap::new();
    let mut documents: HashMap<ItemKind, bool> = HashMap::new();

    for (column, cell) in columns.iter().zip(row.iter()) {
        match columns::classify_master(column) {
            Some(MasterColumn::Base(field)) => assign(&mut base, field, cell),
            Some(MasterColumn::Asset(kind)) => {
                let flag = if kind.category == CERTIFICATE_CATEGORY {
                    certificate_flag(cell)
                } else {
                    coerce::parse_bool(&cell.value)
                };
                let entry = assets.entry(kind).or_insert(false);
                *entry = *entry || flag;
            }
            Some(MasterColumn::Document(kind)) => {
                let entry = documents.entry(kind).or_insert(false);
                *entry = *entry || coerce::parse_bool(&cell.value);
            }
            None => {}
        }
    }

    let id = base
        .get(&BaseField::Id)
        .and_then(|cell| coerce::normalize_id(&cell.value))?;
    let field = |f: BaseField| base.get(&f).copied();
    let (fattura_tipo_pagamento, fattura_data_pagamento) =
        payment_fields(field(BaseField::FatturaTipoPagamento), tz);

    let signature = SignatureImport {
        id,
        titolare: text(field(BaseField::Titolare)).unwrap_or_default(),
        data_emissione: date_or_warn(field(BaseField::DataEmissione), tz, sheet, "data_emissione"),
        emesso_da: text(field(BaseField::EmessoDa)),
        costo_ie: money_or_warn(field(BaseField::CostoIe), sheet, "costo_ie"),
        importo_ie: money_or_warn(field(BaseField::ImportoIe), sheet, "importo_ie"),
        fattura_numero: text(field(BaseField::FatturaNumero)),
        fattura_tipo_invio: text(field(BaseField::FatturaTipoInvio)),
        fattura_tipo_pagamento,
        fattura_data_pagamento,
        note: text(field(BaseField::Note)),
    };

    Some(MasterRecord {
        signature,
        assets: catalog::all_kinds(ASSET_CATALOG)
            .map(|kind| Flag {
                kind,
                has_item: assets.get(&kind).copied().unwrap_or(false),
            })
            .collect(),
        documents: catalog::all_kinds(DOCUMENT_CATALOG)
            .map(|kind| Flag {
                kind,
                has_item: documents.get(&kind).copied().unwrap_or(false),
            })
            .collect(),
    })
}

/// One record per signature id found on the master sheet; the last row for an id wins.
pub fn build_master_records(grid: &SheetGrid, window: SheetWindow, tz: Tz) -> Vec<MasterRecord> {
    let prepared = prepare_sheet(grid, window);
    let mut records: Vec<MasterRecord> = Vec::new();
    let mut positions: HashMap<i64, usize> = HashMap::new();
    let mut skipped = 0usize;

    for row in &prepared.rows {
        let Some(record) = master_record(&prepared.columns, row, &grid.name, tz) else {
            skipped += 1;
            continue;
        };
        match positions.get(&record.signature.id) {
            Some(&index) => records[index] = record,
            None => {
                positions.insert(record.signature.id, records.len());
                records.push(record);
            }
        }
    }

    if skipped > 0 {
        tracing::debug!(sheet = %grid.name, skipped, "Master rows without a valid id skipped");
    }
    records
}

fn merge_notes(cells: &[&Cell]) -> Option<String> {
    let mut notes: Vec<String> = Vec::new();
    for cell in cells {
        if let Some(note) = coerce::text_value(&cell.value) {
            if !notes.contains(&note) {
                notes.push(note);
            }
        }
    }
    (!notes.is_empty()).then(|| notes.join(" | "))
}

fn renewal_record(columns: &[String], row: &[Cell], sheet: &str, tz: Tz) -> Option<RenewalImport> {
    let mut fields: HashMap<RenewalField, &Cell> = HashMap::new();
    let mut certificates: HashMap<Certificate, bool> = HashMap::new();
    let mut notes: Vec<&Cell> = Vec::new();

    for (column, cell) in columns.iter().zip(row.iter()) {
        match columns::classify_renewal(column) {
            Some(RenewalField::Note) => notes.push(cell),
            Some(RenewalField::Certificate(certificate)) => {
                let entry = certificates.entry(certificate).or_insert(false);
                *entry = *entry || certificate_flag(cell);
            }
            Some(field) => assign(&mut fields, field, cell),
            None => {}
        }
    }

    let signature_id = fields
        .get(&RenewalField::Id)
        .and_then(|cell| coerce::normalize_id(&cell.value))?;
    let field = |f: RenewalField| fields.get(&f).copied();
    let (fattura_tipo_pagamento, fattura_data_pagamento) =
        payment_fields(field(RenewalField::FatturaTipoPagamento), tz);
    let rinnovo_da = text(field(RenewalField::RinnovoDa));
    let certificate = |c: Certificate| certificates.get(&c).copied().unwrap_or(false);

    Some(RenewalImport {
        signature_id,
        sheet_name: sheet.to_string(),
        email: text(field(RenewalField::Email)),
        recapito_telefonico: text(field(RenewalField::RecapitoTelefonico)),
        certificato_cns_l: certificate(Certificate::CnsL),
        certificato_cns: certificate(Certificate::Cns),
        certificato_cfd: certificate(Certificate::Cfd),
        certificato_cfd_r: certificate(Certificate::CfdR),
        data_emissione: date_or_warn(field(RenewalField::DataEmissione), tz, sheet, "data_emissione"),
        data_scadenza: date_or_warn(field(RenewalField::DataScadenza), tz, sheet, "data_scadenza"),
        rinnovo_data: date_or_warn(field(RenewalField::RinnovoData), tz, sheet, "rinnovo_data"),
        nuova_emissione_id: rinnovo_da.as_deref().and_then(coerce::parse_renewal_reference),
        rinnovo_da,
        costo_ie: money_or_warn(field(RenewalField::CostoIe), sheet, "costo_ie"),
        importo_ie: money_or_warn(field(RenewalField::ImportoIe), sheet, "importo_ie"),
        fattura_numero: text(field(RenewalField::FatturaNumero)),
        fattura_tipo_invio: text(field(RenewalField::FatturaTipoInvio)),
        fattura_tipo_pagamento,
        fattura_data_pagamento,
        note: merge_notes(&notes),
    })
}

/// Renewal rows of one cycle sheet, in row order.
pub fn build_renewal_records(grid: &SheetGrid, window: SheetWindow, tz: Tz) -> Vec<RenewalImport> {
    let prepared = prepare_sheet(grid, window);
    prepared
        .rows
        .iter()
        .filter_map(|row| renewal_record(&prepared.columns, row, &grid.name, tz))
        .collect()
}

/// Contact details seen on renewal sheets, one entry per signature. Later sheets win.
pub fn contact_updates(renewals: &[RenewalImport]) -> Vec<ContactUpdate> {
    let mut updates: Vec<ContactUpdate> = Vec::new();
    let mut positions: HashMap<i64, usize> = HashMap::new();

    for renewal in renewals {
        if renewal.email.is_none() && renewal.recapito_telefonico.is_none() {
            continue;
        }
        let index = *positions.entry(renewal.signature_id).or_insert_with(|| {
            updates.push(ContactUpdate {
                id: renewal.signature_id,
                email: None,
                recapito_telefonico: None,
            });
            updates.len() - 1
        });
        let update = &mut updates[index];
        if renewal.email.is_some() {
            update.email = renewal.email.clone();
        }
        if renewal.recapito_telefonico.is_some() {
            update.recapito_telefonico = renewal.recapito_telefonico.clone();
        }
    }

    updates
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROME: Tz = chrono_tz::Europe::Rome;

    fn window() -> SheetWindow {
        SheetWindow {
            start_row: 3,
            end_row: 20,
            header_rows: 2,
        }
    }

    fn t(s: &str) -> Cell {
        if s.is_empty() {
            Cell::default()
        } else {
            Cell::new(CellValue::Text(s.to_string()))
        }
    }

    fn n(v: f64) -> Cell {
        Cell::new(CellValue::Number(v))
    }

    fn highlighted() -> Cell {
        Cell {
            value: CellValue::Empty,
            highlighted: true,
        }
    }

    fn master_grid(data: Vec<Vec<Cell>>) -> SheetGrid {
        let mut rows = vec![
            vec![t(""), t(""), t("Fatturazione"), t("Fatturazione"), t("CERTIFICATO"), t("KIT"), t("Documenti")],
            vec![t("N°"), t("Titolare"), t("Importo (i.e.)"), t("Tipo Pag."), t("CNS"), t("STD"), t("MR")],
        ];
        rows.extend(data);
        SheetGrid::new("Master", rows)
    }

    #[test]
    fn test_build_column_names_merges_header_rows() {
        let top = vec![t("Fatturazione"), t(""), t("KIT"), t("")];
        let bottom = vec![t("N° Documento"), t("Titolare"), t("KIT"), t("")];
        let names = build_column_names(&[&top, &bottom]);
        assert_eq!(names, vec!["Fatturazione N° Documento", "Titolare", "KIT", "column_3"]);
    }

    #[test]
    fn test_prepare_sheet_uses_last_header_rows_and_window() {
        let rows = vec![
            vec![t("Report firme")],
            vec![t("")],
            vec![t("N°"), t("Titolare")],
            vec![n(1.0), t("Rossi")],
            vec![t(""), t(" ")],
            vec![n(2.0), t("Bianchi")],
            vec![n(3.0), t("Fuori finestra")],
        ];
        let grid = SheetGrid::new("S", rows);
        let window = SheetWindow {
            start_row: 4,
            end_row: 6,
            header_rows: 2,
        };
        let prepared = prepare_sheet(&grid, window);
        assert_eq!(prepared.columns, vec!["Report firme N°", "Titolare"]);
        assert_eq!(prepared.rows.len(), 2);
        assert_eq!(prepared.rows[1][1].value, CellValue::Text("Bianchi".into()));
    }

    #[test]
    fn test_master_records_last_row_wins_and_skip_missing_ids() {
        let grid = master_grid(vec![
            vec![n(1.0), t("Rossi"), t("10,00"), t("Bonifico"), t("x"), t(""), t("")],
            vec![t("n.d."), t("Senza id")],
            vec![n(1.0), t("Rossi Mario"), t("12,50"), t("Bonifico"), t(""), t("■"), t("si")],
        ]);
        let records = build_master_records(&grid, window(), ROME);

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.signature.id, 1);
        assert_eq!(record.signature.titolare, "Rossi Mario");
        assert_eq!(record.signature.importo_ie, Some(12.5));
        assert_eq!(record.assets.len(), 13);
        assert_eq!(record.documents.len(), 3);

        let has = |flags: &[Flag], category: &str, subtype: &str| {
            flags
                .iter()
                .find(|f| f.kind.category == category && f.kind.subtype == subtype)
                .map(|f| f.has_item)
                .unwrap()
        };
        assert!(!has(&record.assets, "CERTIFICATO", "CNS"));
        assert!(has(&record.assets, "KIT", "STD"));
        assert!(has(&record.documents, "DOCUMENTO", "MR"));
        assert!(!has(&record.documents, "DOCUMENTO", "DI"));
    }

    #[test]
    fn test_master_payment_date_becomes_altro() {
        let grid = master_grid(vec![vec![n(5.0), t("Verdi"), t(""), t("15/01/2024")]]);
        let records = build_master_records(&grid, window(), ROME);
        let signature = &records[0].signature;
        assert_eq!(signature.fattura_tipo_pagamento.as_deref(), Some("Altro"));
        assert_eq!(
            signature.fattura_data_pagamento,
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
    }

    #[test]
    fn test_highlighted_blank_certificate_counts_as_present() {
        let grid = master_grid(vec![vec![n(9.0), t("Neri"), t(""), t(""), highlighted()]]);
        let records = build_master_records(&grid, window(), ROME);
        let cns = records[0]
            .assets
            .iter()
            .find(|f| f.kind.category == "CERTIFICATO" && f.kind.subtype == "CNS")
            .unwrap();
        assert!(cns.has_item);
    }

    #[test]
    fn test_renewal_records() {
        let mut header = vec![t(""); 18];
        header[0] = t("N°");
        header[1] = t("Email");
        header[2] = t("CERTIFICATO CFD");
        header[3] = t("Data Scadenza");
        header[4] = t("Rinnovo DA");
        header[5] = t("Note");
        let mut data = vec![t(""); 18];
        data[0] = n(12.0);
        data[1] = t("a@b.it");
        data[2] = highlighted();
        data[3] = t("31/12/2025");
        data[4] = t("ne-40");
        data[5] = t("chiamare");
        data[16] = t("urgente");
        data[17] = t("chiamare");

        let grid = SheetGrid::new("Rinnovi 2025", vec![header, data]);
        let window = SheetWindow {
            start_row: 2,
            end_row: 10,
            header_rows: 1,
        };
        let renewals = build_renewal_records(&grid, window, ROME);

        assert_eq!(renewals.len(), 1);
        let renewal = &renewals[0];
        assert_eq!(renewal.signature_id, 12);
        assert_eq!(renewal.sheet_name, "Rinnovi 2025");
        assert!(renewal.certificato_cfd);
        assert!(!renewal.certificato_cns);
        assert_eq!(renewal.data_scadenza, NaiveDate::from_ymd_opt(2025, 12, 31));
        assert_eq!(renewal.rinnovo_da.as_deref(), Some("ne-40"));
        assert_eq!(renewal.nuova_emissione_id, Some(40));
        assert_eq!(renewal.note.as_deref(), Some("chiamare | urgente"));
    }

    #[test]
    fn test_contact_updates_later_sheets_win() {
        let renewals = vec![
            RenewalImport {
                signature_id: 1,
                email: Some("old@x.it".into()),
                recapito_telefonico: Some("111".into()),
                ..Default::default()
            },
            RenewalImport {
                signature_id: 2,
                ..Default::default()
            },
            RenewalImport {
                signature_id: 1,
                email: Some("new@x.it".into()),
                ..Default::default()
            },
        ];
        let updates = contact_updates(&renewals);
        assert_eq!(
            updates,
            vec![ContactUpdate {
                id: 1,
                email: Some("new@x.it".into()),
                recapito_telefonico: Some("111".into()),
            }]
        );
    }
}
