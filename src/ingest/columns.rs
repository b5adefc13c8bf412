//! Header name to destination field lookup.

use std::collections::HashMap;

use super::coerce::standardise;
use crate::catalog::{self, ItemKind, ASSET_CATALOG, DOCUMENT_CATALOG};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseField {
    Id,
    Titolare,
    DataEmissione,
    EmessoDa,
    CostoIe,
    ImportoIe,
    FatturaNumero,
    FatturaTipoInvio,
    FatturaTipoPagamento,
    Note,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterColumn {
    Base(BaseField),
    Asset(ItemKind),
    Document(ItemKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Certificate {
    CnsL,
    Cns,
    Cfd,
    CfdR,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenewalField {
    Id,
    Titolare,
    Email,
    RecapitoTelefonico,
    Certificate(Certificate),
    DataEmissione,
    DataScadenza,
    RinnovoData,
    RinnovoDa,
    CostoIe,
    ImportoIe,
    FatturaNumero,
    FatturaTipoInvio,
    FatturaTipoPagamento,
    Note,
}

const BASE_HEADERS: &[(&str, BaseField)] = &[
    ("N°", BaseField::Id),
    ("Titolare", BaseField::Titolare),
    ("Data Emissione", BaseField::DataEmissione),
    ("Emesso DA", BaseField::EmessoDa),
    ("Costo (i.e.)", BaseField::CostoIe),
    ("Fatturazione Costo (i.e.)", BaseField::CostoIe),
    ("Importo (i.e.)", BaseField::ImportoIe),
    ("Fatturazione Importo (i.e.)", BaseField::ImportoIe),
    ("N° Documento", BaseField::FatturaNumero),
    ("Fatturazione N° Documento", BaseField::FatturaNumero),
    ("Tipo Invio", BaseField::FatturaTipoInvio),
    ("Fatturazione Tipo Invio", BaseField::FatturaTipoInvio),
    ("Tipo Pag.", BaseField::FatturaTipoPagamento),
    ("Tipo Pagamento", BaseField::FatturaTipoPagamento),
    ("Fatturazione Tipo Pag.", BaseField::FatturaTipoPagamento),
    ("Note", BaseField::Note),
];

// Header text is "<category> <subtype>", e.g. "SMART CARD SIM".
const ASSET_HEADERS: &[(&str, &str, &str)] = &[
    ("KIT STD", "KIT", "STD"),
    ("KIT TOK", "KIT", "TOK"),
    ("KIT AK", "KIT", "AK"),
    ("KIT AK-CNS", "KIT", "AK-CNS"),
    ("SMART CARD STD", "SMART_CARD", "STD"),
    ("SMART CARD SIM", "SMART_CARD", "SIM"),
    ("SMART CARD TAV", "SMART_CARD", "TAV"),
    ("LETTORE TOK", "LETTORE", "TOK"),
    ("LETTORE AK", "LETTORE", "AK"),
    ("CERTIFICATO CNS-L", "CERTIFICATO", "CNS-L"),
    ("CERTIFICATO CNS", "CERTIFICATO", "CNS"),
    ("CERTIFICATO CFD", "CERTIFICATO", "CFD"),
    ("CERTIFICATO CFD-R", "CERTIFICATO", "CFD-R"),
];

const DOCUMENT_HEADERS: &[(&str, &str, &str)] = &[
    ("Documenti MR", "DOCUMENTO", "MR"),
    ("Documenti AEC", "DOCUMENTO", "AEC"),
    ("Documenti DI", "DOCUMENTO", "DI"),
];

const RENEWAL_HEADERS: &[(&str, RenewalField)] = &[
    ("N°", RenewalField::Id),
    ("Titolare", RenewalField::Titolare),
    ("Email", RenewalField::Email),
    ("Recapito Telefonico", RenewalField::RecapitoTelefonico),
    ("CERTIFICATO CNS-L", RenewalField::Certificate(Certificate::CnsL)),
    ("CERTIFICATO CNS", RenewalField::Certificate(Certificate::Cns)),
    ("CERTIFICATO CFD", RenewalField::Certificate(Certificate::Cfd)),
    ("CERTIFICATO CFD-R", RenewalField::Certificate(Certificate::CfdR)),
    ("Emissione", RenewalField::DataEmissione),
    ("Data Emissione", RenewalField::DataEmissione),
    ("Data Scadenza", RenewalField::DataScadenza),
    ("Scadenza", RenewalField::DataScadenza),
    ("Rinnovo Data", RenewalField::RinnovoData),
    ("Rinnovo DA", RenewalField::RinnovoDa),
    ("Costo (i.e.)", RenewalField::CostoIe),
    ("Fatturazione Costo (i.e.)", RenewalField::CostoIe),
    ("Importo (i.e.)", RenewalField::ImportoIe),
    ("Fatturazione Importo (i.e.)", RenewalField::ImportoIe),
    ("N° Documento", RenewalField::FatturaNumero),
    ("Fatturazione N° Documento", RenewalField::FatturaNumero),
    ("Tipo Invio", RenewalField::FatturaTipoInvio),
    ("Fatturazione Tipo Invio", RenewalField::FatturaTipoInvio),
    ("Tipo Pag.", RenewalField::FatturaTipoPagamento),
    ("Tipo Pagamento", RenewalField::FatturaTipoPagamento),
    ("Fatturazione Tipo Pag.", RenewalField::FatturaTipoPagamento),
    ("Note", RenewalField::Note),
    ("column_16", RenewalField::Note),
    ("column_17", RenewalField::Note),
    ("column_18", RenewalField::Note),
];

lazy_static::lazy_static! {
    static ref MASTER_LOOKUP: HashMap<String, MasterColumn> = {
        let mut lookup = HashMap::new();
        for (header, field) in BASE_HEADERS {
            lookup.insert(lookup_key(header), MasterColumn::Base(*field));
        }
        for (header, category, subtype) in ASSET_HEADERS {
            if let Some(kind) = catalog::resolve(ASSET_CATALOG, category, subtype) {
                lookup.insert(lookup_key(header), MasterColumn::Asset(kind));
            }
        }
        for (header, category, subtype) in DOCUMENT_HEADERS {
            if let Some(kind) = catalog::resolve(DOCUMENT_CATALOG, category, subtype) {
                lookup.insert(lookup_key(header), MasterColumn::Document(kind));
            }
        }
        lookup
    };

    static ref RENEWAL_LOOKUP: HashMap<String, RenewalField> = RENEWAL_HEADERS
        .iter()
        .map(|(header, field)| (lookup_key(header), *field))
        .collect();
}

/// Case- and punctuation-insensitive form of a header name.
pub fn lookup_key(header: &str) -> String {
    standardise(header)
        .to_lowercase()
        .chars()
        .map(|c| if c == 'º' { '°' } else { c })
        .filter(|c| c.is_ascii_digit() || c.is_ascii_lowercase() || "àèéìòù°".contains(*c))
        .collect()
}

pub fn classify_master(header: &str) -> Option<MasterColumn> {
    MASTER_LOOKUP.get(&lookup_key(header)).copied()
}

pub fn classify_renewal(header: &str) -> Option<RenewalField> {
    RENEWAL_LOOKUP.get(&lookup_key(header)).copied()
}
