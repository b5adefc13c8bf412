//! Allowed asset and document kinds.

use serde::Serialize;

/// A (category, subtype) pair from one of the catalogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ItemKind {
    pub category: &'static str,
    pub subtype: &'static str,
}

pub type Catalog = &'static [(&'static str, &'static [&'static str])];

pub const ASSET_CATALOG: Catalog = &[
    ("KIT", &["STD", "TOK", "AK", "AK-CNS"]),
    ("SMART_CARD", &["STD", "SIM", "TAV"]),
    ("LETTORE", &["TOK", "AK"]),
    ("CERTIFICATO", &["CNS-L", "CNS", "CFD", "CFD-R"]),
];

pub const DOCUMENT_CATALOG: Catalog = &[("DOCUMENTO", &["MR", "AEC", "DI"])];

pub const CERTIFICATE_CATEGORY: &str = "CERTIFICATO";

/// `"smart card"` -> `"SMART_CARD"`.
pub fn normalize_category(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_uppercase()
}

pub fn normalize_subtype(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Look up a pair, accepting loosely formatted input.
pub fn resolve(catalog: Catalog, category: &str, subtype: &str) -> Option<ItemKind> {
    let category = normalize_category(category);
    let subtype = normalize_subtype(subtype);

    catalog
        .iter()
        .find(|(c, _)| *c == category)
        .and_then(|&(c, subtypes)| {
            subtypes
                .iter()
                .find(|s| **s == subtype)
                .map(|&s| ItemKind {
                    category: c,
                    subtype: s,
                })
        })
}

/// Every kind in catalog order.
pub fn all_kinds(catalog: Catalog) -> impl Iterator<Item = ItemKind> {
    catalog.iter().flat_map(|&(category, subtypes)| {
        subtypes.iter().map(move |&subtype| ItemKind {
            category,
            subtype,
        })
    })
}
