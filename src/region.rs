//! # Region Matcher
//!
//! Classifies a free-text region query against the fixed table of Brazilian
//! federative units: whole country (`BR`), a 2-letter state code, a
//! `"city - UF"` compound, or a bare city name.
//!
//! - State codes are case-sensitive uppercase; an unknown code is a terminal
//!   "unrecognized" outcome, not an error.
//! - City names compare by `fold_key`: NFKD decomposition, combining marks
//!   dropped, case folded. Exact equality on folded keys, never substring
//!   or edit-distance matching.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Query token that selects country-wide totals.
pub const COUNTRY_CODE: &str = "BR";

/// One federative unit: 2-letter code, IBGE numeric id, display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UfEntry {
    pub code: &'static str,
    pub uid: u8,
    pub name: &'static str,
}

/// The 26 states plus the Distrito Federal, keyed by IBGE ids.
pub const BR_UFS: [UfEntry; 27] = [
    UfEntry { code: "RO", uid: 11, name: "Rondônia" },
    UfEntry { code: "AC", uid: 12, name: "Acre" },
    UfEntry { code: "AM", uid: 13, name: "Amazonas" },
    UfEntry { code: "RR", uid: 14, name: "Roraima" },
    UfEntry { code: "PA", uid: 15, name: "Pará" },
    UfEntry { code: "AP", uid: 16, name: "Amapá" },
    UfEntry { code: "TO", uid: 17, name: "Tocantins" },
    UfEntry { code: "MA", uid: 21, name: "Maranhão" },
    UfEntry { code: "PI", uid: 22, name: "Piauí" },
    UfEntry { code: "CE", uid: 23, name: "Ceará" },
    UfEntry { code: "RN", uid: 24, name: "Rio Grande do Norte" },
    UfEntry { code: "PB", uid: 25, name: "Paraíba" },
    UfEntry { code: "PE", uid: 26, name: "Pernambuco" },
    UfEntry { code: "AL", uid: 27, name: "Alagoas" },
    UfEntry { code: "SE", uid: 28, name: "Sergipe" },
    UfEntry { code: "BA", uid: 29, name: "Bahia" },
    UfEntry { code: "MG", uid: 31, name: "Minas Gerais" },
    UfEntry { code: "ES", uid: 32, name: "Espírito Santo" },
    UfEntry { code: "RJ", uid: 33, name: "Rio de Janeiro" },
    UfEntry { code: "SP", uid: 35, name: "São Paulo" },
    UfEntry { code: "PR", uid: 41, name: "Paraná" },
    UfEntry { code: "SC", uid: 42, name: "Santa Catarina" },
    UfEntry { code: "RS", uid: 43, name: "Rio Grande do Sul" },
    UfEntry { code: "MS", uid: 50, name: "Mato Grosso do Sul" },
    UfEntry { code: "MT", uid: 51, name: "Mato Grosso" },
    UfEntry { code: "GO", uid: 52, name: "Goiás" },
    UfEntry { code: "DF", uid: 53, name: "Distrito Federal" },
];

/// Geographic scope of a case-count query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Region {
    /// Whole-country totals.
    Country,
    /// One federative unit, by validated 2-letter code.
    State { code: String },
    /// A city, optionally pinned to a federative unit by a compound query.
    City { name: String, uf: Option<String> },
}

impl Region {
    pub fn state(code: &str) -> Self {
        Region::State { code: code.to_string() }
    }

    /// Display name of the state table entry, when this region is one.
    pub fn state_name(&self) -> Option<&'static str> {
        match self {
            Region::State { code } => uf_by_code(code).map(|e| e.name),
            _ => None,
        }
    }

    pub fn is_country(&self) -> bool {
        matches!(self, Region::Country)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Country => f.write_str(COUNTRY_CODE),
            Region::State { code } => f.write_str(code),
            Region::City { name, uf: Some(uf) } => write!(f, "{name}, {uf}"),
            Region::City { name, uf: None } => f.write_str(name),
        }
    }
}

static COMPOUND: Lazy<Regex> = Lazy::new(|| {
    // "<name> <UF>", "<name>-<UF>", "<name>: <UF>", "<name>, <UF>"
    Regex::new(r"^(?P<name>.+?)[\s:,-]+(?P<uf>[A-Z]{2})$").expect("compound region regex")
});

static STATE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2}$").expect("state code regex"));

/// Classify a raw query. `None` means unrecognized, which callers surface as
/// "not found"; classification itself never fails.
pub fn classify(query: &str) -> Option<Region> {
    let q = query.trim();
    if q.is_empty() {
        return None;
    }
    if q == COUNTRY_CODE {
        return Some(Region::Country);
    }
    if STATE_CODE.is_match(q) {
        // Uppercase pair that is not in the table ("XX") stays unrecognized
        // rather than falling through to the city path.
        return uf_by_code(q).map(|e| Region::state(e.code));
    }
    // The federal sources key states by display name, so a bare query that
    // folds to one ("sao paulo") resolves like its code.
    if let Some(entry) = uf_by_name(q) {
        return Some(Region::state(entry.code));
    }
    if let Some(caps) = COMPOUND.captures(q) {
        let name = caps["name"].trim();
        let uf = &caps["uf"];
        if !name.is_empty() {
            // Compound requires an exact state-code match.
            return uf_by_code(uf).map(|e| Region::City {
                name: name.to_string(),
                uf: Some(e.code.to_string()),
            });
        }
    }
    Some(Region::City { name: q.to_string(), uf: None })
}

pub fn uf_by_code(code: &str) -> Option<&'static UfEntry> {
    BR_UFS.iter().find(|e| e.code == code)
}

/// Accent/case-insensitive lookup by display name ("sao paulo" → SP).
pub fn uf_by_name(name: &str) -> Option<&'static UfEntry> {
    let key = fold_key(name);
    BR_UFS.iter().find(|e| fold_key(e.name) == key)
}

/// Comparison key: NFKD decomposition with combining marks dropped, then
/// lowercased. Composed and decomposed spellings of the same name fold to
/// the same key.
pub fn fold_key(text: &str) -> String {
    text.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Folded exact equality, the only string match adapters are allowed to use
/// for geographic names.
pub fn folded_eq(left: &str, right: &str) -> bool {
    fold_key(left.trim()) == fold_key(right.trim())
}
