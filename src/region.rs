use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::settings::Settings;
use crate::workbook;

const LOOKUP_NAME_COLUMN: &str = "国名";
const LOOKUP_CODE_COLUMN: &str = "ISOコード";

/// Read-only country name to 2-letter region code table.
#[derive(Debug, Clone)]
pub struct RegionTable {
    codes: HashMap<String, String>,
    fallback: String,
}

impl RegionTable {
    pub fn new(codes: HashMap<String, String>, fallback: impl Into<String>) -> Self {
        Self {
            codes,
            fallback: fallback.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.countries.clone(), settings.default_region.clone())
    }

    /// Merges a `国名`/`ISOコード` sheet over the current entries.
    pub fn extend_from_workbook(&mut self, path: &Path) -> Result<usize> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read country code file: {}", path.display()))?;
        let table = workbook::read_xlsx(&bytes)
            .with_context(|| format!("failed to decode country code file: {}", path.display()))?;
        let name_col = table
            .column_index(LOOKUP_NAME_COLUMN)
            .ok_or_else(|| anyhow!("country code file has no '{}' column", LOOKUP_NAME_COLUMN))?;
        let code_col = table
            .column_index(LOOKUP_CODE_COLUMN)
            .ok_or_else(|| anyhow!("country code file has no '{}' column", LOOKUP_CODE_COLUMN))?;

        let mut added = 0usize;
        for row in &table.rows {
            let name = row.text(name_col);
            let code = row.text(code_col);
            let (name, code) = (name.trim(), code.trim());
            if name.is_empty() || code.is_empty() {
                continue;
            }
            self.codes.insert(name.to_string(), code.to_uppercase());
            added += 1;
        }
        Ok(added)
    }

    pub fn resolve(&self, country: &str) -> &str {
        let key = country.trim();
        if key.is_empty() {
            return &self.fallback;
        }
        self.codes
            .get(key)
            .map(String::as_str)
            .unwrap_or(&self.fallback)
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workbook::{write_xlsx, Cell, Row, Table};

    fn table() -> RegionTable {
        let mut codes = HashMap::new();
        codes.insert("日本".to_string(), "JP".to_string());
        codes.insert("China".to_string(), "CN".to_string());
        RegionTable::new(codes, "JP")
    }

    #[test]
    fn known_names_resolve_after_trimming() {
        let regions = table();
        assert_eq!(regions.resolve(" China "), "CN");
        assert_eq!(regions.resolve("日本"), "JP");
    }

    #[test]
    fn unknown_or_blank_falls_back() {
        let regions = table();
        assert_eq!(regions.resolve("Atlantis"), "JP");
        assert_eq!(regions.resolve(""), "JP");
        assert_eq!(regions.resolve("china"), "JP");
    }

    #[test]
    fn workbook_entries_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iso_country_codes.xlsx");
        let sheet = Table {
            headers: vec!["国名".to_string(), "ISOコード".to_string()],
            rows: vec![
                Row::new(vec![Cell::text("ドイツ"), Cell::text("de")]),
                Row::new(vec![Cell::text(""), Cell::text("XX")]),
                Row::new(vec![Cell::text("China"), Cell::text("HK")]),
            ],
        };
        fs::write(&path, write_xlsx(&sheet).unwrap()).unwrap();

        let mut regions = table();
        let added = regions.extend_from_workbook(&path).unwrap();
        assert_eq!(added, 2);
        assert_eq!(regions.resolve("ドイツ"), "DE");
        assert_eq!(regions.resolve("China"), "HK");
        assert_eq!(regions.len(), 3);
    }
}
