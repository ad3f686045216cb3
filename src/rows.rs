use anyhow::{anyhow, Result};

use crate::workbook::Table;

pub const COLUMN_COUNTRY: &str = "国名";
pub const COLUMN_SUPPLIER: &str = "サプライヤ名";
pub const COLUMN_CATEGORY: &str = "費目";
pub const COLUMN_PROJECT: &str = "案件名";
pub const COLUMN_MEMO: &str = "摘要";

pub const REQUIRED_COLUMNS: [&str; 5] = [
    COLUMN_COUNTRY,
    COLUMN_SUPPLIER,
    COLUMN_CATEGORY,
    COLUMN_PROJECT,
    COLUMN_MEMO,
];

const FIELD_SEPARATOR: &str = " / ";

/// One general-ledger line, in the fixed field order used for the prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlRow {
    pub country: String,
    pub supplier: String,
    pub category: String,
    pub project: String,
    pub memo: String,
}

impl GlRow {
    pub fn new(
        country: impl Into<String>,
        supplier: impl Into<String>,
        category: impl Into<String>,
        project: impl Into<String>,
        memo: impl Into<String>,
    ) -> Self {
        Self {
            country: country.into(),
            supplier: supplier.into(),
            category: category.into(),
            project: project.into(),
            memo: memo.into(),
        }
    }

    pub fn composite_text(&self) -> String {
        [
            self.country.as_str(),
            self.supplier.as_str(),
            self.category.as_str(),
            self.project.as_str(),
            self.memo.as_str(),
        ]
        .join(FIELD_SEPARATOR)
    }

    /// Parses `国名 / サプライヤ名 / 費目 / 案件名 / 摘要`. Missing trailing
    /// fields stay empty; extra separators are kept in the memo. A bare `/`
    /// inside a field, as in `A/S Maersk`, is part of the field.
    pub fn parse_composite(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(anyhow!("row text is empty"));
        }
        let mut parts = input.splitn(5, FIELD_SEPARATOR).map(|part| part.trim().to_string());
        Ok(Self {
            country: parts.next().unwrap_or_default(),
            supplier: parts.next().unwrap_or_default(),
            category: parts.next().unwrap_or_default(),
            project: parts.next().unwrap_or_default(),
            memo: parts.next().unwrap_or_default(),
        })
    }
}

/// Extracts rows from a decoded sheet, rejecting the whole table when any
/// required column is absent.
pub fn rows_from_table(table: &Table) -> Result<Vec<GlRow>> {
    let missing = REQUIRED_COLUMNS
        .iter()
        .filter(|column| table.column_index(column).is_none())
        .copied()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(anyhow!(
            "input is missing required columns: {} (expected {})",
            missing.join(", "),
            REQUIRED_COLUMNS.join("／")
        ));
    }

    let index = |name: &str| table.column_index(name).unwrap_or_default();
    let (country, supplier, category, project, memo) = (
        index(COLUMN_COUNTRY),
        index(COLUMN_SUPPLIER),
        index(COLUMN_CATEGORY),
        index(COLUMN_PROJECT),
        index(COLUMN_MEMO),
    );

    Ok(table
        .rows
        .iter()
        .map(|row| GlRow {
            country: row.text(country),
            supplier: row.text(supplier),
            category: row.text(category),
            project: row.text(project),
            memo: row.text(memo),
        })
        .collect())
}
