use anyhow::{anyhow, Context, Result};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::batch::ResultTable;
use crate::workbook::{Cell, Table};

pub const COLUMN_TRANSLATION: &str = "翻訳結果";
pub const COLUMN_NOTE: &str = "注釈";
pub const COLUMN_SUPPLIER_INFO: &str = "サプライヤ情報";

/// Writes the three derived columns onto the input table in row order.
/// An incomplete result table is an error.
pub fn materialize(mut table: Table, results: ResultTable) -> Result<Table> {
    if results.len() != table.rows.len() {
        return Err(anyhow!(
            "result table covers {} rows but the input has {}",
            results.len(),
            table.rows.len()
        ));
    }
    let outcomes = results.into_dense()?;

    let mut translations = Vec::with_capacity(outcomes.len());
    let mut notes = Vec::with_capacity(outcomes.len());
    let mut supplier_info = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        translations.push(Cell::Text(outcome.translation));
        notes.push(Cell::Text(outcome.note));
        supplier_info.push(outcome.supplier_info.map(Cell::Text).unwrap_or_default());
    }

    table.set_column(COLUMN_TRANSLATION, translations)?;
    table.set_column(COLUMN_NOTE, notes)?;
    table.set_column(COLUMN_SUPPLIER_INFO, supplier_info)?;
    Ok(table)
}

/// `{prefix}_{YYYYMMDD_HHMM}.xlsx`
pub fn output_filename(prefix: &str, at: OffsetDateTime) -> Result<String> {
    let stamp = at
        .format(format_description!("[year][month][day]_[hour][minute]"))
        .with_context(|| "failed to format output timestamp")?;
    Ok(format!("{}_{}.xlsx", prefix, stamp))
}

pub fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RowOutcome;
    use crate::workbook::{read_xlsx, write_xlsx, Row};
    use time::macros::datetime;

    fn input(rows: usize) -> Table {
        Table {
            headers: vec!["国名".to_string(), "金額".to_string()],
            rows: (0..rows)
                .map(|index| {
                    Row::new(vec![
                        Cell::text(format!("country-{}", index)),
                        Cell::Number(index as f64),
                    ])
                })
                .collect(),
        }
    }

    fn outcome(label: &str) -> RowOutcome {
        RowOutcome {
            translation: format!("訳{}", label),
            note: format!("注{}", label),
            supplier_info: Some(format!("情報{}", label)),
        }
    }

    #[test]
    fn columns_are_appended_in_row_order() {
        let mut results = ResultTable::new(3);
        results.insert(2, outcome("2")).unwrap();
        results.insert(0, outcome("0")).unwrap();
        results.insert(1, RowOutcome::failed("timeout")).unwrap();

        let table = materialize(input(3), results).unwrap();
        assert_eq!(
            table.headers,
            vec!["国名", "金額", "翻訳結果", "注釈", "サプライヤ情報"]
        );
        assert_eq!(table.rows[0].text(2), "訳0");
        assert_eq!(table.rows[2].text(4), "情報2");
        assert_eq!(table.rows[1].text(2), "エラー");
        assert_eq!(table.rows[1].text(3), "APIエラー: timeout");
        assert_eq!(table.rows[1].cell(4), &Cell::Empty);
        assert_eq!(table.rows[2].cell(1), &Cell::Number(2.0));
    }

    #[test]
    fn incomplete_results_fail_loudly() {
        let mut results = ResultTable::new(2);
        results.insert(0, outcome("0")).unwrap();
        let err = materialize(input(2), results).unwrap_err();
        assert!(err.to_string().contains("missing rows: 1"));

        assert!(materialize(input(2), ResultTable::new(3)).is_err());
    }

    #[test]
    fn empty_input_gets_headers_only() {
        let table = materialize(input(0), ResultTable::new(0)).unwrap();
        assert_eq!(table.headers.len(), 5);
        assert!(table.rows.is_empty());
    }

    #[test]
    fn date_columns_survive_the_written_workbook() {
        let table = Table {
            headers: vec!["計上日".to_string()],
            rows: vec![Row::new(vec![Cell::Date(45678.0)])],
        };
        let mut results = ResultTable::new(1);
        results.insert(0, outcome("0")).unwrap();

        let table = materialize(table, results).unwrap();
        let written = read_xlsx(&write_xlsx(&table).unwrap()).unwrap();
        assert_eq!(written.rows[0].cell(0), &Cell::Date(45678.0));
        assert_eq!(written.rows[0].text(0), "2025-01-21");
        assert_eq!(written.rows[0].text(1), "訳0");
    }

    #[test]
    fn filename_carries_minute_timestamp() {
        let name = output_filename("翻訳結果", datetime!(2025-03-07 09:05:59 UTC)).unwrap();
        assert_eq!(name, "翻訳結果_20250307_0905.xlsx");
    }
}
