//! Single-sheet xlsx tables. Reading goes through calamine, writing through
//! rust_xlsxwriter. Date and duration cells keep an Excel number format so
//! carried-through columns render the way they did in the input.

use anyhow::{anyhow, Context, Result};
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use rust_xlsxwriter::{Format, Workbook, Worksheet};
use std::io::Cursor;
use time::macros::{date, format_description};
use time::{Duration, PrimitiveDateTime, Time};

const DATE_FORMAT: &str = "yyyy-mm-dd";
const DATETIME_FORMAT: &str = "yyyy-mm-dd hh:mm:ss";
const DURATION_FORMAT: &str = "[h]:mm:ss";

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Cell {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    /// Excel serial day number shown as a date.
    Date(f64),
    /// Excel serial with a time-of-day part.
    DateTime(f64),
    /// Elapsed time in days.
    Duration(f64),
    Error(String),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    pub fn display(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(text) => text.clone(),
            Cell::Number(value) | Cell::Duration(value) => value.to_string(),
            Cell::Bool(value) => if *value { "TRUE" } else { "FALSE" }.to_string(),
            Cell::Date(serial) => serial_datetime(*serial)
                .and_then(|value| value.format(format_description!("[year]-[month]-[day]")).ok())
                .unwrap_or_else(|| serial.to_string()),
            Cell::DateTime(serial) => serial_datetime(*serial)
                .and_then(|value| {
                    value
                        .format(format_description!(
                            "[year]-[month]-[day] [hour]:[minute]:[second]"
                        ))
                        .ok()
                })
                .unwrap_or_else(|| serial.to_string()),
            Cell::Error(code) => code.clone(),
        }
    }
}

fn serial_datetime(serial: f64) -> Option<PrimitiveDateTime> {
    let millis = (serial * 86_400_000.0).round();
    if !millis.is_finite() {
        return None;
    }
    PrimitiveDateTime::new(date!(1899 - 12 - 30), Time::MIDNIGHT)
        .checked_add(Duration::milliseconds(millis as i64))
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    cells: Vec<Cell>,
}

impl Row {
    pub fn new(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, index: usize) -> &Cell {
        static EMPTY: Cell = Cell::Empty;
        self.cells.get(index).unwrap_or(&EMPTY)
    }

    pub fn text(&self, index: usize) -> String {
        self.cell(index).display().trim().to_string()
    }

    fn pad_to(&mut self, width: usize) {
        if self.cells.len() < width {
            self.cells.resize(width, Cell::Empty);
        }
    }
}

/// A header row plus data rows, all padded to the header width.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    /// Replaces the named column, or appends it when absent.
    pub fn set_column(&mut self, header: &str, values: Vec<Cell>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(anyhow!(
                "column '{}' has {} values but the table has {} rows",
                header,
                values.len(),
                self.rows.len()
            ));
        }
        let index = match self.column_index(header) {
            Some(index) => index,
            None => {
                self.headers.push(header.to_string());
                self.headers.len() - 1
            }
        };
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.pad_to(index + 1);
            row.cells[index] = value;
        }
        Ok(())
    }
}

/// Reads the first worksheet. Its first row is the header.
pub fn read_xlsx(bytes: &[u8]) -> Result<Table> {
    let mut workbook: Xlsx<_> =
        open_workbook_from_rs(Cursor::new(bytes)).with_context(|| "failed to read xlsx workbook")?;
    let Some(sheet) = workbook.sheet_names().first().cloned() else {
        return Ok(Table::default());
    };
    let range = workbook
        .worksheet_range(&sheet)
        .with_context(|| format!("failed to read worksheet '{}'", sheet))?;
    let grid = range
        .rows()
        .map(|row| row.iter().map(decode_cell).collect::<Vec<_>>());
    Ok(table_from_grid(grid))
}

fn decode_cell(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::String(text) => Cell::Text(text.clone()),
        Data::Float(value) => Cell::Number(*value),
        Data::Int(value) => Cell::Number(*value as f64),
        Data::Bool(value) => Cell::Bool(*value),
        Data::DateTime(value) if value.is_duration() => Cell::Duration(value.as_f64()),
        Data::DateTime(value) => {
            let serial = value.as_f64();
            if serial.fract() == 0.0 {
                Cell::Date(serial)
            } else {
                Cell::DateTime(serial)
            }
        }
        Data::DateTimeIso(text) | Data::DurationIso(text) => Cell::Text(text.clone()),
        Data::Error(err) => Cell::Error(err.to_string()),
    }
}

fn table_from_grid(mut rows: impl Iterator<Item = Vec<Cell>>) -> Table {
    let Some(header_cells) = rows.next() else {
        return Table::default();
    };
    let mut data = rows
        .map(Row::new)
        .filter(|row| row.cells().iter().any(|cell| !cell.is_empty()))
        .collect::<Vec<_>>();

    let width = data
        .iter()
        .map(|row| row.cells().len())
        .chain(std::iter::once(header_cells.len()))
        .max()
        .unwrap_or(0);
    let headers = (0..width)
        .map(|index| {
            let name = header_cells
                .get(index)
                .map(Cell::display)
                .unwrap_or_default();
            let name = name.trim();
            if name.is_empty() {
                format!("Unnamed: {}", index)
            } else {
                name.to_string()
            }
        })
        .collect::<Vec<_>>();
    for row in &mut data {
        row.pad_to(width);
    }
    Table {
        headers,
        rows: data,
    }
}

struct CellFormats {
    header: Format,
    date: Format,
    datetime: Format,
    duration: Format,
}

impl CellFormats {
    fn new() -> Self {
        Self {
            header: Format::new().set_bold(),
            date: Format::new().set_num_format(DATE_FORMAT),
            datetime: Format::new().set_num_format(DATETIME_FORMAT),
            duration: Format::new().set_num_format(DURATION_FORMAT),
        }
    }
}

pub fn write_xlsx(table: &Table) -> Result<Vec<u8>> {
    let formats = CellFormats::new();
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();

    for (index, header) in table.headers.iter().enumerate() {
        sheet
            .write_string_with_format(0, column_number(index)?, header.as_str(), &formats.header)
            .with_context(|| format!("failed to write header '{}'", header))?;
    }
    for (index, row) in table.rows.iter().enumerate() {
        let row_number = u32::try_from(index + 1)
            .map_err(|_| anyhow!("row {} is out of xlsx range", index + 1))?;
        for (column, cell) in row.cells().iter().enumerate() {
            write_cell(sheet, row_number, column_number(column)?, cell, &formats)
                .with_context(|| format!("failed to write cell at row {}", row_number + 1))?;
        }
    }

    workbook
        .save_to_buffer()
        .with_context(|| "failed to finalize xlsx output")
}

fn column_number(index: usize) -> Result<u16> {
    u16::try_from(index).map_err(|_| anyhow!("column {} is out of xlsx range", index))
}

fn write_cell(
    sheet: &mut Worksheet,
    row: u32,
    column: u16,
    cell: &Cell,
    formats: &CellFormats,
) -> Result<()> {
    match cell {
        Cell::Empty => return Ok(()),
        Cell::Text(text) | Cell::Error(text) => {
            sheet.write_string(row, column, text.as_str())?;
        }
        Cell::Number(value) => {
            sheet.write_number(row, column, *value)?;
        }
        Cell::Bool(value) => {
            sheet.write_boolean(row, column, *value)?;
        }
        Cell::Date(serial) => {
            sheet.write_number_with_format(row, column, *serial, &formats.date)?;
        }
        Cell::DateTime(serial) => {
            sheet.write_number_with_format(row, column, *serial, &formats.datetime)?;
        }
        Cell::Duration(days) => {
            sheet.write_number_with_format(row, column, *days, &formats.duration)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_dates() -> Vec<u8> {
        let mut workbook = Workbook::new();
        let date = Format::new().set_num_format("yyyy/mm/dd");
        let datetime = Format::new().set_num_format("yyyy-mm-dd hh:mm");
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "計上日").unwrap();
        sheet.write_string(0, 1, "登録日時").unwrap();
        sheet.write_string(0, 2, "摘要").unwrap();
        sheet
            .write_number_with_format(1, 0, 45678.0, &date)
            .unwrap();
        sheet
            .write_number_with_format(1, 1, 45678.5, &datetime)
            .unwrap();
        sheet.write_string(1, 2, "Q3 survey").unwrap();
        workbook.save_to_buffer().unwrap()
    }

    #[test]
    fn date_columns_keep_their_format() {
        let table = read_xlsx(&ledger_with_dates()).unwrap();
        assert_eq!(table.headers, vec!["計上日", "登録日時", "摘要"]);
        assert_eq!(table.rows[0].cell(0), &Cell::Date(45678.0));
        assert_eq!(table.rows[0].cell(1), &Cell::DateTime(45678.5));
        assert_eq!(table.rows[0].text(0), "2025-01-21");
        assert_eq!(table.rows[0].text(1), "2025-01-21 12:00:00");

        let again = read_xlsx(&write_xlsx(&table).unwrap()).unwrap();
        assert_eq!(again.rows[0].cell(0), &Cell::Date(45678.0));
        assert_eq!(again.rows[0].cell(1), &Cell::DateTime(45678.5));
        assert_eq!(again.rows[0].text(2), "Q3 survey");
    }

    #[test]
    fn blank_headers_are_named_and_blank_rows_dropped() {
        let table = Table {
            headers: vec!["国名".to_string(), String::new(), "金額".to_string()],
            rows: vec![
                Row::new(vec![Cell::text("日本"), Cell::Bool(true), Cell::Number(1200.5)]),
                Row::new(vec![Cell::Empty, Cell::Empty, Cell::Empty]),
                Row::new(vec![Cell::text("US")]),
            ],
        };
        let read = read_xlsx(&write_xlsx(&table).unwrap()).unwrap();
        assert_eq!(read.headers, vec!["国名", "Unnamed: 1", "金額"]);
        assert_eq!(read.rows.len(), 2);
        assert_eq!(
            read.rows[0].cells(),
            &[Cell::text("日本"), Cell::Bool(true), Cell::Number(1200.5)]
        );
        assert_eq!(read.rows[1].text(0), "US");
        assert_eq!(read.rows[1].cell(2), &Cell::Empty);
    }

    #[test]
    fn written_workbook_reads_back() {
        let mut table = Table {
            headers: vec!["国名".to_string(), "金額".to_string()],
            rows: vec![
                Row::new(vec![Cell::text("日本 <JP> & \"co\""), Cell::Number(42.0)]),
                Row::new(vec![Cell::text("  spaced  "), Cell::Empty]),
            ],
        };
        table
            .set_column("翻訳結果", vec![Cell::text("翻訳"), Cell::Bool(false)])
            .unwrap();

        let read = read_xlsx(&write_xlsx(&table).unwrap()).unwrap();
        assert_eq!(read.headers, vec!["国名", "金額", "翻訳結果"]);
        assert_eq!(read.rows[0].cell(0), &Cell::text("日本 <JP> & \"co\""));
        assert_eq!(read.rows[0].cell(1), &Cell::Number(42.0));
        assert_eq!(read.rows[0].text(1), "42");
        assert_eq!(read.rows[1].cell(0), &Cell::text("  spaced  "));
        assert_eq!(read.rows[1].cell(2), &Cell::Bool(false));
    }

    #[test]
    fn set_column_replaces_or_appends() {
        let mut table = Table {
            headers: vec!["a".to_string(), "b".to_string()],
            rows: vec![Row::new(vec![Cell::text("1")])],
        };
        assert!(table.set_column("c", Vec::new()).is_err());

        table.set_column("b", vec![Cell::text("2")]).unwrap();
        table.set_column("c", vec![Cell::text("3")]).unwrap();
        assert_eq!(table.headers, vec!["a", "b", "c"]);
        assert_eq!(
            table.rows[0].cells(),
            &[Cell::text("1"), Cell::text("2"), Cell::text("3")]
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(read_xlsx(b"not a zip").is_err());
    }
}
