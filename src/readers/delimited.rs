use anyhow::{bail, Result};
use csv::{ReaderBuilder, StringRecord};
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;
use tracing::{debug, warn};

use super::date_parser::parse_day_month_year;
use super::loader::Loader;
use crate::producers::spreadsheet::{
    is_stopped, Confirm, Field, Reader, Row, RowSender, StopSignal, COLUMN_PARSE_ERROR,
    ROW_READ_ERROR,
};

/// Column indices of a `.csv` file, keyed by field.
type Layout = HashMap<Field, usize>;

/// Reads comma-separated `.csv` spreadsheets.
pub struct DelimitedReader {
    loader: Arc<dyn Loader>,
}

impl DelimitedReader {
    pub fn new(loader: Arc<dyn Loader>) -> Self {
        DelimitedReader { loader }
    }
}

impl Reader for DelimitedReader {
    fn read(&self, name: &str, confirm: Confirm, rows: RowSender, stop: StopSignal) {
        let source = match self.loader.load(&format!("{}.csv", name)) {
            Ok(source) => source,
            Err(err) => {
                let _ = confirm.send(Err(err));
                return;
            }
        };
        let _ = confirm.send(Ok(()));

        let mut rdr = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true) // rows may carry fewer or more fields than the header
            .from_reader(RawTap::new(source));

        let layout = match read_layout(&mut rdr) {
            Ok(Some(layout)) => layout,
            Ok(None) => {
                debug!(reader = "csv", file = name, "empty source");
                return;
            }
            Err(err) => {
                // without a layout no row can be interpreted
                warn!(reader = "csv", file = name, error = %err, "unable to parse columns");
                let _ = rows.blocking_send(Row::error(COLUMN_PARSE_ERROR));
                return;
            }
        };

        let mut record = StringRecord::new();
        loop {
            if is_stopped(&stop) {
                debug!(reader = "csv", file = name, "stopped");
                return;
            }
            match read_row(&mut rdr, &layout, &mut record) {
                Ok(Some(row)) => {
                    if rows.blocking_send(row).is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(reader = "csv", file = name, error = %err, "invalid row");
                    let _ = rows.blocking_send(Row::error(ROW_READ_ERROR));
                    return;
                }
            }
        }
    }
}

/// Reads the header record. `None` means the source holds no records.
fn read_layout<R: Read>(rdr: &mut csv::Reader<RawTap<R>>) -> Result<Option<Layout>> {
    let mut header = StringRecord::new();
    if !rdr.read_record(&mut header)? {
        return Ok(None);
    }
    check_record_quotes(rdr, &header)?;

    let mut layout = Layout::new();
    for (i, column) in header.iter().enumerate() {
        // later duplicates win
        if let Some(field) = Field::from_label(column) {
            layout.insert(field, i);
        }
    }
    Ok(Some(layout))
}

fn read_row<R: Read>(
    rdr: &mut csv::Reader<RawTap<R>>,
    layout: &Layout,
    record: &mut StringRecord,
) -> Result<Option<Row>> {
    if !rdr.read_record(record)? {
        return Ok(None);
    }
    check_record_quotes(rdr, record)?;

    let mut row = Row::default();
    for (&field, &i) in layout {
        let Some(value) = record.get(i) else {
            continue;
        };
        let value = match field {
            Field::Birthday => parse_day_month_year(value).unwrap_or_else(|| value.to_string()),
            _ => value.to_string(),
        };
        row.set(field, value);
    }
    Ok(Some(row))
}

/// Re-checks the raw bytes of the record just read. The csv parser takes
/// stray quotes literally and closes an open quote at end of input; both
/// make the record invalid here.
fn check_record_quotes<R: Read>(
    rdr: &mut csv::Reader<RawTap<R>>,
    record: &StringRecord,
) -> Result<()> {
    let (start, line) = record
        .position()
        .map_or((0, 0), |p| (p.byte(), p.line()));
    let end = rdr.position().byte();

    let checked = quote_fault(rdr.get_ref().span(start, end));
    rdr.get_mut().release(end);
    if let Some(fault) = checked {
        bail!("{} in record on line {}", fault, line);
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quoting {
    FieldStart,
    Bare,
    Quoted,
    QuoteInQuoted,
}

/// Scans one raw record and names the first quoting fault, if any.
fn quote_fault(raw: &[u8]) -> Option<&'static str> {
    use Quoting::*;

    let mut state = FieldStart;
    for &b in raw {
        state = match (state, b) {
            (FieldStart, b'"') => Quoted,
            (FieldStart | Bare, b',' | b'\r' | b'\n') => FieldStart,
            (FieldStart | Bare, b'"') => return Some("bare \" in non-quoted field"),
            (FieldStart | Bare, _) => Bare,
            (Quoted, b'"') => QuoteInQuoted,
            (Quoted, _) => Quoted,
            (QuoteInQuoted, b'"') => Quoted,
            (QuoteInQuoted, b',' | b'\r' | b'\n') => FieldStart,
            (QuoteInQuoted, _) => return Some("extraneous \" in quoted field"),
        };
    }
    (state == Quoted).then_some("unterminated quoted field")
}

/// Keeps the raw bytes handed to the csv parser until the records they
/// belong to have been checked.
struct RawTap<R> {
    inner: R,
    raw: Vec<u8>,
    // stream offset of raw[0]
    base: u64,
}

impl<R> RawTap<R> {
    fn new(inner: R) -> Self {
        RawTap {
            inner,
            raw: Vec::new(),
            base: 0,
        }
    }

    fn span(&self, start: u64, end: u64) -> &[u8] {
        let from = (start.saturating_sub(self.base) as usize).min(self.raw.len());
        let to = (end.saturating_sub(self.base) as usize).clamp(from, self.raw.len());
        &self.raw[from..to]
    }

    /// Forgets everything before stream offset `end`.
    fn release(&mut self, end: u64) {
        let n = (end.saturating_sub(self.base) as usize).min(self.raw.len());
        self.raw.drain(..n);
        self.base += n as u64;
    }
}

impl<R: Read> Read for RawTap<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.raw.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}
