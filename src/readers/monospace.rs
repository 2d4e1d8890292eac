use std::collections::HashMap;
use std::io::{self, BufRead, BufReader};
use std::sync::Arc;
use tracing::{debug, warn};

use super::date_parser::parse_compact;
use super::loader::Loader;
use crate::producers::spreadsheet::{
    is_stopped, Confirm, Field, Reader, Row, RowSender, StopSignal, COLUMN_PARSE_ERROR,
    ROW_READ_ERROR,
};

/// A column found in the header, `width` runes wide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Column {
    field: Field,
    width: usize,
}

/// Columns of a `.mon` file keyed by the rune offset they start at.
type Layout = HashMap<usize, Column>;

/// Reads formatted monospace-aligned `.mon` spreadsheets.
///
/// Column boundaries come from the header line: every known title is
/// looked up verbatim (case-sensitive) and owns the runes it covers plus
/// the whitespace that follows it. A title that also occurs inside an
/// earlier token of the header is located at that earlier spot.
pub struct MonospaceReader {
    loader: Arc<dyn Loader>,
}

impl MonospaceReader {
    pub fn new(loader: Arc<dyn Loader>) -> Self {
        MonospaceReader { loader }
    }
}

impl Reader for MonospaceReader {
    fn read(&self, name: &str, confirm: Confirm, rows: RowSender, stop: StopSignal) {
        let source = match self.loader.load(&format!("{}.mon", name)) {
            Ok(source) => source,
            Err(err) => {
                let _ = confirm.send(Err(err));
                return;
            }
        };
        let _ = confirm.send(Ok(()));

        let mut r = BufReader::new(source);
        let layout = match read_layout(&mut r) {
            Ok(Some(layout)) => layout,
            Ok(None) => {
                debug!(reader = "mon", file = name, "empty source");
                return;
            }
            Err(err) => {
                // without a layout no row can be interpreted
                warn!(reader = "mon", file = name, error = %err, "unable to parse columns");
                let _ = rows.blocking_send(Row::error(COLUMN_PARSE_ERROR));
                return;
            }
        };
        debug!(reader = "mon", file = name, columns = layout.len(), "layout read");

        let mut buf = Vec::new();
        loop {
            if is_stopped(&stop) {
                debug!(reader = "mon", file = name, "stopped");
                return;
            }
            buf.clear();
            match r.read_until(b'\n', &mut buf) {
                Ok(0) => return,
                Ok(_) => {
                    // undecodable bytes become U+FFFD, the row itself survives
                    let line = String::from_utf8_lossy(&buf);
                    if line.trim().is_empty() {
                        continue;
                    }
                    if rows.blocking_send(split_row(&line, &layout)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(reader = "mon", file = name, error = %err, "invalid row");
                    let _ = rows.blocking_send(Row::error(ROW_READ_ERROR));
                    return;
                }
            }
        }
    }
}

/// Reads the header line. `None` means the source is empty.
fn read_layout<R: BufRead>(r: &mut R) -> io::Result<Option<Layout>> {
    let mut header = Vec::new();
    if r.read_until(b'\n', &mut header)? == 0 {
        return Ok(None);
    }
    Ok(Some(parse_layout(&String::from_utf8_lossy(&header))))
}

fn parse_layout(header: &str) -> Layout {
    let mut layout = Layout::new();
    for field in Field::ALL {
        let label = field.label();
        let Some(idx) = header.find(label) else {
            continue;
        };
        // offsets are counted in runes: the layout is visual, not byte-based
        let start = header[..idx].chars().count();
        let padding = header[idx + label.len()..]
            .chars()
            .take_while(|c| c.is_whitespace() && *c != '\n')
            .count();
        layout.insert(
            start,
            Column {
                field,
                width: label.chars().count() + padding,
            },
        );
    }
    layout
}

fn split_row(line: &str, layout: &Layout) -> Row {
    let mut row = Row::default();
    // (byte offset where the column starts, rune it ends on, field)
    let mut open: Option<(usize, usize, Field)> = None;

    for (rune, (idx, ch)) in line.char_indices().enumerate() {
        if open.is_none() {
            if let Some(col) = layout.get(&rune) {
                open = Some((idx, rune + col.width - 1, col.field));
            }
        }
        if let Some((start, last, field)) = open {
            if rune == last {
                assign(&mut row, field, &line[start..idx + ch.len_utf8()]);
                open = None;
            }
        }
    }
    // a short line closes its last column early
    if let Some((start, _, field)) = open {
        assign(&mut row, field, &line[start..]);
    }
    row
}

fn assign(row: &mut Row, field: Field, raw: &str) {
    let value = raw.trim();
    let value = match field {
        Field::Birthday => parse_compact(value).unwrap_or_else(|| value.to_string()),
        _ => value.to_string(),
    };
    row.set(field, value);
}
