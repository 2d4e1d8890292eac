// src/producers/spreadsheet/mod.rs
use std::io;
use tokio::sync::{mpsc, oneshot, watch};

pub mod html;
pub mod producer;

pub use html::{HtmlTable, Render};
pub use producer::Spreadsheet;

/// Sentinel message for a header that could not be turned into a layout.
pub const COLUMN_PARSE_ERROR: &str = "Unable to parse columns";
/// Sentinel message for a row that could not be read.
pub const ROW_READ_ERROR: &str = "Invalid row";

/// One-shot answer to "could the named source be opened?".
pub type Confirm = oneshot::Sender<io::Result<()>>;
/// Ordered row channel from a reader to the renderer.
pub type RowSender = mpsc::Sender<Row>;
/// Cooperative cancellation raised by the producer once rendering is over.
pub type StopSignal = watch::Receiver<bool>;

/// The six columns every spreadsheet source may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    Address,
    Postcode,
    Phone,
    CreditLimit,
    Birthday,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::Name,
        Field::Address,
        Field::Postcode,
        Field::Phone,
        Field::CreditLimit,
        Field::Birthday,
    ];

    /// Column title as written in source headers.
    pub fn label(&self) -> &'static str {
        match self {
            Field::Name => "Name",
            Field::Address => "Address",
            Field::Postcode => "Postcode",
            Field::Phone => "Phone",
            Field::CreditLimit => "Credit Limit",
            Field::Birthday => "Birthday",
        }
    }

    /// Case-insensitive lookup of a header title.
    pub fn from_label(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "name" => Some(Field::Name),
            "address" => Some(Field::Address),
            "postcode" => Some(Field::Postcode),
            "phone" => Some(Field::Phone),
            "credit limit" => Some(Field::CreditLimit),
            "birthday" => Some(Field::Birthday),
            _ => None,
        }
    }
}

/// A row in a spreadsheet. Readers set `error_message` when a row
/// could not be read; the data fields of such a row carry no meaning.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    pub name: String,
    pub address: String,
    pub postcode: String,
    pub phone: String,
    pub credit_limit: String,
    pub birthday: String,
    pub error_message: Option<String>,
}

impl Row {
    /// A placeholder row that only reports `message`.
    pub fn error(message: impl Into<String>) -> Self {
        Row {
            error_message: Some(message.into()),
            ..Row::default()
        }
    }

    pub fn get(&self, field: Field) -> &str {
        match field {
            Field::Name => &self.name,
            Field::Address => &self.address,
            Field::Postcode => &self.postcode,
            Field::Phone => &self.phone,
            Field::CreditLimit => &self.credit_limit,
            Field::Birthday => &self.birthday,
        }
    }

    pub fn set(&mut self, field: Field, value: String) {
        let slot = match field {
            Field::Name => &mut self.name,
            Field::Address => &mut self.address,
            Field::Postcode => &mut self.postcode,
            Field::Phone => &mut self.phone,
            Field::CreditLimit => &mut self.credit_limit,
            Field::Birthday => &mut self.birthday,
        };
        *slot = value;
    }
}

/// Data source for a spreadsheet [`Spreadsheet`] producer.
///
/// The producer runs `read` on a blocking worker, so every callback goes
/// through channels:
/// - exactly one value is sent on `confirm` before anything else, telling
///   whether `name` could be opened; after an error nothing else is sent.
/// - rows are then sent one by one on `rows`, in source order.
/// - `stop` is checked between rows; once raised the reader returns
///   without sending more.
///
/// Readers own the byte stream they open and must release it before
/// returning.
pub trait Reader: Send + Sync + 'static {
    fn read(&self, name: &str, confirm: Confirm, rows: RowSender, stop: StopSignal);
}

/// True once the producer no longer wants rows.
pub fn is_stopped(stop: &StopSignal) -> bool {
    *stop.borrow()
}

/// Rows handed to a renderer.
///
/// Dropping the stream (after rendering completes, fails or panics) raises
/// the stop signal and drains rows still in flight until the reader closes
/// its end, so a reader blocked on a send is never left hanging.
pub struct RowStream {
    rows: mpsc::Receiver<Row>,
    stop: watch::Sender<bool>,
}

impl RowStream {
    pub fn new(rows: mpsc::Receiver<Row>, stop: watch::Sender<bool>) -> Self {
        RowStream { rows, stop }
    }
}

impl Iterator for RowStream {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.blocking_recv()
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        // let the reader finish gracefully
        while self.rows.blocking_recv().is_some() {}
    }
}
