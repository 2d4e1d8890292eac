use std::fmt;
use std::io::{self, Write};

use super::{Field, Row, RowStream};

/// Turns a stream of rows into a document.
///
/// Implementations either consume `rows` to the end or drop it early; the
/// stream takes care of stopping the reader in the latter case.
pub trait Render: Send + Sync + 'static {
    fn render(&self, out: &mut dyn Write, title: &str, rows: RowStream) -> io::Result<()>;
}

/// Renders rows as a monospace HTML table.
#[derive(Clone, Copy, Debug, Default)]
pub struct HtmlTable;

const HEAD: &str = r#"<!DOCTYPE html>
<html>
	<head>
		<meta charset="UTF-8">
		<title>"#;

const TABLE_START: &str = r#"</title>
	</head>
	<body>
		<table style="font-family:Courier New, Courier, monospace; white-space:pre">
			<tr style="font-weight: Bold"><td>Name</td><td>Address</td><td>Postcode</td><td>Phone</td><td>Credit Limit</td><td>Birthday</td></tr>
"#;

const TAIL: &str = r#"		</table>
	</body>
</html>"#;

impl Render for HtmlTable {
    fn render(&self, out: &mut dyn Write, title: &str, rows: RowStream) -> io::Result<()> {
        write!(out, "{}{}{}", HEAD, Escaped(title), TABLE_START)?;
        for row in rows {
            write_row(out, &row)?;
        }
        out.write_all(TAIL.as_bytes())
    }
}

fn write_row(out: &mut dyn Write, row: &Row) -> io::Result<()> {
    if let Some(message) = &row.error_message {
        return writeln!(
            out,
            "\t\t\t<tr><td colspan=\"6\">{}</td></tr>",
            Escaped(message)
        );
    }

    out.write_all(b"\t\t\t<tr>")?;
    for field in Field::ALL {
        let value = Escaped(row.get(field));
        match field {
            Field::CreditLimit | Field::Birthday => write!(out, "<td align=\"right\">{}</td>", value)?,
            _ => write!(out, "<td>{}</td>", value)?,
        }
    }
    out.write_all(b"</tr>\n")
}

/// HTML-escapes text content while formatting.
struct Escaped<'a>(&'a str);

impl fmt::Display for Escaped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest = self.0;
        while let Some(idx) = rest.find(['<', '>', '&', '"', '\'']) {
            f.write_str(&rest[..idx])?;
            let entity = match rest.as_bytes()[idx] {
                b'<' => "&lt;",
                b'>' => "&gt;",
                b'&' => "&amp;",
                b'"' => "&#34;",
                _ => "&#39;",
            };
            f.write_str(entity)?;
            rest = &rest[idx + 1..];
        }
        f.write_str(rest)
    }
}
