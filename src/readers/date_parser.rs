use chrono::NaiveDate;

/// Strict parse of `"DD/MM/YYYY"` → `"YYYY-MM-DD"`
pub fn parse_day_month_year(s: &str) -> Option<String> {
    let b = s.as_bytes();
    // fixed shape check before slicing
    if b.len() != 10 || b[2] != b'/' || b[5] != b'/' {
        return None;
    }
    if !b
        .iter()
        .enumerate()
        .all(|(i, c)| i == 2 || i == 5 || c.is_ascii_digit())
    {
        return None;
    }
    let day: u32 = s[0..2].parse().ok()?;
    let month: u32 = s[3..5].parse().ok()?;
    let year: i32 = s[6..10].parse().ok()?;
    iso_date(year, month, day)
}

/// Strict parse of `"YYYYMMDD"` → `"YYYY-MM-DD"`
pub fn parse_compact(s: &str) -> Option<String> {
    if s.len() != 8 || !s.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = s[0..4].parse().ok()?;
    let month: u32 = s[4..6].parse().ok()?;
    let day: u32 = s[6..8].parse().ok()?;
    iso_date(year, month, day)
}

fn iso_date(year: i32, month: u32, day: u32) -> Option<String> {
    NaiveDate::from_ymd_opt(year, month, day).map(|d| d.format("%Y-%m-%d").to_string())
}
