use anyhow::{bail, Context};
use std::collections::HashMap;
use std::path::Path;

/// One data record. `row_number` is the 1-based position in the file
/// including the header line, so the first data row reports as row 2.
#[derive(Debug, Clone)]
pub struct CsvRow {
    pub row_number: usize,
    fields: HashMap<String, String>,
}

impl CsvRow {
    /// Trimmed field by lowercased column name; empty cells read as None.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .get(column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<CsvRow>,
}

/// Reads a CSV file into named rows. Headers are lowercased and trimmed.
/// Quoted fields may contain commas, doubled quotes and newlines. Fully
/// blank records are skipped but still advance the row numbering.
pub fn read_rows(path: &Path) -> anyhow::Result<CsvTable> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read csv file {}", path.display()))?;
    parse_table(&text)
}

fn parse_table(text: &str) -> anyhow::Result<CsvTable> {
    let mut records = parse_records(text)?;
    if records.is_empty() {
        bail!("csv file has no header line");
    }
    let header_record = records.remove(0);
    let headers: Vec<String> = header_record
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        bail!("csv header line is empty");
    }

    let mut rows = Vec::with_capacity(records.len());
    for (i, record) in records.into_iter().enumerate() {
        // Header is line 1; first data record is row 2.
        let row_number = i + 2;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let mut fields = HashMap::new();
        for (col, value) in headers.iter().zip(record.into_iter()) {
            if !col.is_empty() {
                fields.insert(col.clone(), value);
            }
        }
        rows.push(CsvRow { row_number, fields });
    }

    Ok(CsvTable { headers, rows })
}

/// Character-level parser so quoted fields can span lines. CRLF and LF both
/// terminate records.
fn parse_records(text: &str) -> anyhow::Result<Vec<Vec<String>>> {
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();
    let mut saw_any = false;

    while let Some(c) = chars.next() {
        saw_any = true;
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => {
                if field.trim().is_empty() {
                    field.clear();
                    in_quotes = true;
                } else {
                    // Stray quote mid-field; keep it literal.
                    field.push(c);
                }
            }
            ',' => {
                record.push(std::mem::take(&mut field));
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        bail!("unterminated quoted field");
    }
    if saw_any && (!field.is_empty() || !record.is_empty()) {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headers_and_numbers_rows_after_header() {
        let t = parse_table("Name,Email\nRiver,river@example.com\nKai,kai@example.com\n")
            .expect("parse");
        assert_eq!(t.headers, vec!["name", "email"]);
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.rows[0].row_number, 2);
        assert_eq!(t.rows[1].row_number, 3);
        assert_eq!(t.rows[1].get("email"), Some("kai@example.com"));
    }

    #[test]
    fn quoted_fields_keep_commas_and_newlines() {
        let t = parse_table("name,notes\nRiver,\"prefers evenings, weekends\"\nKai,\"line one\nline two\"\n")
            .expect("parse");
        assert_eq!(
            t.rows[0].get("notes"),
            Some("prefers evenings, weekends")
        );
        assert_eq!(t.rows[1].get("notes"), Some("line one\nline two"));
    }

    #[test]
    fn doubled_quotes_unescape() {
        let t = parse_table("name,notes\nRiver,\"said \"\"soon\"\"\"\n").expect("parse");
        assert_eq!(t.rows[0].get("notes"), Some("said \"soon\""));
    }

    #[test]
    fn blank_records_are_skipped_but_counted() {
        let t = parse_table("name,email\n,\nRiver,river@example.com\n").expect("parse");
        assert_eq!(t.rows.len(), 1);
        assert_eq!(t.rows[0].row_number, 3);
    }

    #[test]
    fn empty_cells_read_as_none() {
        let t = parse_table("name,email,notes\nRiver,river@example.com,\n").expect("parse");
        assert_eq!(t.rows[0].get("notes"), None);
        assert_eq!(t.rows[0].get("missing_column"), None);
    }

    #[test]
    fn crlf_and_missing_final_newline_both_work() {
        let t = parse_table("name,email\r\nRiver,river@example.com").expect("parse");
        assert_eq!(t.rows.len(), 1);
        assert_eq!(t.rows[0].get("name"), Some("River"));
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(parse_table("name\n\"oops\n").is_err());
    }

    #[test]
    fn header_only_file_has_no_rows() {
        let t = parse_table("name,email\n").expect("parse");
        assert!(t.rows.is_empty());
    }
}
