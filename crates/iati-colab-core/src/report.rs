//! Tabular output: the streaming classification log and the tables derived
//! from a remote validation report.

use std::io::Write;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classify::{ClassificationRow, ClassificationSink, LOG_COLUMNS};
use crate::ColabError;

/// Quote a CSV field when it carries a separator, quote, or line break.
#[must_use]
pub fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn write_error(err: &std::io::Error) -> ColabError {
    ColabError::Io(format!("write error: {err}"))
}

/// Classification sink that writes each row as CSV as soon as it arrives, so
/// rows already written survive a later failure.
#[derive(Debug)]
pub struct CsvLogWriter<W: Write> {
    out: W,
    rows: usize,
}

impl<W: Write> CsvLogWriter<W> {
    /// Write the header line and return the sink.
    ///
    /// # Errors
    /// Returns [`ColabError::Io`] when the header cannot be written.
    pub fn new(mut out: W) -> Result<Self, ColabError> {
        writeln!(out, "{}", LOG_COLUMNS.join(",")).map_err(|err| write_error(&err))?;
        Ok(Self { out, rows: 0 })
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ClassificationSink for CsvLogWriter<W> {
    fn push(&mut self, row: &ClassificationRow) -> Result<(), ColabError> {
        writeln!(
            self.out,
            "{},{},{},{},{},{}",
            csv_escape(row.identifier.as_deref().unwrap_or("")),
            row.status_check,
            row.planned_end_date_check,
            row.actual_end_date_check,
            row.transaction_date_check,
            row.pwyf_current,
        )
        .map_err(|err| write_error(&err))?;
        self.out.flush().map_err(|err| write_error(&err))?;
        self.rows += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Flatten JSON entries into rows. Columns are the union of object keys in
    /// first-seen order; anything that is not an object lands in `value`.
    #[must_use]
    pub fn from_entries(name: &str, entries: &[Value]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for entry in entries {
            match entry {
                Value::Object(map) => {
                    for key in map.keys() {
                        if !columns.iter().any(|column| column == key) {
                            columns.push(key.clone());
                        }
                    }
                }
                _ => {
                    if !columns.iter().any(|column| column == "value") {
                        columns.push("value".to_string());
                    }
                }
            }
        }

        let rows = entries
            .iter()
            .map(|entry| {
                columns
                    .iter()
                    .map(|column| match entry {
                        Value::Object(map) => map.get(column).map(cell).unwrap_or_default(),
                        other if column == "value" => cell(other),
                        _ => String::new(),
                    })
                    .collect()
            })
            .collect();

        Self { name: name.to_string(), columns, rows }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// # Errors
    /// Returns [`ColabError::Io`] on write failure.
    pub fn write_csv<W: Write>(&self, mut out: W) -> Result<(), ColabError> {
        let header: Vec<String> = self.columns.iter().map(|column| csv_escape(column)).collect();
        writeln!(out, "{}", header.join(",")).map_err(|err| write_error(&err))?;
        for row in &self.rows {
            let fields: Vec<String> = row.iter().map(|field| csv_escape(field)).collect();
            writeln!(out, "{}", fields.join(",")).map_err(|err| write_error(&err))?;
        }
        out.flush().map_err(|err| write_error(&err))
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// The four result arrays returned by the remote validator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    #[serde(default)]
    pub validation_errors: Vec<Value>,
    #[serde(default)]
    pub ruleset_errors: Vec<Value>,
    #[serde(default)]
    pub invalid_embedded_codelist_values: Vec<Value>,
    #[serde(default)]
    pub invalid_non_embedded_codelist_values: Vec<Value>,
}

impl ValidationReport {
    /// # Errors
    /// Returns [`ColabError::Validation`] when `value` is not an object or one
    /// of the four keys is not an array.
    pub fn from_json(value: &Value) -> Result<Self, ColabError> {
        if !value.is_object() {
            return Err(ColabError::Validation(
                "validation response is not a JSON object".to_string(),
            ));
        }
        serde_json::from_value(value.clone())
            .map_err(|err| ColabError::Validation(format!("unexpected validation response: {err}")))
    }

    /// Tables in persistence order: schema, ruleset, embedded codelist,
    /// non-embedded codelist.
    #[must_use]
    pub fn tables(&self) -> [Table; 4] {
        [
            Table::from_entries("schema_table", &self.validation_errors),
            Table::from_entries("ruleset_table", &self.ruleset_errors),
            Table::from_entries("embedded_codelist_table", &self.invalid_embedded_codelist_values),
            Table::from_entries(
                "non_embedded_codelist_table",
                &self.invalid_non_embedded_codelist_values,
            ),
        ]
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.validation_errors.len()
            + self.ruleset_errors.len()
            + self.invalid_embedded_codelist_values.len()
            + self.invalid_non_embedded_codelist_values.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::classify::CurrencyChecks;

    fn as_text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap_or_else(|err| panic!("not utf-8: {err}"))
    }

    #[test]
    fn csv_escape_quotes_only_when_needed() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("line\r\nbreak"), "\"line\r\nbreak\"");
    }

    #[test]
    fn log_writer_streams_rows_after_header() {
        let mut writer = CsvLogWriter::new(Vec::new()).unwrap_or_else(|err| panic!("{err}"));
        let current = CurrencyChecks { status: true, ..CurrencyChecks::default() };
        writer
            .push(&ClassificationRow::new(Some("XM-1,a".to_string()), current))
            .unwrap_or_else(|err| panic!("{err}"));
        writer
            .push(&ClassificationRow::new(None, CurrencyChecks::default()))
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(writer.rows(), 2);

        let text = as_text(writer.into_inner());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "identifier,status_check,planned_end_date_check,actual_end_date_check,transaction_date_check,pwyf_current",
                "\"XM-1,a\",true,false,false,false,true",
                ",false,false,false,false,false",
            ]
        );
    }

    #[test]
    fn table_columns_are_union_in_first_seen_order() {
        let entries = vec![
            json!({"message": "missing title", "path": "/iati-activity[1]"}),
            json!({"path": "/iati-activity[2]", "count": 3, "context": {"line": 7}}),
            json!("free text"),
        ];
        let table = Table::from_entries("schema_table", &entries);

        assert_eq!(table.columns, vec!["message", "path", "count", "context", "value"]);
        assert_eq!(table.rows[0], vec!["missing title", "/iati-activity[1]", "", "", ""]);
        assert_eq!(table.rows[1], vec!["", "/iati-activity[2]", "3", "{\"line\":7}", ""]);
        assert_eq!(table.rows[2], vec!["", "", "", "", "free text"]);

        let mut out = Vec::new();
        table.write_csv(&mut out).unwrap_or_else(|err| panic!("{err}"));
        let text = as_text(out);
        assert!(text.starts_with("message,path,count,context,value\n"));
        assert!(text.contains(",/iati-activity[2],3,\"{\"\"line\"\":7}\",\n"));
    }

    #[test]
    fn report_defaults_missing_keys() {
        let report = ValidationReport::from_json(&json!({
            "validation_errors": [{"message": "bad"}],
            "ruleset_errors": [],
            "extra": true
        }))
        .unwrap_or_else(|err| panic!("{err}"));

        assert_eq!(report.total(), 1);
        let names: Vec<String> = report.tables().iter().map(|table| table.name.clone()).collect();
        assert_eq!(
            names,
            vec![
                "schema_table",
                "ruleset_table",
                "embedded_codelist_table",
                "non_embedded_codelist_table"
            ]
        );
        assert!(report.tables()[3].is_empty());
    }

    #[test]
    fn report_rejects_non_objects() {
        assert!(matches!(ValidationReport::from_json(&json!([1, 2])), Err(ColabError::Validation(_))));
        assert!(matches!(
            ValidationReport::from_json(&json!({"ruleset_errors": "nope"})),
            Err(ColabError::Validation(_))
        ));
    }
}
