//! Plain-text rendering for covenctl output.

use serde_json::Value;

/// Render a list of JSON objects as an aligned table.
pub fn table(rows: &[Value], columns: &[(&str, &str)]) -> String {
    let mut widths: Vec<usize> = columns.iter().map(|(_, header)| header.len()).collect();
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(i, (key, _))| {
                    let text = cell_text(row, key);
                    widths[i] = widths[i].max(text.len());
                    text
                })
                .collect()
        })
        .collect();

    let mut out = String::new();
    for (i, (_, header)) in columns.iter().enumerate() {
        out.push_str(&format!("{:<width$}  ", header.to_uppercase(), width = widths[i]));
    }
    out.push('\n');
    for row in cells {
        for (i, text) in row.iter().enumerate() {
            out.push_str(&format!("{:<width$}  ", text, width = widths[i]));
        }
        out.push('\n');
    }
    out
}

/// Dotted-path lookup into a JSON object, rendered as display text.
fn cell_text(row: &Value, key: &str) -> String {
    let mut current = row;
    for part in key.split('.') {
        match current.get(part) {
            Some(value) => current = value,
            None => return "-".to_string(),
        }
    }
    match current {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map_or_else(|| v.to_string(), ToString::to_string))
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

/// Pretty-print a JSON value.
pub fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_aligns_columns() {
        let rows = vec![
            serde_json::json!({"id": "t-1", "status": "open"}),
            serde_json::json!({"id": "t-200", "status": "in_progress"}),
        ];
        let out = table(&rows, &[("id", "id"), ("status", "status")]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID"));
        assert!(lines[1].starts_with("t-1  "));
        assert!(lines[2].contains("in_progress"));
    }

    #[test]
    fn cell_text_follows_dotted_paths() {
        let row = serde_json::json!({"workflow": {"status": "running"}, "labels": ["a", "b"]});
        assert_eq!(cell_text(&row, "workflow.status"), "running");
        assert_eq!(cell_text(&row, "labels"), "a,b");
        assert_eq!(cell_text(&row, "missing.path"), "-");
    }
}
