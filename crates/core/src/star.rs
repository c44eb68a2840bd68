//! Minimal STAR document codec.
//!
//! Covers exactly the subset the downstream pipeliner reads and writes:
//! named data blocks holding either key-value pairs (`_key value` lines) or
//! a single `loop_` table. Block order and row order are preserved on
//! write, values containing whitespace are double-quoted, and output is
//! deterministic: the same document always serializes to the same bytes.

use std::collections::HashMap;

/// One data block: either a key-value list or a loop table.
#[derive(Debug, Clone, PartialEq)]
pub enum StarBlock {
    /// `_key value` pairs, order preserved.
    KeyValue(Vec<(String, String)>),
    /// `loop_` table with named columns.
    Loop {
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    },
}

impl StarBlock {
    /// Look up a key in a key-value block.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            StarBlock::KeyValue(pairs) => pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            StarBlock::Loop { .. } => None,
        }
    }

    /// Set or append a key in a key-value block. No-op on loop blocks.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        if let StarBlock::KeyValue(pairs) = self {
            let value = value.into();
            if let Some(pair) = pairs.iter_mut().find(|(k, _)| k == key) {
                pair.1 = value;
            } else {
                pairs.push((key.to_string(), value));
            }
        }
    }

    /// Index of a loop column by name.
    pub fn column(&self, name: &str) -> Option<usize> {
        match self {
            StarBlock::Loop { columns, .. } => columns.iter().position(|c| c == name),
            StarBlock::KeyValue(_) => None,
        }
    }

    /// Iterate a loop's rows as column-name → value maps.
    pub fn row_maps(&self) -> Vec<HashMap<&str, &str>> {
        match self {
            StarBlock::Loop { columns, rows } => rows
                .iter()
                .map(|row| {
                    columns
                        .iter()
                        .map(String::as_str)
                        .zip(row.iter().map(String::as_str))
                        .collect()
                })
                .collect(),
            StarBlock::KeyValue(_) => Vec::new(),
        }
    }
}

/// An ordered sequence of named blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StarDocument {
    pub blocks: Vec<(String, StarBlock)>,
}

impl StarDocument {
    pub fn new() -> StarDocument {
        StarDocument::default()
    }

    pub fn block(&self, name: &str) -> Option<&StarBlock> {
        self.blocks
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b)
    }

    pub fn block_mut(&mut self, name: &str) -> Option<&mut StarBlock> {
        self.blocks
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b)
    }

    pub fn push(&mut self, name: impl Into<String>, block: StarBlock) {
        self.blocks.push((name.into(), block));
    }

    /// Parse a STAR document.
    ///
    /// Tolerant of comments and blank lines; strict about table shape
    /// (every row must match the declared column count).
    pub fn parse(text: &str) -> Result<StarDocument, String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mode {
            None,
            KeyValue,
            LoopColumns,
            LoopRows,
        }

        let mut doc = StarDocument::new();
        let mut mode = Mode::None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix("data_") {
                doc.push(name.to_string(), StarBlock::KeyValue(Vec::new()));
                mode = Mode::KeyValue;
                continue;
            }

            if line == "loop_" {
                let Some((_, block)) = doc.blocks.last_mut() else {
                    return Err(format!("line {}: loop_ before any data block", lineno + 1));
                };
                *block = StarBlock::Loop {
                    columns: Vec::new(),
                    rows: Vec::new(),
                };
                mode = Mode::LoopColumns;
                continue;
            }

            match mode {
                Mode::None => {
                    return Err(format!("line {}: content before any data block", lineno + 1));
                }
                Mode::KeyValue => {
                    let Some(rest) = line.strip_prefix('_') else {
                        return Err(format!("line {}: expected _key value", lineno + 1));
                    };
                    let mut tokens = tokenize(rest)?;
                    if tokens.is_empty() {
                        return Err(format!("line {}: empty key", lineno + 1));
                    }
                    let key = tokens.remove(0);
                    let value = tokens.join(" ");
                    if let Some((_, StarBlock::KeyValue(pairs))) = doc.blocks.last_mut() {
                        pairs.push((key, value));
                    }
                }
                Mode::LoopColumns | Mode::LoopRows => {
                    let Some((_, StarBlock::Loop { columns, rows })) = doc.blocks.last_mut()
                    else {
                        unreachable!("loop mode without loop block");
                    };
                    if let Some(rest) = line.strip_prefix('_') {
                        if matches!(mode, Mode::LoopRows) {
                            return Err(format!(
                                "line {}: column declaration after table rows",
                                lineno + 1
                            ));
                        }
                        // Strip the optional "#N" column index annotation.
                        let name = rest.split_whitespace().next().unwrap_or("").to_string();
                        columns.push(name);
                    } else {
                        let row = tokenize(line)?;
                        if row.len() != columns.len() {
                            return Err(format!(
                                "line {}: row has {} values, expected {}",
                                lineno + 1,
                                row.len(),
                                columns.len()
                            ));
                        }
                        rows.push(row);
                        mode = Mode::LoopRows;
                    }
                }
            }
        }

        Ok(doc)
    }

    /// Serialize with the pipeliner's version header.
    pub fn to_star_string(&self) -> String {
        let mut out = String::from("# version 50001\n\n");
        for (name, block) in &self.blocks {
            out.push_str("data_");
            out.push_str(name);
            out.push_str("\n\n");
            match block {
                StarBlock::KeyValue(pairs) => {
                    let width = pairs.iter().map(|(k, _)| k.len()).max().unwrap_or(0) + 4;
                    for (key, value) in pairs {
                        out.push('_');
                        out.push_str(key);
                        for _ in key.len()..width {
                            out.push(' ');
                        }
                        out.push_str(&quote(value));
                        out.push('\n');
                    }
                }
                StarBlock::Loop { columns, rows } => {
                    out.push_str("loop_\n");
                    for (i, column) in columns.iter().enumerate() {
                        out.push('_');
                        out.push_str(column);
                        out.push_str(&format!(" #{}\n", i + 1));
                    }
                    for row in rows {
                        let cells: Vec<String> = row.iter().map(|v| quote(v)).collect();
                        out.push_str(&cells.join("    "));
                        out.push('\n');
                    }
                }
            }
            out.push('\n');
        }
        out
    }
}

/// Quote a value for STAR output: empty strings and strings containing
/// whitespace are wrapped in double quotes.
fn quote(value: &str) -> String {
    if value.is_empty() || value.contains(char::is_whitespace) {
        format!("\"{}\"", value)
    } else {
        value.to_string()
    }
}

/// Split a line into tokens, honoring double-quoted strings.
fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut token = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some(other) => token.push(other),
                    None => return Err("unterminated quoted string".to_string()),
                }
            }
            tokens.push(token);
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
            tokens.push(token);
        }
    }
    Ok(tokens)
}

/// Format a float the way the pipeliner's parser expects: plain decimal
/// notation, six fractional digits, no exponent.
pub fn format_float(value: f64) -> String {
    format!("{:.6}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE_SAMPLE: &str = r#"
# version 50001

data_pipeline_general

_rlnPipeLineJobCounter    4

data_pipeline_processes

loop_
_rlnPipeLineProcessName #1
_rlnPipeLineProcessAlias #2
_rlnPipeLineProcessTypeLabel #3
_rlnPipeLineProcessStatusLabel #4
Import/job001/    None    relion.importtomo    Succeeded
External/job002/    None    relion.external    Running
"#;

    #[test]
    fn test_parse_pipeline_star() {
        let doc = StarDocument::parse(PIPELINE_SAMPLE).unwrap();
        assert_eq!(doc.blocks.len(), 2);

        let general = doc.block("pipeline_general").unwrap();
        assert_eq!(general.get("rlnPipeLineJobCounter"), Some("4"));

        let processes = doc.block("pipeline_processes").unwrap();
        let rows = processes.row_maps();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["rlnPipeLineProcessName"], "Import/job001/");
        assert_eq!(rows[1]["rlnPipeLineProcessStatusLabel"], "Running");
    }

    #[test]
    fn test_quoted_values_roundtrip() {
        let mut doc = StarDocument::new();
        doc.push(
            "joboptions_values",
            StarBlock::Loop {
                columns: vec![
                    "rlnJobOptionVariable".to_string(),
                    "rlnJobOptionValue".to_string(),
                ],
                rows: vec![
                    vec!["fn_exe".to_string(), "relion_import --angpix 1.35".to_string()],
                    vec!["other_args".to_string(), String::new()],
                ],
            },
        );

        let text = doc.to_star_string();
        assert!(text.contains("\"relion_import --angpix 1.35\""));
        assert!(text.contains("\"\""));

        let back = StarDocument::parse(&text).unwrap();
        assert_eq!(doc, back);
    }

    #[test]
    fn test_write_is_deterministic() {
        let mut doc = StarDocument::new();
        let mut general = StarBlock::KeyValue(Vec::new());
        general.set("rlnSchemeName", "Schemes/scheme_demo/");
        general.set("rlnSchemeCurrentNodeName", "WAIT");
        doc.push("scheme_general", general);

        assert_eq!(doc.to_star_string(), doc.to_star_string());
        assert!(doc.to_star_string().starts_with("# version 50001\n"));
    }

    #[test]
    fn test_key_value_set_updates_in_place() {
        let mut block = StarBlock::KeyValue(vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        block.set("a", "9");
        assert_eq!(block.get("a"), Some("9"));
        match block {
            StarBlock::KeyValue(pairs) => assert_eq!(pairs.len(), 2),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_row_width_mismatch_is_error() {
        let bad = "data_x\n\nloop_\n_a #1\n_b #2\n1 2 3\n";
        assert!(StarDocument::parse(bad).is_err());
    }

    #[test]
    fn test_float_formatting_has_no_exponent() {
        assert_eq!(format_float(500.0), "500.000000");
        assert_eq!(format_float(0.5), "0.500000");
        assert_eq!(format_float(96.0), "96.000000");
    }
}
