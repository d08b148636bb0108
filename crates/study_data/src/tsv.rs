//! Cell sanitization and tab-separated line encoding for the ledger file.

use itertools::Itertools;
use serde_json::Value;
use unicode_general_category::{get_general_category, GeneralCategory};

pub const DELIMITER: char = '\t';
const QUOTE: char = '"';

/// Renders a stored value as ledger text: nulls are empty, lists are the
/// non-empty sanitized items joined by `"; "`, floats have at most six decimals.
pub fn stringify(value: &Value) -> String {
  match value {
    Value::Null => String::new(),
    Value::Array(items) => items
      .iter()
      .map(sanitize)
      .filter(|part| !part.is_empty())
      .join("; "),
    Value::Number(n) if n.is_f64() => n.as_f64().map(format_float).unwrap_or_default(),
    Value::Number(n) => n.to_string(),
    Value::String(s) => s.clone(),
    Value::Bool(true) => "True".to_string(),
    Value::Bool(false) => "False".to_string(),
    Value::Object(_) => value.to_string(),
  }
}

pub fn format_float(value: f64) -> String {
  if !value.is_finite() {
    return String::new();
  }
  let formatted = format!("{value:.6}");
  let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
  if trimmed.is_empty() {
    "0".to_string()
  } else {
    trimmed.to_string()
  }
}

pub fn sanitize(value: &Value) -> String {
  sanitize_str(&stringify(value))
}

/// Makes text safe for a single TSV cell. Idempotent.
pub fn sanitize_str(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  for c in text.chars() {
    match c {
      '\t' => out.push_str("    "),
      '\r' | '\n' => out.push(' '),
      c if is_printable(c) => out.push(c),
      _ => out.push(' '),
    }
  }
  out.trim().to_string()
}

/// Printable means every general category except the separators (other than
/// the ASCII space) and the "other" group: control, format, surrogate,
/// private-use and unassigned code points.
fn is_printable(c: char) -> bool {
  if c == ' ' {
    return true;
  }
  !matches!(
    get_general_category(c),
    GeneralCategory::Control
      | GeneralCategory::Format
      | GeneralCategory::Surrogate
      | GeneralCategory::PrivateUse
      | GeneralCategory::Unassigned
      | GeneralCategory::LineSeparator
      | GeneralCategory::ParagraphSeparator
      | GeneralCategory::SpaceSeparator
  )
}

/// Joins cells into one line (without terminator). Cells containing a quote,
/// delimiter or line break are quoted with inner quotes doubled.
pub fn encode_line<S: AsRef<str>>(cells: &[S]) -> String {
  cells
    .iter()
    .map(|cell| {
      let cell = cell.as_ref();
      if cell.contains([QUOTE, DELIMITER, '\n', '\r']) {
        format!("{QUOTE}{}{QUOTE}", cell.replace(QUOTE, "\"\""))
      } else {
        cell.to_string()
      }
    })
    .join(&DELIMITER.to_string())
}

pub fn decode_line(line: &str) -> Vec<String> {
  let mut cells = Vec::new();
  let mut cell = String::new();
  let mut chars = line.chars().peekable();
  let mut quoted = false;
  let mut at_start = true;
  while let Some(c) = chars.next() {
    match c {
      QUOTE if at_start => quoted = true,
      QUOTE if quoted => {
        if chars.peek() == Some(&QUOTE) {
          chars.next();
          cell.push(QUOTE);
        } else {
          quoted = false;
        }
      }
      DELIMITER if !quoted => {
        cells.push(std::mem::take(&mut cell));
        at_start = true;
        continue;
      }
      c => cell.push(c),
    }
    at_start = false;
  }
  cells.push(cell);
  cells
}
