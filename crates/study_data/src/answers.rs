use std::fmt;

use anyhow::{anyhow, bail, Result};
use arrayvec::ArrayString;
use fxhash::FxHashMap as HashMap;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use smallvec::SmallVec;

pub type DateTime = chrono::DateTime<chrono::Utc>;

const GENERATED_ID_LEN: usize = 16;
const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Identifier of one study participant. Doubles as the name of the
/// participant's storage directory, so it is validated on construction.
#[derive(Serialize, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct ParticipantId(ArrayString<64>);

impl ParticipantId {
  pub fn new(s: &str) -> Result<Self> {
    let s = s.trim();
    if s.is_empty() {
      bail!("Participant id is empty");
    }
    if s == "." || s == ".." || s.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
      bail!("Participant id is not a valid directory name: {s:?}");
    }
    Ok(ParticipantId(
      ArrayString::from(s).map_err(|_| anyhow!("Participant id too long"))?,
    ))
  }

  pub fn generate() -> Self {
    let mut rng = rand::thread_rng();
    let mut id = ArrayString::new();
    for _ in 0..GENERATED_ID_LEN {
      id.push(ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char);
    }
    ParticipantId(id)
  }

  pub fn as_str(&self) -> &str {
    self.0.as_str()
  }
}

impl fmt::Debug for ParticipantId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

impl fmt::Display for ParticipantId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnswerEntry {
  pub index: u32,
  pub selected: Value,
}

/// The answer entries of one instrument submission, in submission order.
///
/// An entry's index is its explicit `index` field when that is a positive
/// integer, otherwise its 1-based position in the submitted list. Indices may
/// repeat; lookups by index always resolve to the first entry carrying it.
/// Entries that are not objects occupy a position but carry no answer.
#[derive(Debug, Default)]
pub struct AnswerSet {
  entries: Vec<AnswerEntry>,
  first: HashMap<u32, usize>,
  submitted: usize,
}

impl AnswerSet {
  pub fn from_payload(payload: &Value) -> Self {
    match payload.get("answers") {
      Some(Value::Array(answers)) => Self::from_entries(answers),
      _ => Self::default(),
    }
  }

  pub fn from_entries(answers: &[Value]) -> Self {
    let mut set = AnswerSet {
      submitted: answers.len(),
      ..AnswerSet::default()
    };
    for (position, entry) in answers.iter().enumerate() {
      let Value::Object(fields) = entry else {
        continue;
      };
      let index = fields
        .get("index")
        .and_then(explicit_index)
        .unwrap_or(position as u32 + 1);
      let selected = fields.get("selected_choice").cloned().unwrap_or(Value::Null);
      set.first.entry(index).or_insert(set.entries.len());
      set.entries.push(AnswerEntry { index, selected });
    }
    set
  }

  /// True when the submitted list itself was empty or absent.
  pub fn is_empty(&self) -> bool {
    self.submitted == 0
  }

  pub fn entries(&self) -> &[AnswerEntry] {
    &self.entries
  }

  pub fn get(&self, index: u32) -> Option<&Value> {
    self.first.get(&index).map(|&i| &self.entries[i].selected)
  }

  /// One `(index, selection)` pair per distinct index, in order of first appearance.
  pub fn distinct(&self) -> impl Iterator<Item = (u32, &Value)> + '_ {
    self
      .entries
      .iter()
      .enumerate()
      .filter(|(i, entry)| self.first[&entry.index] == *i)
      .map(|(_, entry)| (entry.index, &entry.selected))
  }

  pub fn numeric_in(&self, indices: impl IntoIterator<Item = u32>) -> Vec<f64> {
    indices
      .into_iter()
      .filter_map(|index| self.get(index).and_then(parse_numeric))
      .collect()
  }
}

fn explicit_index(value: &Value) -> Option<u32> {
  let index = match value {
    Value::Number(n) => u32::try_from(n.as_u64()?).ok()?,
    Value::String(s) => s.trim().parse::<u32>().ok()?,
    _ => return None,
  };
  (index > 0).then_some(index)
}

/// Accepts JSON numbers directly and strings whose trimmed form parses as a float.
pub fn parse_numeric(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => {
      let trimmed = s.trim();
      if trimmed.is_empty() {
        return None;
      }
      trimmed.parse::<f64>().ok()
    }
    _ => None,
  }
}

/// A selection as a list of choices: lists as-is, null as nothing, any other
/// scalar as a single choice.
pub fn choices(selected: &Value) -> SmallVec<[&Value; 4]> {
  match selected {
    Value::Array(items) => items.iter().collect(),
    Value::Null => SmallVec::new(),
    other => smallvec::smallvec![other],
  }
}
