use std::{
  fs, io,
  path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use log::warn;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::answers::{DateTime, ParticipantId};

const GROUP_FILE: &str = "group.json";
const LESSON_FILE: &str = "lesson.json";
const META_FILE: &str = "meta.json";
const FORMS_DIR: &str = "forms";
const CURSOR_FILE: &str = "group_sequence.json";
const LEDGER_FILE: &str = "user_record.tsv";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GroupRecord {
  #[serde(default)]
  pub group: Value,
  #[serde(default)]
  pub assigned_at: Option<DateTime>,
}

/// A stored submission: the raw request payload, plus derived metrics when the
/// instrument is scorable. Lesson records share the shape without a score.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubmissionRecord {
  #[serde(default)]
  pub received_at: Option<DateTime>,
  #[serde(default)]
  pub payload: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub score: Option<Value>,
}

/// Participant status. Fields with unexpected types are read leniently so a
/// single odd value never discards the rest of the record.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Meta {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user_id: Option<String>,
  #[serde(
    default,
    deserialize_with = "lenient_time",
    skip_serializing_if = "Option::is_none"
  )]
  pub registered_at: Option<DateTime>,
  #[serde(default, deserialize_with = "lenient_flag")]
  pub completed: bool,
  #[serde(
    default,
    deserialize_with = "lenient_time",
    skip_serializing_if = "Option::is_none"
  )]
  pub completed_at: Option<DateTime>,
  #[serde(
    default,
    deserialize_with = "lenient_time",
    skip_serializing_if = "Option::is_none"
  )]
  pub status_updated_at: Option<DateTime>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Per-participant JSON records in a directory keyed by participant id.
///
/// Reads are forgiving: a missing or unparseable file reads as `None`. Writes
/// go to a sibling temporary file which then replaces the target.
pub struct Store {
  root: PathBuf,
}

impl Store {
  pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
    let root = root.into();
    fs::create_dir_all(&root).with_context(|| format!("Failed to create {}", root.display()))?;
    Ok(Store { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn cursor_path(&self) -> PathBuf {
    self.root.join(CURSOR_FILE)
  }

  pub fn ledger_path(&self) -> PathBuf {
    self.root.join(LEDGER_FILE)
  }

  fn dir(&self, id: &ParticipantId) -> PathBuf {
    self.root.join(id.as_str())
  }

  fn form_path(&self, id: &ParticipantId, key: &str) -> PathBuf {
    self.dir(id).join(FORMS_DIR).join(format!("{key}.json"))
  }

  pub fn exists(&self, id: &ParticipantId) -> bool {
    self.dir(id).is_dir()
  }

  pub fn ensure_participant(&self, id: &ParticipantId) -> Result<()> {
    let forms = self.dir(id).join(FORMS_DIR);
    fs::create_dir_all(&forms).with_context(|| format!("Failed to create {}", forms.display()))
  }

  /// Every participant directory, sorted by id.
  pub fn participants(&self) -> Result<Vec<ParticipantId>> {
    let entries =
      fs::read_dir(&self.root).with_context(|| format!("Failed to list {}", self.root.display()))?;
    let mut ids = Vec::new();
    for entry in entries {
      let entry = entry?;
      if !entry.file_type()?.is_dir() {
        continue;
      }
      let name = entry.file_name();
      match name.to_str().map(ParticipantId::new) {
        Some(Ok(id)) => ids.push(id),
        _ => warn!("Skipping storage directory with invalid participant id: {name:?}"),
      }
    }
    ids.sort();
    Ok(ids)
  }

  pub fn group(&self, id: &ParticipantId) -> Option<GroupRecord> {
    read_json(&self.dir(id).join(GROUP_FILE))
  }

  pub fn put_group(&self, id: &ParticipantId, record: &GroupRecord) -> Result<()> {
    self.ensure_participant(id)?;
    write_json(&self.dir(id).join(GROUP_FILE), record)
  }

  pub fn lesson(&self, id: &ParticipantId) -> Option<SubmissionRecord> {
    read_json(&self.dir(id).join(LESSON_FILE))
  }

  pub fn put_lesson(&self, id: &ParticipantId, record: &SubmissionRecord) -> Result<()> {
    self.ensure_participant(id)?;
    write_json(&self.dir(id).join(LESSON_FILE), record)
  }

  pub fn form(&self, id: &ParticipantId, key: &str) -> Option<SubmissionRecord> {
    read_json(&self.form_path(id, key))
  }

  pub fn has_form(&self, id: &ParticipantId, key: &str) -> bool {
    self.form_path(id, key).is_file()
  }

  pub fn put_form(&self, id: &ParticipantId, key: &str, record: &SubmissionRecord) -> Result<()> {
    validate_form_key(key)?;
    self.ensure_participant(id)?;
    write_json(&self.form_path(id, key), record)
  }

  pub fn meta(&self, id: &ParticipantId) -> Meta {
    read_json(&self.dir(id).join(META_FILE)).unwrap_or_default()
  }

  pub fn put_meta(&self, id: &ParticipantId, meta: &Meta) -> Result<()> {
    self.ensure_participant(id)?;
    write_json(&self.dir(id).join(META_FILE), meta)
  }
}

/// JSON truthiness: null, false, zero and empty strings or containers are false.
pub fn is_truthy(value: &Value) -> bool {
  match value {
    Value::Null => false,
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64() != Some(0.0),
    Value::String(s) => !s.is_empty(),
    Value::Array(items) => !items.is_empty(),
    Value::Object(fields) => !fields.is_empty(),
  }
}

fn lenient_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
  Ok(is_truthy(&Value::deserialize(deserializer)?))
}

fn lenient_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime>, D::Error> {
  Ok(serde_json::from_value(Value::deserialize(deserializer)?).ok())
}

pub fn validate_form_key(key: &str) -> Result<()> {
  if key.is_empty()
    || !key
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
  {
    bail!("Invalid form key: {key:?}");
  }
  Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
  let contents = match fs::read_to_string(path) {
    Ok(contents) => contents,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
    Err(e) => {
      warn!("Failed to read {}: {e}", path.display());
      return None;
    }
  };
  match serde_json::from_str(&contents) {
    Ok(value) => Some(value),
    Err(e) => {
      warn!("Ignoring malformed {}: {e}", path.display());
      None
    }
  }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
  let contents = serde_json::to_string_pretty(value)?;
  write_atomic(path, contents.as_bytes())
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
  let tmp_path = path.with_extension("tmp");
  fs::write(&tmp_path, bytes).with_context(|| format!("Failed to write {}", tmp_path.display()))?;
  fs::rename(&tmp_path, path).with_context(|| format!("Failed to replace {}", path.display()))
}
