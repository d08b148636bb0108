use std::{
  path::PathBuf,
  sync::{Arc, Mutex, PoisonError},
};

use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
  answers::ParticipantId,
  store::{read_json, write_json, GroupRecord, Store},
};

pub const GROUP_LABELS: [&str; 4] = ["group1", "group2", "group3", "group4"];

/// What a repeated group request for an already-assigned participant does.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Reassignment {
  /// Keep the stored condition; each participant gets exactly one.
  #[default]
  Strict,
  /// Testing only: draw a fresh condition on every request, overwriting the
  /// stored one. Breaks the one-condition-per-participant guarantee.
  Permissive,
}

/// Round-robin condition assignment over [`GROUP_LABELS`], driven by a single
/// persisted cursor shared by all participants.
pub struct GroupSequencer {
  store: Arc<Store>,
  cursor_path: PathBuf,
  policy: Reassignment,
  lock: Mutex<()>,
}

impl GroupSequencer {
  pub fn new(store: Arc<Store>, policy: Reassignment) -> Self {
    let cursor_path = store.cursor_path();
    GroupSequencer {
      store,
      cursor_path,
      policy,
      lock: Mutex::new(()),
    }
  }

  pub fn policy(&self) -> Reassignment {
    self.policy
  }

  pub fn assign(&self, id: &ParticipantId) -> Result<&'static str> {
    // Guards no data; the cursor file itself is the shared state.
    let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

    if self.policy == Reassignment::Strict {
      if let Some(label) = self.store.group(id).and_then(|record| known_label(&record.group)) {
        return Ok(label);
      }
    }

    let cursor = self.cursor();
    let label = GROUP_LABELS[cursor];
    self.store.put_group(id, &GroupRecord {
      group: Value::String(label.to_string()),
      assigned_at: Some(chrono::Utc::now()),
    })?;
    write_json(
      &self.cursor_path,
      &json!({ "next_index": (cursor + 1) % GROUP_LABELS.len() }),
    )?;
    info!("Assigned {id} to {label}");
    Ok(label)
  }

  /// The next cursor position. Missing or corrupt cursor files read as 0.
  pub fn cursor(&self) -> usize {
    let Some(data) = read_json::<Value>(&self.cursor_path) else {
      return 0;
    };
    let index = match data.get("next_index") {
      Some(Value::Number(n)) => n.as_i64(),
      Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
      _ => None,
    };
    index
      .map(|i| i.rem_euclid(GROUP_LABELS.len() as i64) as usize)
      .unwrap_or(0)
  }
}

fn known_label(group: &Value) -> Option<&'static str> {
  let group = group.as_str()?;
  GROUP_LABELS.iter().copied().find(|label| *label == group)
}
