use std::{
  fs, io,
  path::{Path, PathBuf},
  sync::{Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result};
use indicatif::ParallelProgressIterator;
use log::{info, warn};
use rayon::prelude::*;

use crate::{
  record::{RecordBuilder, Row},
  store::write_atomic,
  time, tsv,
};

/// The consolidated TSV file: one header line with the current schema, then
/// at most one line per participant. Every change rewrites the whole file.
pub struct Ledger {
  builder: RecordBuilder,
  path: PathBuf,
  lock: Mutex<()>,
}

impl Ledger {
  pub fn new(builder: RecordBuilder) -> Self {
    let path = builder.store().ledger_path();
    Ledger {
      builder,
      path,
      lock: Mutex::new(()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn builder(&self) -> &RecordBuilder {
    &self.builder
  }

  // Serializes read-modify-write of the file; guards no in-memory data.
  fn lock(&self) -> MutexGuard<'_, ()> {
    self.lock.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Replaces the participant's line, or appends one. A file whose header is
  /// not the current schema is discarded first.
  pub fn upsert(&self, row: &Row) -> Result<()> {
    let id = row.participant_id();
    if id.is_empty() {
      return Ok(());
    }

    let _guard = self.lock();
    let mut rows = self.read_rows()?;
    let cells = row.cells().to_vec();
    match rows
      .iter_mut()
      .find(|existing| existing.first().map(String::as_str) == Some(id))
    {
      Some(existing) => *existing = cells,
      None => rows.push(cells),
    }
    self.write_rows(&rows)?;
    info!("Ledger row for {id} written ({} rows)", rows.len());
    Ok(())
  }

  /// Regenerates the file from per-participant storage, ordered by id.
  pub fn rebuild_all(&self) -> Result<usize> {
    let _guard = self.lock();
    let ids = self.builder.store().participants()?;
    let rows = time!(
      "rebuild_rows",
      ids
        .par_iter()
        .progress_with_style(crate::pb_style())
        .filter_map(|id| self.builder.build(id))
        .map(|row| row.cells().to_vec())
        .collect::<Vec<_>>()
    );
    self.write_rows(&rows)?;
    info!("Ledger rebuilt with {} rows", rows.len());
    Ok(rows.len())
  }

  /// Rebuilds, then returns the file's bytes. `None` when there is no file.
  pub fn export(&self) -> Result<Option<Vec<u8>>> {
    self.rebuild_all()?;
    let _guard = self.lock();
    match fs::read(&self.path) {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
    }
  }

  /// Data lines of the current file, or nothing if the file is missing or stale.
  fn read_rows(&self) -> Result<Vec<Vec<String>>> {
    let bytes = match fs::read(&self.path) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
    };
    let Ok(contents) = String::from_utf8(bytes) else {
      warn!("Discarding ledger {} with invalid UTF-8", self.path.display());
      return Ok(Vec::new());
    };

    let mut lines = contents.lines();
    let header = lines.next().map(tsv::decode_line);
    if header.as_deref() != Some(self.builder.schema().columns()) {
      warn!("Discarding ledger {} with stale header", self.path.display());
      return Ok(Vec::new());
    }
    Ok(
      lines
        .filter(|line| !line.is_empty())
        .map(tsv::decode_line)
        .collect(),
    )
  }

  fn write_rows(&self, rows: &[Vec<String>]) -> Result<()> {
    let mut contents = tsv::encode_line(self.builder.schema().columns());
    contents.push('\n');
    for row in rows {
      contents.push_str(&tsv::encode_line(row));
      contents.push('\n');
    }
    write_atomic(&self.path, contents.as_bytes())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    answers::ParticipantId, instruments::Instruments, schema::Schema, store::Store,
    store::SubmissionRecord,
  };
  use serde_json::{json, Value};
  use std::sync::Arc;
  use tempfile::TempDir;

  fn ledger(dir: &TempDir) -> Ledger {
    let store = Arc::new(Store::open(dir.path()).unwrap());
    let instruments = Arc::new(Instruments::builtin().unwrap());
    let schema = Arc::new(Schema::new(&instruments));
    Ledger::new(RecordBuilder::new(store, instruments, schema))
  }

  fn id(s: &str) -> ParticipantId {
    ParticipantId::new(s).unwrap()
  }

  fn row(ledger: &Ledger, userid: &str, group: &str) -> Row {
    let mut row = Row::new(ledger.builder().schema().clone());
    row.set("userid", &json!(userid));
    row.set("group", &json!(group));
    row
  }

  fn data_lines(ledger: &Ledger) -> Vec<Vec<String>> {
    let contents = fs::read_to_string(ledger.path()).unwrap();
    contents.lines().skip(1).map(tsv::decode_line).collect()
  }

  #[test]
  fn upsert_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger(&dir);
    ledger.upsert(&row(&ledger, "p1", "group1")).unwrap();
    ledger.upsert(&row(&ledger, "p2", "group2")).unwrap();
    ledger.upsert(&row(&ledger, "p1", "group3")).unwrap();
    ledger.upsert(&row(&ledger, "p1", "group3")).unwrap();

    let lines = data_lines(&ledger);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0][0], "p1");
    assert_eq!(lines[0][1], "group3");
    assert_eq!(lines[1][0], "p2");
  }

  #[test]
  fn upsert_without_id_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger(&dir);
    ledger.upsert(&row(&ledger, "", "group1")).unwrap();
    assert!(!ledger.path().exists());
  }

  #[test]
  fn concurrent_upserts_keep_every_row() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger(&dir);
    let ids = (0..16).map(|n| format!("p{n:02}")).collect::<Vec<_>>();
    std::thread::scope(|s| {
      for userid in &ids {
        let ledger = &ledger;
        s.spawn(move || ledger.upsert(&row(ledger, userid, "group1")).unwrap());
      }
    });

    let mut written = data_lines(&ledger)
      .into_iter()
      .map(|line| line[0].clone())
      .collect::<Vec<_>>();
    written.sort();
    assert_eq!(written, ids);
  }

  #[test]
  fn stale_header_is_discarded() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger(&dir);
    fs::write(ledger.path(), "userid\tgroup\nold\tgroup4\n").unwrap();

    ledger.upsert(&row(&ledger, "p1", "group1")).unwrap();

    let contents = fs::read_to_string(ledger.path()).unwrap();
    let header = contents.lines().next().unwrap();
    assert_eq!(header, ledger.builder().schema().columns().join("\t"));
    let lines = data_lines(&ledger);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0][0], "p1");
  }

  fn seed(ledger: &Ledger) {
    let store = ledger.builder().store();
    for name in ["p2", "p10", "p1"] {
      store.ensure_participant(&id(name)).unwrap();
    }
    store
      .put_form(&id("p1"), "pre2", &SubmissionRecord {
        received_at: None,
        payload: json!({"answers": [{"selected_choice": "say \"4\""}]}),
        score: Some(json!({"positive_affect": 4.0, "negative_affect": Value::Null})),
      })
      .unwrap();
  }

  #[test]
  fn rebuild_is_sorted_and_deterministic() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger(&dir);
    seed(&ledger);
    ledger.upsert(&row(&ledger, "stale", "group1")).unwrap();

    let first = ledger.export().unwrap().unwrap();
    let second = ledger.export().unwrap().unwrap();
    assert_eq!(first, second);

    let ids = data_lines(&ledger)
      .into_iter()
      .map(|line| line[0].clone())
      .collect::<Vec<_>>();
    assert_eq!(ids, vec!["p1", "p10", "p2"]);
  }

  #[test]
  fn empty_dataset_exports_header_only() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger(&dir);
    assert_eq!(ledger.rebuild_all().unwrap(), 0);
    let bytes = ledger.export().unwrap().unwrap();
    let expected = format!("{}\n", ledger.builder().schema().columns().join("\t"));
    assert_eq!(String::from_utf8(bytes).unwrap(), expected);
  }

  #[test]
  fn rows_round_trip_through_the_file() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger(&dir);
    seed(&ledger);
    let built = ledger.builder().build(&id("p1")).unwrap();
    ledger.upsert(&built).unwrap();

    let lines = data_lines(&ledger);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0], built.cells());
    assert_eq!(built.get("pre2-q1-answer"), Some("say \"4\""));
    for cell in &lines[0] {
      assert_eq!(&tsv::sanitize_str(cell), cell);
    }
  }
}
