use std::sync::Arc;

use serde_json::{Number, Value};

use crate::{
  answers::{AnswerSet, ParticipantId},
  instruments::{ColumnSource, Instruments},
  schema::{self, Schema},
  scoring,
  store::Store,
  tsv,
};

/// One participant's ledger row: a sanitized cell for every schema column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
  schema: Arc<Schema>,
  cells: Vec<String>,
}

impl Row {
  pub fn new(schema: Arc<Schema>) -> Self {
    let cells = vec![String::new(); schema.len()];
    Row { schema, cells }
  }

  /// Sets a column from a stored value. Unknown columns are ignored.
  pub fn set(&mut self, column: &str, value: &Value) {
    if let Some(i) = self.schema.position(column) {
      self.cells[i] = tsv::sanitize(value);
    }
  }

  pub fn get(&self, column: &str) -> Option<&str> {
    let i = self.schema.position(column)?;
    Some(&self.cells[i])
  }

  pub fn participant_id(&self) -> &str {
    self.get(schema::USERID).unwrap_or_default()
  }

  pub fn cells(&self) -> &[String] {
    &self.cells
  }
}

/// Derives a participant's row from everything currently stored for them.
pub struct RecordBuilder {
  store: Arc<Store>,
  instruments: Arc<Instruments>,
  schema: Arc<Schema>,
}

impl RecordBuilder {
  pub fn new(store: Arc<Store>, instruments: Arc<Instruments>, schema: Arc<Schema>) -> Self {
    RecordBuilder {
      store,
      instruments,
      schema,
    }
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn schema(&self) -> &Arc<Schema> {
    &self.schema
  }

  /// `None` if nothing is stored for the participant. Missing pieces leave
  /// their columns empty.
  pub fn build(&self, id: &ParticipantId) -> Option<Row> {
    if !self.store.exists(id) {
      return None;
    }

    let mut row = Row::new(self.schema.clone());
    row.set(schema::USERID, &Value::String(id.to_string()));

    if let Some(group) = self.store.group(id) {
      row.set(schema::GROUP, &group.group);
    }

    if let Some(lesson) = self.store.lesson(id) {
      row.set(schema::LESSON_DURATION, &lesson_seconds(&lesson.payload));
    }

    for instrument in self.instruments.iter() {
      let Some(form) = self.store.form(id, &instrument.key) else {
        continue;
      };
      let answers = AnswerSet::from_payload(&form.payload);
      for (index, selected) in answers.distinct() {
        row.set(&schema::answer_column(&instrument.key, index), selected);
      }

      let metrics = form.score.as_ref().and_then(Value::as_object);
      for column in &instrument.columns {
        match column.source() {
          ColumnSource::Answer(index) => {
            row.set(&column.name, answers.get(index).unwrap_or(&Value::Null));
          }
          ColumnSource::Metric(path) => {
            if let Some(metrics) = metrics {
              row.set(&column.name, scoring::lookup(metrics, path).unwrap_or(&Value::Null));
            }
          }
          ColumnSource::Unfilled => {}
        }
      }
    }

    Some(row)
  }
}

/// `duration_ms` in seconds when numeric, otherwise passed through as stored.
fn lesson_seconds(payload: &Value) -> Value {
  match payload.get("duration_ms") {
    Some(Value::Number(ms)) => ms
      .as_f64()
      .and_then(|ms| Number::from_f64(ms / 1000.0))
      .map(Value::Number)
      .unwrap_or(Value::Null),
    Some(other) => other.clone(),
    None => Value::Null,
  }
}
