use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::{
  answers::{AnswerSet, ParticipantId},
  instruments::Instruments,
  ledger::Ledger,
  record::RecordBuilder,
  schema::Schema,
  scoring,
  sequencer::{GroupSequencer, Reassignment},
  store::{Store, SubmissionRecord},
  time,
};

/// Form key used when a submission does not name its instrument.
pub const UNKNOWN_FORM: &str = "unknown";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StudyConfig {
  pub data_dir: PathBuf,
  pub reassignment: Reassignment,
  /// Instrument table to use instead of the built-in one.
  pub instruments: Option<PathBuf>,
}

impl Default for StudyConfig {
  fn default() -> Self {
    StudyConfig {
      data_dir: PathBuf::from("data"),
      reassignment: Reassignment::Strict,
      instruments: None,
    }
  }
}

/// Everything one study deployment needs: participant storage, condition
/// assignment and the consolidated ledger.
pub struct Study {
  store: Arc<Store>,
  instruments: Arc<Instruments>,
  sequencer: GroupSequencer,
  ledger: Ledger,
}

impl Study {
  /// Opens the data directory and brings the ledger in line with storage.
  pub fn open(config: &StudyConfig) -> Result<Self> {
    let store = Arc::new(Store::open(&config.data_dir)?);
    let instruments = Arc::new(match &config.instruments {
      Some(path) => Instruments::load(path)?,
      None => Instruments::builtin()?,
    });
    let schema = Arc::new(Schema::new(&instruments));
    let builder = RecordBuilder::new(store.clone(), instruments.clone(), schema);
    let study = Study {
      sequencer: GroupSequencer::new(store.clone(), config.reassignment),
      ledger: Ledger::new(builder),
      store,
      instruments,
    };
    if config.reassignment == Reassignment::Permissive {
      warn!("Permissive reassignment is enabled: participants may change condition on every request");
    }
    time!("bootstrap_ledger", study.ledger.rebuild_all()?);
    Ok(study)
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn ledger(&self) -> &Ledger {
    &self.ledger
  }

  pub fn register(&self) -> Result<ParticipantId> {
    let id = ParticipantId::generate();
    self.store.ensure_participant(&id)?;
    let mut meta = self.store.meta(&id);
    meta.user_id = Some(id.to_string());
    meta.registered_at = Some(Utc::now());
    self.store.put_meta(&id, &meta)?;
    info!("New participant registered: {id}");
    Ok(id)
  }

  pub fn assign(&self, id: &ParticipantId) -> Result<&'static str> {
    self.sequencer.assign(id)
  }

  /// Stores a submission, scoring it when its instrument is scorable. The
  /// ledger is untouched until the participant is finalized.
  pub fn record_submission(&self, id: &ParticipantId, form_key: &str, payload: Value) -> Result<()> {
    let score = self.instruments.get(form_key).and_then(|instrument| {
      scoring::score(instrument, &AnswerSet::from_payload(&payload)).map(Value::Object)
    });
    self.store.put_form(id, form_key, &SubmissionRecord {
      received_at: Some(Utc::now()),
      payload,
      score,
    })?;
    info!("Participant {id} submitted form {form_key}");
    Ok(())
  }

  pub fn record_lesson(&self, id: &ParticipantId, payload: Value) -> Result<()> {
    self.store.put_lesson(id, &SubmissionRecord {
      received_at: Some(Utc::now()),
      payload,
      score: None,
    })?;
    info!("Participant {id} completed the lesson");
    Ok(())
  }

  /// Under permissive reassignment nobody reads as completed, so a returning
  /// participant starts over.
  pub fn completion(&self, id: &ParticipantId) -> bool {
    match self.sequencer.policy() {
      Reassignment::Permissive => false,
      Reassignment::Strict => self.store.meta(id).completed,
    }
  }

  pub fn set_completion(&self, id: &ParticipantId, completed: bool) -> Result<()> {
    self.store.ensure_participant(id)?;
    let mut meta = self.store.meta(id);
    if meta.user_id.is_none() {
      meta.user_id = Some(id.to_string());
    }
    let now = Utc::now();
    meta.completed = completed;
    meta.completed_at = completed.then_some(now);
    meta.status_updated_at = Some(now);
    self.store.put_meta(id, &meta)?;
    info!("Participant {id} completion set to {completed}");
    if completed {
      self.finalize(id)?;
    }
    Ok(())
  }

  /// Rebuilds the participant's row and upserts it. Returns whether a row
  /// was written.
  pub fn finalize(&self, id: &ParticipantId) -> Result<bool> {
    let missing = self.missing_instruments(id);
    if !missing.is_empty() {
      warn!("Finalizing {id} without {}", missing.join(", "));
    }
    let Some(row) = self.ledger.builder().build(id) else {
      return Ok(false);
    };
    self.ledger.upsert(&row)?;
    Ok(true)
  }

  pub fn missing_instruments(&self, id: &ParticipantId) -> Vec<&str> {
    self
      .instruments
      .required()
      .filter(|key| !self.store.has_form(id, key))
      .collect()
  }

  pub fn export_ledger(&self) -> Result<Option<Vec<u8>>> {
    self.ledger.export()
  }
}
