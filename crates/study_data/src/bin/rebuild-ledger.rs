use std::{env, path::PathBuf};

use anyhow::Result;
use study_data::{Study, StudyConfig};

fn main() -> Result<()> {
  env_logger::init();

  let mut config = StudyConfig::default();
  if let Some(data_dir) = env::args().nth(1) {
    config.data_dir = PathBuf::from(data_dir);
  }
  if let Some(instruments) = env::args().nth(2) {
    config.instruments = Some(PathBuf::from(instruments));
  }

  // Opening the study regenerates the ledger from per-participant storage.
  let study = Study::open(&config)?;
  let participants = study.store().participants()?.len();
  println!(
    "Wrote {} ({participants} participants)",
    study.ledger().path().display()
  );

  Ok(())
}
