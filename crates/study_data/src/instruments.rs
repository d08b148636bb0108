use std::{collections::BTreeMap, collections::BTreeSet, fs, path::Path};

use anyhow::{bail, ensure, Context, Result};
use fxhash::FxHashSet as HashSet;
use serde::Deserialize;

const DEFAULT_INSTRUMENTS: &str = include_str!("../instruments.toml");

/// The declared questionnaire instruments, in ledger order.
#[derive(Deserialize, Debug)]
pub struct Instruments {
  #[serde(rename = "instrument")]
  instruments: Vec<Instrument>,
  #[serde(default)]
  required: Vec<String>,
}

#[derive(Deserialize, Debug)]
pub struct Instrument {
  pub key: String,
  pub questions: u32,
  #[serde(default)]
  pub columns: Vec<ColumnSpec>,
  #[serde(default)]
  pub scoring: Scoring,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ColumnSpec {
  pub name: String,
  #[serde(default)]
  answer: Option<u32>,
  #[serde(default)]
  metric: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSource<'a> {
  Answer(u32),
  Metric(&'a str),
  Unfilled,
}

impl ColumnSpec {
  pub fn source(&self) -> ColumnSource<'_> {
    match (self.answer, self.metric.as_deref()) {
      (Some(index), _) => ColumnSource::Answer(index),
      (None, Some(path)) => ColumnSource::Metric(path),
      (None, None) => ColumnSource::Unfilled,
    }
  }
}

#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scoring {
  /// Raw answers only.
  #[default]
  Raw,
  /// Mean per dimension, optionally with an overall mean of the defined dimension means.
  Composite {
    dimensions: Vec<Dimension>,
    #[serde(default)]
    overall: Option<String>,
  },
  Average,
  Total,
  /// Every answer re-keyed by its index, numeric where possible.
  Keyed,
  /// Multi-select items graded by exact match against a fixed letter set.
  AnswerKey { key: AnswerKey },
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Dimension {
  pub name: String,
  pub first: u32,
  pub last: u32,
}

impl Dimension {
  pub fn indices(&self) -> std::ops::RangeInclusive<u32> {
    self.first..=self.last
  }
}

#[derive(Deserialize)]
pub struct AnswerKeyItem {
  index: u32,
  letters: String,
}

/// Question index to the exact set of letters that must be selected.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "Vec<AnswerKeyItem>")]
pub struct AnswerKey(BTreeMap<u32, BTreeSet<char>>);

impl TryFrom<Vec<AnswerKeyItem>> for AnswerKey {
  type Error = anyhow::Error;

  fn try_from(items: Vec<AnswerKeyItem>) -> Result<Self> {
    let mut key = BTreeMap::new();
    for item in items {
      ensure!(
        !item.letters.is_empty() && item.letters.chars().all(|c| c.is_ascii_uppercase()),
        "Answer key for question {} must be uppercase letters, got {:?}",
        item.index,
        item.letters
      );
      if key.insert(item.index, item.letters.chars().collect()).is_some() {
        bail!("Question {} appears twice in the answer key", item.index);
      }
    }
    Ok(AnswerKey(key))
  }
}

impl AnswerKey {
  pub fn iter(&self) -> impl Iterator<Item = (u32, &BTreeSet<char>)> + '_ {
    self.0.iter().map(|(index, letters)| (*index, letters))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl Instruments {
  pub fn builtin() -> Result<Self> {
    Self::parse(DEFAULT_INSTRUMENTS).context("Failed to parse built-in instrument table")
  }

  pub fn load(path: &Path) -> Result<Self> {
    let s = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Self::parse(&s).with_context(|| format!("Failed to parse {}", path.display()))
  }

  pub fn parse(s: &str) -> Result<Self> {
    let instruments = toml::from_str::<Instruments>(s)?;
    instruments.validate()?;
    Ok(instruments)
  }

  fn validate(&self) -> Result<()> {
    let mut keys = HashSet::default();
    for instrument in &self.instruments {
      ensure!(!instrument.key.is_empty(), "Instrument key must not be empty");
      ensure!(
        keys.insert(instrument.key.as_str()),
        "Instrument {} is declared twice",
        instrument.key
      );
      for column in &instrument.columns {
        ensure!(
          column.answer.is_none() || column.metric.is_none(),
          "Column {} reads both an answer and a metric",
          column.name
        );
      }
      if let Scoring::Composite { dimensions, .. } = &instrument.scoring {
        for dim in dimensions {
          ensure!(
            dim.first >= 1 && dim.first <= dim.last,
            "Dimension {} of {} has an empty index range",
            dim.name,
            instrument.key
          );
        }
      }
    }
    for key in &self.required {
      ensure!(keys.contains(key.as_str()), "Required instrument {key} is not declared");
    }
    Ok(())
  }

  pub fn iter(&self) -> impl Iterator<Item = &Instrument> + '_ {
    self.instruments.iter()
  }

  pub fn get(&self, key: &str) -> Option<&Instrument> {
    self.instruments.iter().find(|instrument| instrument.key == key)
  }

  pub fn required(&self) -> impl Iterator<Item = &str> + '_ {
    self.required.iter().map(String::as_str)
  }
}
