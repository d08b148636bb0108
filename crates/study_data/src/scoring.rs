use std::{collections::BTreeSet, sync::OnceLock};

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Number, Value};

use crate::{
  answers::{choices, parse_numeric, AnswerSet},
  instruments::{AnswerKey, Dimension, Instrument, Scoring},
};

/// Derived metrics of one submission, keyed by metric name.
pub type Metrics = Map<String, Value>;

pub const AVERAGE_SCORE: &str = "average_score";
pub const TOTAL_SCORE: &str = "total_score";
pub const MAX_SCORE: &str = "max_score";
pub const SCORES: &str = "scores";
pub const DETAILS: &str = "details";

/// Scores a submission with its instrument's strategy. `None` when the
/// instrument keeps raw answers only or the answer list was empty. A list of
/// unusable entries still scores, as if every item were blank.
pub fn score(instrument: &Instrument, answers: &AnswerSet) -> Option<Metrics> {
  if answers.is_empty() {
    return None;
  }
  Some(match &instrument.scoring {
    Scoring::Raw => return None,
    Scoring::Composite {
      dimensions,
      overall,
    } => composite(answers, dimensions, overall.as_deref()),
    Scoring::Average => average(answers),
    Scoring::Total => total(answers),
    Scoring::Keyed => keyed(answers),
    Scoring::AnswerKey { key } => grade(answers, key),
  })
}

pub fn mean(values: &[f64]) -> Option<f64> {
  (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

fn number(value: Option<f64>) -> Value {
  value
    .and_then(Number::from_f64)
    .map(Value::Number)
    .unwrap_or(Value::Null)
}

fn all_numeric(answers: &AnswerSet) -> Vec<f64> {
  answers
    .distinct()
    .filter_map(|(_, selected)| parse_numeric(selected))
    .collect()
}

pub fn composite(answers: &AnswerSet, dimensions: &[Dimension], overall: Option<&str>) -> Metrics {
  let means = dimensions
    .iter()
    .map(|dim| (dim, mean(&answers.numeric_in(dim.indices()))))
    .collect::<Vec<_>>();
  let mut metrics = Metrics::new();
  for (dim, value) in &means {
    metrics.insert(dim.name.clone(), number(*value));
  }
  if let Some(name) = overall {
    let defined = means.iter().filter_map(|(_, value)| *value).collect::<Vec<_>>();
    metrics.insert(name.to_string(), number(mean(&defined)));
  }
  metrics
}

pub fn average(answers: &AnswerSet) -> Metrics {
  let mut metrics = Metrics::new();
  metrics.insert(AVERAGE_SCORE.into(), number(mean(&all_numeric(answers))));
  metrics
}

pub fn total(answers: &AnswerSet) -> Metrics {
  let mut metrics = Metrics::new();
  let sum = all_numeric(answers).into_iter().sum::<f64>();
  metrics.insert(TOTAL_SCORE.into(), number(Some(sum)));
  metrics
}

pub fn keyed(answers: &AnswerSet) -> Metrics {
  let scores = answers
    .distinct()
    .map(|(index, selected)| {
      let value = match parse_numeric(selected) {
        Some(n) => number(Some(n)),
        None => selected.clone(),
      };
      (index.to_string(), value)
    })
    .collect::<Map<_, _>>();
  let mut metrics = Metrics::new();
  metrics.insert(SCORES.into(), Value::Object(scores));
  metrics
}

#[derive(Serialize, Debug, PartialEq)]
pub struct ItemGrade {
  pub index: u32,
  pub selected: Vec<char>,
  pub expected: Vec<char>,
  pub is_correct: bool,
}

/// First letter of a choice like `"b. Something"`, uppercased.
pub fn extract_letter(choice: &Value) -> Option<char> {
  static REGEX: OnceLock<Regex> = OnceLock::new();
  let regex = REGEX.get_or_init(|| Regex::new("[A-Z]").unwrap());
  let Value::String(s) = choice else {
    return None;
  };
  let upper = s.to_uppercase();
  regex.find(&upper)?.as_str().chars().next()
}

pub fn selected_letters(selected: &Value) -> BTreeSet<char> {
  choices(selected).into_iter().filter_map(extract_letter).collect()
}

/// Exact-match grading: an item is correct iff the selected letters equal the
/// expected set, no more and no fewer.
pub fn grade(answers: &AnswerSet, key: &AnswerKey) -> Metrics {
  let details = key
    .iter()
    .map(|(index, expected)| {
      let selected = answers.get(index).map(selected_letters).unwrap_or_default();
      ItemGrade {
        index,
        is_correct: &selected == expected,
        selected: selected.into_iter().collect(),
        expected: expected.iter().copied().collect(),
      }
    })
    .collect::<Vec<_>>();
  let correct = details.iter().filter(|item| item.is_correct).count();

  let mut metrics = Metrics::new();
  metrics.insert(TOTAL_SCORE.into(), json!(correct));
  metrics.insert(MAX_SCORE.into(), json!(key.len()));
  metrics.insert(DETAILS.into(), json!(details));
  metrics
}

/// Follows a dotted path (`"scores.1"`) into stored metrics.
pub fn lookup<'a>(metrics: &'a Metrics, path: &str) -> Option<&'a Value> {
  let mut parts = path.split('.');
  let mut value = metrics.get(parts.next()?)?;
  for part in parts {
    value = value.get(part)?;
  }
  Some(value)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::instruments::Instruments;

  fn answers(values: &[Value]) -> AnswerSet {
    let entries = values
      .iter()
      .enumerate()
      .map(|(i, v)| json!({"index": i + 1, "selected_choice": v}))
      .collect::<Vec<_>>();
    AnswerSet::from_entries(&entries)
  }

  fn scored(key: &str, set: &AnswerSet) -> Option<Metrics> {
    let instruments = Instruments::builtin().unwrap();
    score(instruments.get(key).unwrap(), set)
  }

  #[test]
  fn affect_composite() {
    let set = answers(&[
      json!(4), json!(4), json!(4), json!(4), json!(4),
      json!(2), json!(2), json!(2), json!(2), json!(2),
    ]);
    let metrics = scored("pre2", &set).unwrap();
    assert_eq!(metrics["positive_affect"], json!(4.0));
    assert_eq!(metrics["negative_affect"], json!(2.0));
  }

  #[test]
  fn empty_partition_is_null() {
    let set = answers(&[json!("3"), json!("x"), json!(5)]);
    let metrics = scored("post3", &set).unwrap();
    assert_eq!(metrics["positive_affect"], json!(4.0));
    assert_eq!(metrics["negative_affect"], Value::Null);

    let none_numeric = answers(&[json!("a"), json!(null)]);
    let metrics = scored("pre2", &none_numeric).unwrap();
    assert_eq!(metrics["positive_affect"], Value::Null);
  }

  #[test]
  fn dimensions_are_independent() {
    let mut values = vec![json!(1); 25];
    values[15] = json!(7);
    values[21] = json!("");
    let metrics = scored("post1", &answers(&values)).unwrap();
    assert_eq!(metrics["sociability"], json!(1.0));
    assert_eq!(metrics["teaching_support"], json!(2.0));
    assert_eq!(metrics["disturbance"], json!(1.0));
  }

  #[test]
  fn trust_overall_averages_defined_dimensions() {
    let set = answers(&[
      json!(5), json!(5), json!(5), json!(5), json!(5),
      json!(3), json!(3), json!(3),
    ]);
    let metrics = scored("post4", &set).unwrap();
    assert_eq!(metrics["ability_trust"], json!(5.0));
    assert_eq!(metrics["benevolence_trust"], json!(3.0));
    assert_eq!(metrics["integrity_trust"], Value::Null);
    assert_eq!(metrics["overall_trust"], json!(4.0));
  }

  #[test]
  fn average_and_total() {
    let set = answers(&[json!(1), json!("2"), json!("n/a"), json!(6)]);
    assert_eq!(scored("pre3", &set).unwrap()[AVERAGE_SCORE], json!(3.0));
    assert_eq!(scored("pre4", &set).unwrap()[TOTAL_SCORE], json!(9.0));

    let blank = answers(&[json!(""), json!(null)]);
    assert_eq!(scored("pre4", &blank).unwrap()[TOTAL_SCORE], json!(0.0));
    assert_eq!(scored("post5", &blank).unwrap()[AVERAGE_SCORE], Value::Null);
  }

  #[test]
  fn keyed_scores() {
    let set = answers(&[json!("4"), json!("free text")]);
    let metrics = scored("post2", &set).unwrap();
    assert_eq!(metrics[SCORES], json!({"1": 4.0, "2": "free text"}));
    assert_eq!(lookup(&metrics, "scores.1"), Some(&json!(4.0)));
    assert_eq!(lookup(&metrics, "scores.3"), None);
  }

  #[test]
  fn not_scorable() {
    let set = answers(&[json!("x")]);
    assert!(scored("pre1-info", &set).is_none());
    assert!(scored("post6_2", &set).is_none());
    assert!(scored("pre2", &AnswerSet::default()).is_none());
  }

  #[test]
  fn unusable_entries_still_score() {
    let junk = AnswerSet::from_entries(&[json!("junk"), json!(3), json!(null)]);
    assert_eq!(scored("pre4", &junk).unwrap()[TOTAL_SCORE], json!(0.0));
    let graded = scored("post6_1", &junk).unwrap();
    assert_eq!(graded[TOTAL_SCORE], json!(0));
    assert_eq!(scored("pre3", &junk).unwrap()[AVERAGE_SCORE], Value::Null);
  }

  #[test]
  fn letters() {
    assert_eq!(extract_letter(&json!("b. Something")), Some('B'));
    assert_eq!(extract_letter(&json!("  (c)")), Some('C'));
    assert_eq!(extract_letter(&json!("123")), None);
    assert_eq!(extract_letter(&json!(1)), None);
    assert_eq!(
      selected_letters(&json!(["A", "c", "A"])),
      BTreeSet::from(['A', 'C'])
    );
    assert_eq!(selected_letters(&json!("D")), BTreeSet::from(['D']));
    assert!(selected_letters(&json!(null)).is_empty());
    assert!(selected_letters(&json!("")).is_empty());
  }

  #[test]
  fn exact_match_grading() {
    let set = AnswerSet::from_entries(&[
      json!({"index": 1, "selected_choice": ["A", "B", "C", "D"]}),
      json!({"index": 2, "selected_choice": ["A"]}),
      json!({"index": 5, "selected_choice": ["A", "B"]}),
      json!({"index": 6, "selected_choice": "B. second"}),
    ]);
    let metrics = scored("post6_1", &set).unwrap();
    assert_eq!(metrics[TOTAL_SCORE], json!(2));
    assert_eq!(metrics[MAX_SCORE], json!(15));

    let details = metrics[DETAILS].as_array().unwrap();
    assert_eq!(details.len(), 15);
    assert_eq!(
      details[0],
      json!({"index": 1, "selected": ["A", "B", "C", "D"], "expected": ["A", "B", "C", "D"], "is_correct": true})
    );
    // subset
    assert_eq!(details[1]["is_correct"], json!(false));
    // superset
    assert_eq!(details[4]["is_correct"], json!(false));
    assert_eq!(details[5]["is_correct"], json!(true));
    // unanswered
    assert_eq!(details[14]["selected"], json!([]));
    assert_eq!(details[14]["is_correct"], json!(false));
  }

  #[test]
  fn grading_uses_positional_index() {
    let set = AnswerSet::from_entries(&[json!({"selected_choice": ["A", "B", "C", "D"]})]);
    let metrics = scored("post6_1", &set).unwrap();
    assert_eq!(metrics[TOTAL_SCORE], json!(1));
  }
}
