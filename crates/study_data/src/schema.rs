use fxhash::FxHashMap as HashMap;
use itertools::Itertools;

use crate::instruments::Instruments;

pub const USERID: &str = "userid";
pub const GROUP: &str = "group";
pub const LESSON_DURATION: &str = "lesson-duration_seconds";

/// The ledger's column order, computed once from the instrument table.
///
/// Base columns come first (identity, group, lesson duration, then each
/// instrument's declared columns); after them one raw-answer column per
/// `(instrument, question index)` whose name is not already taken.
#[derive(Debug, PartialEq, Eq)]
pub struct Schema {
  columns: Vec<String>,
  positions: HashMap<String, usize>,
}

impl Schema {
  pub fn new(instruments: &Instruments) -> Self {
    let base = [USERID, GROUP, LESSON_DURATION]
      .into_iter()
      .map(String::from)
      .chain(
        instruments
          .iter()
          .flat_map(|instrument| instrument.columns.iter().map(|column| column.name.clone())),
      );
    let answers = instruments.iter().flat_map(|instrument| {
      (1..=instrument.questions).map(|index| answer_column(&instrument.key, index))
    });
    Schema::from_columns(base.chain(answers).unique().collect())
  }

  fn from_columns(columns: Vec<String>) -> Self {
    let positions = columns
      .iter()
      .enumerate()
      .map(|(i, column)| (column.clone(), i))
      .collect();
    Schema { columns, positions }
  }

  pub fn columns(&self) -> &[String] {
    &self.columns
  }

  pub fn len(&self) -> usize {
    self.columns.len()
  }

  pub fn is_empty(&self) -> bool {
    self.columns.is_empty()
  }

  pub fn position(&self, column: &str) -> Option<usize> {
    self.positions.get(column).copied()
  }
}

pub fn answer_column(instrument: &str, index: u32) -> String {
  format!("{instrument}-q{index}-answer")
}

#[test]
fn test_builtin_schema() {
  let schema = Schema::new(&Instruments::builtin().unwrap());
  let columns = schema.columns();

  assert_eq!(&columns[..3], &[USERID, GROUP, LESSON_DURATION]);
  assert_eq!(columns[3], "pre1-age");
  assert_eq!(columns[34], "post6_2-q4-score");
  assert_eq!(columns[35], "pre1-info-q1-answer");
  assert_eq!(columns.last().unwrap(), "post6_1-q15-answer");

  // post6_2 answer columns are base columns and are not repeated.
  assert_eq!(columns.iter().filter(|c| *c == "post6_2-q1-answer").count(), 1);
  assert!(schema.position("post6_2-q1-answer").unwrap() < schema.position("pre1-info-q1-answer").unwrap());

  // 35 base columns + 5+8+9+15+25+2+8+11+5+15 raw-answer columns.
  assert_eq!(schema.len(), 35 + 103);
  assert_eq!(columns.iter().unique().count(), schema.len());
  assert_eq!(schema.position("userid"), Some(0));
  assert_eq!(schema.position("nope"), None);
}
