use indicatif::ProgressStyle;

pub mod answers;
pub mod instruments;
pub mod ledger;
pub mod record;
pub mod schema;
pub mod scoring;
pub mod sequencer;
pub mod store;
pub mod study;
pub mod tsv;

pub use study::{Study, StudyConfig};

#[macro_export]
macro_rules! time {
  ($name:literal, $e:expr) => {{
    let start = std::time::Instant::now();
    let t = $e;
    log::debug!("{}: {:.2}s", $name, start.elapsed().as_secs_f32());
    t
  }};
}

pub fn pb_style() -> ProgressStyle {
  ProgressStyle::with_template("{elapsed_precise} [{wide_bar:.cyan/blue}] {pos}/{len} {eta}")
    .unwrap()
    .progress_chars("#>-")
}
