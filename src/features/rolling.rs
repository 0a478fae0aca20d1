//! Trailing-window averages with shift-then-roll semantics.
//!
//! For the row at position `i` of an entity's ordered sequence, the value
//! for window `w` is the mean of the metric over the `w` observations that
//! precede the row, never including the row itself. Missing metric values are
//! excluded from both the sum and the count. With no usable prior value the
//! result is `None`, never zero.
//!
//! All windows for a metric are answered from one pair of prefix sums, so a
//! sequence is scanned once per metric regardless of how many windows are
//! requested.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::models::EntityStatRow;
use crate::error::{PipelineError, Result};

/// Anything that can be rolled: a dated row with named numeric metrics.
pub trait Observation {
    fn game_id(&self) -> &str;
    fn date(&self) -> NaiveDate;
    fn metric(&self, name: &str) -> Option<f64>;
}

impl Observation for EntityStatRow {
    fn game_id(&self) -> &str {
        &self.game_id
    }
    fn date(&self) -> NaiveDate {
        self.date
    }
    fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().flatten()
    }
}

/// How rows that share a date with the current row are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameDayPolicy {
    /// The window ends before the first row dated on the current date, so a
    /// double-header never sees its sibling.
    #[default]
    StrictlyEarlier,
    /// Pure positional window over the `(date, game_id)` order.
    Sequential,
}

pub fn rolling_column_name(metric: &str, window: usize) -> String {
    format!("{}_roll_avg_{}g", metric, window)
}

/// Rolling means for one metric, keyed by game id then window size.
///
/// The sequence must already be ordered by `(date, game_id)`; anything else
/// would let later games leak into earlier windows, so it is rejected.
pub fn compute_rolling<T: Observation>(
    sequence: &[T],
    metric: &str,
    windows: &[usize],
    policy: SameDayPolicy,
) -> Result<BTreeMap<String, BTreeMap<usize, Option<f64>>>> {
    check_order(sequence)?;

    let n = sequence.len();
    let mut sums = Vec::with_capacity(n + 1);
    let mut counts = Vec::with_capacity(n + 1);
    sums.push(0.0);
    counts.push(0usize);
    for row in sequence {
        let (s, c) = (sums[sums.len() - 1], counts[counts.len() - 1]);
        match row.metric(metric) {
            Some(v) => {
                sums.push(s + v);
                counts.push(c + 1);
            }
            None => {
                sums.push(s);
                counts.push(c);
            }
        }
    }

    let mut out = BTreeMap::new();
    let mut day_start = 0;
    for (i, row) in sequence.iter().enumerate() {
        if i > 0 && sequence[i - 1].date() != row.date() {
            day_start = i;
        }
        let end = match policy {
            SameDayPolicy::StrictlyEarlier => day_start,
            SameDayPolicy::Sequential => i,
        };

        let values = windows
            .iter()
            .map(|&w| {
                let start = end.saturating_sub(w);
                let count = counts[end] - counts[start];
                let mean = (count > 0).then(|| (sums[end] - sums[start]) / count as f64);
                (w, mean)
            })
            .collect();
        out.insert(row.game_id().to_string(), values);
    }
    Ok(out)
}

fn check_order<T: Observation>(sequence: &[T]) -> Result<()> {
    for pair in sequence.windows(2) {
        if (pair[0].date(), pair[0].game_id()) >= (pair[1].date(), pair[1].game_id()) {
            return Err(PipelineError::Invariant(format!(
                "rolling input not strictly ordered at game {} ({})",
                pair[1].game_id(),
                pair[1].date()
            )));
        }
    }
    Ok(())
}

/// Rolling features for several metrics over one entity's sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RollingFeatures {
    /// `<metric>_roll_avg_<w>g`, metric-major
    pub columns: Vec<String>,
    /// game id → values aligned with `columns`
    pub rows: BTreeMap<String, Vec<Option<f64>>>,
}

impl RollingFeatures {
    pub fn value(&self, game_id: &str, column: &str) -> Option<f64> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(game_id).and_then(|row| row[idx])
    }
}

pub fn feature_columns(metrics: &[String], windows: &[usize]) -> Vec<String> {
    metrics
        .iter()
        .flat_map(|m| windows.iter().map(move |&w| rolling_column_name(m, w)))
        .collect()
}

pub fn compute_rolling_features<T: Observation>(
    sequence: &[T],
    metrics: &[String],
    windows: &[usize],
    policy: SameDayPolicy,
) -> Result<RollingFeatures> {
    let columns = feature_columns(metrics, windows);
    let mut rows: BTreeMap<String, Vec<Option<f64>>> = sequence
        .iter()
        .map(|r| (r.game_id().to_string(), Vec::with_capacity(columns.len())))
        .collect();

    for metric in metrics {
        for (game_id, by_window) in compute_rolling(sequence, metric, windows, policy)? {
            if let Some(row) = rows.get_mut(&game_id) {
                row.extend(windows.iter().map(|w| by_window.get(w).copied().flatten()));
            }
        }
    }
    Ok(RollingFeatures { columns, rows })
}
