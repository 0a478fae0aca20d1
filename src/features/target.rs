//! Prediction labels.
//!
//! Labels read only retrospective values (final scores, realized metrics)
//! and rolling features that already exclude the game itself. A row whose
//! label is undefined is dropped, never imputed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::features::rolling::rolling_column_name;
use crate::features::table::{Cell, ColumnKind, ColumnRole, ColumnSpec, FeatureTable};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetSpec {
    /// 1 when the home side outscored the away side; ties are 0
    HomeWin,
    /// 1 when the entity's realized `metric` beat its own trailing average
    /// over the same `window`
    OverTrailingAverage { metric: String, window: usize },
}

impl TargetSpec {
    pub fn column_name(&self) -> String {
        match self {
            TargetSpec::HomeWin => "home_win".to_string(),
            TargetSpec::OverTrailingAverage { metric, window } => format!("{}_over_avg_{}g", metric, window),
        }
    }

    /// Columns the label is computed from.
    fn operands(&self) -> (String, String) {
        match self {
            TargetSpec::HomeWin => ("home_score".into(), "away_score".into()),
            TargetSpec::OverTrailingAverage { metric, window } => {
                (metric.clone(), rolling_column_name(metric, *window))
            }
        }
    }

    fn label(&self, left: f64, right: f64) -> f64 {
        // Both kinds reduce to "left strictly above right".
        if left > right {
            1.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TargetReport {
    pub rows_before: usize,
    pub rows_after: usize,
    /// Rows whose label was undefined, per target
    pub undefined: BTreeMap<String, usize>,
}

/// Append one column per target and drop rows where any label is undefined.
pub fn derive_targets(table: &mut FeatureTable, targets: &[TargetSpec]) -> Result<TargetReport> {
    let mut report = TargetReport {
        rows_before: table.len(),
        ..Default::default()
    };
    let mut keep = vec![true; table.len()];

    for target in targets {
        let (left, right) = target.operands();
        let lookup = |name: &str| {
            table.column_index(name).ok_or_else(|| {
                PipelineError::Schema(format!("target {} needs column {}", target.column_name(), name))
            })
        };
        let (li, ri) = (lookup(&left)?, lookup(&right)?);

        let mut undefined = 0;
        let values: Vec<Cell> = (0..table.len())
            .map(|row| match (table.num(row, li), table.num(row, ri)) {
                (Some(l), Some(r)) => Cell::Num(Some(target.label(l, r))),
                _ => {
                    undefined += 1;
                    keep[row] = false;
                    Cell::Num(None)
                }
            })
            .collect();

        report.undefined.insert(target.column_name(), undefined);
        table.push_column(
            ColumnSpec::new(target.column_name(), ColumnKind::Numeric, ColumnRole::Target),
            values,
        )?;
    }

    let mut flags = keep.into_iter();
    table.rows.retain(|_| flags.next().unwrap_or(false));
    report.rows_after = table.len();
    info!(
        "Derived {} targets; kept {} of {} rows",
        targets.len(),
        report.rows_after,
        report.rows_before
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[(Option<f64>, Option<f64>)], cols: (&str, &str)) -> FeatureTable {
        let mut t = FeatureTable::new(vec![ColumnSpec::outcome(cols.0), ColumnSpec::numeric(cols.1)]);
        for (a, b) in rows {
            t.push_row(vec![Cell::Num(*a), Cell::Num(*b)]).unwrap();
        }
        t
    }

    #[test]
    fn home_win_counts_ties_as_losses() {
        let mut t = table(
            &[(Some(100.0), Some(90.0)), (Some(90.0), Some(90.0)), (Some(80.0), Some(95.0)), (None, None)],
            ("home_score", "away_score"),
        );
        let report = derive_targets(&mut t, &[TargetSpec::HomeWin]).unwrap();
        let col = t.column_index("home_win").unwrap();
        let labels: Vec<f64> = (0..t.len()).map(|r| t.num(r, col).unwrap()).collect();
        assert_eq!(labels, vec![1.0, 0.0, 0.0]);
        assert_eq!(report.undefined["home_win"], 1);
        assert_eq!(report.rows_after, 3);
    }

    #[test]
    fn over_average_drops_rows_without_a_baseline() {
        let mut t = table(
            &[(Some(10.0), None), (Some(20.0), Some(10.0)), (Some(12.0), Some(15.0))],
            ("points", "points_roll_avg_2g"),
        );
        let target = TargetSpec::OverTrailingAverage {
            metric: "points".into(),
            window: 2,
        };
        assert_eq!(target.column_name(), "points_over_avg_2g");
        derive_targets(&mut t, &[target]).unwrap();
        assert_eq!(t.len(), 2);
        let col = t.column_index("points_over_avg_2g").unwrap();
        assert_eq!(t.num(0, col), Some(1.0));
        assert_eq!(t.num(1, col), Some(0.0));
        assert_eq!(t.columns[col].role, ColumnRole::Target);
    }

    #[test]
    fn missing_operand_column_is_a_schema_error() {
        let mut t = table(&[(Some(1.0), Some(2.0))], ("points", "rebounds"));
        let target = TargetSpec::OverTrailingAverage {
            metric: "points".into(),
            window: 5,
        };
        assert!(matches!(derive_targets(&mut t, &[target]), Err(PipelineError::Schema(_))));
    }

    #[test]
    fn target_specs_read_from_json() {
        let specs: Vec<TargetSpec> =
            serde_json::from_str(r#"[{"kind": "home_win"}, {"kind": "over_trailing_average", "metric": "points", "window": 5}]"#)
                .unwrap();
        assert_eq!(specs[0], TargetSpec::HomeWin);
        assert_eq!(specs[1].column_name(), "points_over_avg_5g");
    }
}
