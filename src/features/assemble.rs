//! Dataset assembly: left-join feature layers onto the base table, then
//! impute once.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::features::table::{Cell, ColumnKind, ColumnRole, ColumnSpec, FeatureTable, LayerResult, LayerUnavailable};

/// What to do when a layer brings a column name the table already has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    Reject,
    /// Prefix the incoming column with `<layer>_`
    #[default]
    Rename,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedLayer {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeReport {
    pub base_rows: usize,
    pub layers_merged: Vec<String>,
    pub layers_skipped: Vec<SkippedLayer>,
    /// new name → original name
    pub renamed_columns: BTreeMap<String, String>,
    /// Base rows that found a match, per merged layer
    pub matched_rows: BTreeMap<String, usize>,
}

fn resolve_names(
    table: &FeatureTable,
    layer_name: &str,
    columns: &[ColumnSpec],
    policy: CollisionPolicy,
    report: &mut MergeReport,
) -> Result<Vec<ColumnSpec>> {
    let mut taken: HashSet<String> = table.columns.iter().map(|c| c.name.clone()).collect();
    let mut resolved = Vec::with_capacity(columns.len());
    let mut renamed = Vec::new();
    for col in columns {
        let mut spec = col.clone();
        if taken.contains(&spec.name) {
            let candidate = format!("{}_{}", layer_name, col.name);
            if policy == CollisionPolicy::Reject || taken.contains(&candidate) {
                return Err(PipelineError::Schema(format!(
                    "layer {} column {} collides with an existing column",
                    layer_name, col.name
                )));
            }
            warn!("Layer {} column {} collides; renamed to {}", layer_name, col.name, candidate);
            renamed.push((candidate.clone(), col.name.clone()));
            spec.name = candidate;
        }
        taken.insert(spec.name.clone());
        resolved.push(spec);
    }
    report.renamed_columns.extend(renamed);
    Ok(resolved)
}

/// Left-join every layer onto `base`, in order. Unavailable layers still
/// contribute their declared columns, left empty. The base row count never
/// changes.
pub fn merge_layers(
    mut base: FeatureTable,
    layers: Vec<LayerResult>,
    policy: CollisionPolicy,
) -> Result<(FeatureTable, MergeReport)> {
    let base_rows = base.len();
    let mut report = MergeReport {
        base_rows,
        ..Default::default()
    };

    for layer in layers {
        let layer = layer.and_then(|layer| {
            let key_cols: Option<Vec<usize>> =
                layer.key.base_columns().iter().map(|c| base.column_index(c)).collect();
            match key_cols {
                Some(cols) => Ok((layer, cols)),
                None => Err(LayerUnavailable {
                    reason: format!("base table has no {} key", layer.key),
                    name: layer.name,
                    columns: layer.columns,
                }),
            }
        });

        match layer {
            Ok((layer, key_cols)) => {
                let columns = resolve_names(&base, &layer.name, &layer.columns, policy, &mut report)?;
                let mut values: Vec<Vec<Cell>> = vec![Vec::with_capacity(base_rows); columns.len()];
                let mut matched = 0;
                for row in 0..base_rows {
                    let hit = base.key_of(row, &key_cols).and_then(|key| layer.get(&key));
                    if hit.is_some() {
                        matched += 1;
                    }
                    for (i, col) in columns.iter().enumerate() {
                        let cell = hit.map_or_else(|| Cell::missing(&col.kind), |cells| cells[i].clone());
                        values[i].push(cell);
                    }
                }
                for (spec, column) in columns.into_iter().zip(values) {
                    base.push_column(spec, column)?;
                }
                info!("Merged layer {} ({}/{} rows matched)", layer.name, matched, base_rows);
                report.matched_rows.insert(layer.name.clone(), matched);
                report.layers_merged.push(layer.name);
            }
            Err(missing) => {
                warn!("Skipping {}; inserting {} placeholder columns", missing, missing.columns.len());
                let columns = resolve_names(&base, &missing.name, &missing.columns, policy, &mut report)?;
                for spec in columns {
                    let empty = vec![Cell::missing(&spec.kind); base_rows];
                    base.push_column(spec, empty)?;
                }
                report.layers_skipped.push(SkippedLayer {
                    name: missing.name,
                    reason: missing.reason,
                });
            }
        }

        if base.len() != base_rows {
            return Err(PipelineError::Invariant(format!(
                "merge changed the row count from {} to {}",
                base_rows,
                base.len()
            )));
        }
    }
    Ok((base, report))
}

/// Per-column override of the default imputation strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ImputeRule {
    Median,
    Constant { value: f64 },
    Label { value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImputationSettings {
    /// Fill for missing categorical values
    pub sentinel: String,
    pub overrides: BTreeMap<String, ImputeRule>,
    /// Neutral fills for market columns that do not declare one
    pub market_defaults: BTreeMap<String, f64>,
    /// Neutral fill when neither the column nor `market_defaults` has one.
    /// Unset by default, so every market column has to resolve one.
    pub default_market_value: Option<f64>,
}

impl Default for ImputationSettings {
    fn default() -> Self {
        ImputationSettings {
            sentinel: "unknown".into(),
            overrides: BTreeMap::new(),
            market_defaults: BTreeMap::new(),
            default_market_value: None,
        }
    }
}

impl ImputationSettings {
    /// The declared neutral, then `market_defaults`, then the global value.
    pub fn market_neutral(&self, column: &str, declared: Option<f64>) -> Option<f64> {
        declared
            .or_else(|| self.market_defaults.get(column).copied())
            .or(self.default_market_value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnFill {
    pub strategy: String,
    pub value: String,
    pub filled: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImputationReport {
    pub columns: BTreeMap<String, ColumnFill>,
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// Fill missing feature cells. Identifiers, outcomes and targets are left
/// alone.
pub fn impute(table: &mut FeatureTable, settings: &ImputationSettings) -> Result<ImputationReport> {
    let mut report = ImputationReport::default();

    for col in 0..table.columns.len() {
        let spec = table.columns[col].clone();
        if spec.role != ColumnRole::Feature {
            continue;
        }
        let missing = table.rows.iter().filter(|r| r[col].is_missing()).count();

        let (strategy, fill) = match (settings.overrides.get(&spec.name), &spec.kind) {
            (Some(ImputeRule::Label { value }), ColumnKind::Categorical) => ("label", Cell::text(value.clone())),
            (Some(ImputeRule::Label { .. }), _) | (Some(ImputeRule::Median), ColumnKind::Categorical) => {
                return Err(PipelineError::Config(format!(
                    "imputation override for {} does not fit its column type",
                    spec.name
                )));
            }
            (Some(ImputeRule::Constant { value }), ColumnKind::Categorical) => {
                ("constant", Cell::text(value.to_string()))
            }
            (Some(ImputeRule::Constant { value }), _) => ("constant", Cell::Num(Some(*value))),
            (None, ColumnKind::Categorical) => ("sentinel", Cell::text(settings.sentinel.clone())),
            (None, ColumnKind::Market { neutral }) => match settings.market_neutral(&spec.name, *neutral) {
                Some(value) => ("market_neutral", Cell::Num(Some(value))),
                None => {
                    return Err(PipelineError::Config(format!(
                        "market column {} has no neutral value; declare one or set market_defaults",
                        spec.name
                    )));
                }
            },
            (Some(ImputeRule::Median), _) | (None, ColumnKind::Numeric) => {
                let mut present: Vec<f64> = table.rows.iter().filter_map(|r| r[col].as_f64()).collect();
                match median(&mut present) {
                    Some(m) => ("median", Cell::Num(Some(m))),
                    None => {
                        if missing > 0 {
                            warn!("Column {} has no values; filling with 0", spec.name);
                        }
                        ("zero", Cell::Num(Some(0.0)))
                    }
                }
            }
        };

        if missing == 0 {
            continue;
        }
        for row in table.rows.iter_mut() {
            if row[col].is_missing() {
                row[col] = fill.clone();
            }
        }
        report.columns.insert(
            spec.name.clone(),
            ColumnFill {
                strategy: strategy.to_string(),
                value: fill.to_field(),
                filled: missing,
            },
        );
    }

    let total: usize = report.columns.values().map(|c| c.filled).sum();
    info!("Imputed {} cells across {} columns", total, report.columns.len());
    Ok(report)
}
