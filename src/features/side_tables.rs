//! Optional CSV side tables (park factors, weather, odds, ...).
//!
//! A side table that is missing or unreadable never aborts a run: loading
//! yields `LayerUnavailable` carrying the declared columns, which the
//! assembler turns into placeholder columns.

use csv::{ReaderBuilder, StringRecord, Trim};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::features::table::{Cell, ColumnKind, ColumnRole, ColumnSpec, FeatureLayer, JoinKey, LayerResult, LayerUnavailable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideTableColumn {
    pub name: String,
    #[serde(flatten)]
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideTableSpec {
    pub name: String,
    pub path: PathBuf,
    pub join: JoinKey,
    /// CSV columns holding the join key, in `JoinKey::base_columns` order
    pub key_columns: Vec<String>,
    pub columns: Vec<SideTableColumn>,
    /// Prefix for output column names
    #[serde(default)]
    pub namespace: Option<String>,
}

impl SideTableSpec {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Config("side table without a name".into()));
        }
        if self.key_columns.len() != self.join.arity() {
            return Err(PipelineError::Config(format!(
                "side table {} joins on {} but declares {} key columns",
                self.name,
                self.join,
                self.key_columns.len()
            )));
        }
        if self.columns.is_empty() {
            return Err(PipelineError::Config(format!("side table {} declares no columns", self.name)));
        }
        let mut seen = HashSet::new();
        for col in &self.columns {
            if self.key_columns.contains(&col.name) {
                return Err(PipelineError::Config(format!(
                    "side table {} uses key column {} as a value column",
                    self.name, col.name
                )));
            }
            if !seen.insert(col.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "side table {} declares column {} twice",
                    self.name, col.name
                )));
            }
        }
        Ok(())
    }

    fn output_name(&self, column: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}_{}", ns, column),
            None => column.to_string(),
        }
    }

    /// Columns this table contributes, whether or not it loads.
    pub fn output_columns(&self) -> Vec<ColumnSpec> {
        self.columns
            .iter()
            .map(|c| ColumnSpec::new(self.output_name(&c.name), c.kind.clone(), ColumnRole::Feature))
            .collect()
    }

    fn unavailable(&self, reason: impl Into<String>) -> LayerUnavailable {
        LayerUnavailable {
            name: self.name.clone(),
            columns: self.output_columns(),
            reason: reason.into(),
        }
    }
}

struct ColumnIndices {
    keys: Vec<usize>,
    values: Vec<usize>,
}

impl ColumnIndices {
    fn from_headers(headers: &StringRecord, spec: &SideTableSpec) -> std::result::Result<Self, String> {
        let lookup = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| format!("missing csv column: {}", name))
        };
        Ok(ColumnIndices {
            keys: spec.key_columns.iter().map(|k| lookup(k.as_str())).collect::<std::result::Result<_, _>>()?,
            values: spec.columns.iter().map(|c| lookup(c.name.as_str())).collect::<std::result::Result<_, _>>()?,
        })
    }
}

fn parse_cell(raw: &str, kind: &ColumnKind) -> std::result::Result<Cell, ()> {
    if raw.is_empty() {
        return Ok(Cell::missing(kind));
    }
    match kind {
        ColumnKind::Categorical => Ok(Cell::text(raw)),
        ColumnKind::Numeric | ColumnKind::Market { .. } => {
            // Odds are commonly written with an explicit sign, e.g. "+150".
            let v: f64 = raw.trim_start_matches('+').parse().map_err(|_| ())?;
            if v.is_finite() {
                Ok(Cell::Num(Some(v)))
            } else {
                Err(())
            }
        }
    }
}

/// Read a side table into a layer keyed by its declared join.
pub fn load_side_table(spec: &SideTableSpec) -> LayerResult {
    let mut reader = match ReaderBuilder::new().trim(Trim::All).from_path(&spec.path) {
        Ok(reader) => reader,
        Err(e) => return Err(spec.unavailable(format!("cannot open {}: {}", spec.path.display(), e))),
    };
    let headers = match reader.headers() {
        Ok(h) => h.clone(),
        Err(e) => return Err(spec.unavailable(format!("cannot read header: {}", e))),
    };
    let indices = ColumnIndices::from_headers(&headers, spec).map_err(|reason| spec.unavailable(reason))?;

    let columns = spec.output_columns();
    let mut layer = FeatureLayer::new(spec.name.clone(), spec.join, columns.clone());
    let mut malformed = 0usize;
    let mut keyless = 0usize;

    for (line, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                return Err(spec.unavailable(format!("unreadable record {}: {}", line + 1, e)));
            }
        };
        let key: Option<Vec<String>> = indices
            .keys
            .iter()
            .map(|&i| record.get(i).filter(|v| !v.is_empty()).map(str::to_string))
            .collect();
        let Some(key) = key else {
            keyless += 1;
            continue;
        };

        let mut values = Vec::with_capacity(columns.len());
        for (&idx, spec_col) in indices.values.iter().zip(&spec.columns) {
            let raw = record.get(idx).unwrap_or("");
            match parse_cell(raw, &spec_col.kind) {
                Ok(cell) => values.push(cell),
                Err(()) => {
                    malformed += 1;
                    warn!(
                        "Side table {} line {}: malformed {} value {:?}, left empty",
                        spec.name,
                        line + 1,
                        spec_col.name,
                        raw
                    );
                    values.push(Cell::missing(&spec_col.kind));
                }
            }
        }
        if let Err(e) = layer.insert(key, values) {
            return Err(spec.unavailable(e.to_string()));
        }
    }

    if layer.duplicate_keys > 0 {
        warn!(
            "Side table {}: {} rows repeated a key; kept the first of each",
            spec.name, layer.duplicate_keys
        );
    }
    if keyless > 0 {
        warn!("Side table {}: skipped {} rows without a key", spec.name, keyless);
    }
    info!(
        "Loaded side table {} ({} keys, {} malformed values)",
        spec.name,
        layer.rows.len(),
        malformed
    );
    Ok(layer)
}
