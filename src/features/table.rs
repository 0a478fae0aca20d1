//! In-memory feature table and the layers merged into it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Num(Option<f64>),
    Text(Option<String>),
}

impl Cell {
    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Num(None) | Cell::Text(None))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Num(v) => *v,
            Cell::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(v) => v.as_deref(),
            Cell::Num(_) => None,
        }
    }

    /// Empty cell of the storage type for `kind`.
    pub fn missing(kind: &ColumnKind) -> Cell {
        match kind {
            ColumnKind::Categorical => Cell::Text(None),
            ColumnKind::Numeric | ColumnKind::Market { .. } => Cell::Num(None),
        }
    }

    pub fn text(value: impl Into<String>) -> Cell {
        Cell::Text(Some(value.into()))
    }

    /// CSV rendering; missing values are empty fields.
    pub fn to_field(&self) -> String {
        match self {
            Cell::Num(Some(v)) => v.to_string(),
            Cell::Text(Some(s)) => s.clone(),
            Cell::Num(None) | Cell::Text(None) => String::new(),
        }
    }
}

impl From<Option<f64>> for Cell {
    fn from(value: Option<f64>) -> Self {
        Cell::Num(value)
    }
}

impl From<Option<i64>> for Cell {
    fn from(value: Option<i64>) -> Self {
        Cell::Num(value.map(|v| v as f64))
    }
}

/// Value type of a column, which also selects its imputation strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Categorical,
    /// Quote tied to an external market (odds, lines). Filled with a neutral
    /// default instead of a statistic.
    Market {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        neutral: Option<f64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    Identifier,
    /// Realized result of the row's own game; never a model input
    Outcome,
    Feature,
    Target,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    pub role: ColumnRole,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind, role: ColumnRole) -> Self {
        ColumnSpec {
            name: name.into(),
            kind,
            role,
        }
    }

    pub fn identifier(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Categorical, ColumnRole::Identifier)
    }

    pub fn numeric(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Numeric, ColumnRole::Feature)
    }

    pub fn categorical(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Categorical, ColumnRole::Feature)
    }

    pub fn outcome(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Numeric, ColumnRole::Outcome)
    }
}

/// Row-major table with a fixed, ordered column set.
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Vec<Cell>>,
}

impl FeatureTable {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        FeatureTable {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(PipelineError::Invariant(format!(
                "row has {} cells for {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Append a column; `values` must cover every row.
    pub fn push_column(&mut self, spec: ColumnSpec, values: Vec<Cell>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(PipelineError::Invariant(format!(
                "column {} has {} values for {} rows",
                spec.name,
                values.len(),
                self.rows.len()
            )));
        }
        if self.has_column(&spec.name) {
            return Err(PipelineError::Invariant(format!("column {} already present", spec.name)));
        }
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        self.columns.push(spec);
        Ok(())
    }

    pub fn num(&self, row: usize, col: usize) -> Option<f64> {
        self.rows.get(row)?.get(col)?.as_f64()
    }

    pub fn text(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_str()
    }

    /// Join key of a row, `None` when a key part is missing.
    pub fn key_of(&self, row: usize, key_cols: &[usize]) -> Option<Vec<String>> {
        key_cols
            .iter()
            .map(|&c| self.text(row, c).map(str::to_string))
            .collect()
    }
}

/// How a layer's rows are matched against the base table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKey {
    Game,
    GameEntity,
    HomeTeam,
    AwayTeam,
}

impl JoinKey {
    /// Base table columns the key is read from.
    pub fn base_columns(&self) -> &'static [&'static str] {
        match self {
            JoinKey::Game => &["game_id"],
            JoinKey::GameEntity => &["game_id", "entity_id"],
            JoinKey::HomeTeam => &["home_team_id"],
            JoinKey::AwayTeam => &["away_team_id"],
        }
    }

    pub fn arity(&self) -> usize {
        self.base_columns().len()
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_columns().join("+"))
    }
}

/// A set of feature columns keyed for a left join onto the base table.
#[derive(Debug, Clone)]
pub struct FeatureLayer {
    pub name: String,
    pub key: JoinKey,
    pub columns: Vec<ColumnSpec>,
    pub rows: HashMap<Vec<String>, Vec<Cell>>,
    /// Rows that repeated an existing key and were ignored
    pub duplicate_keys: usize,
}

impl FeatureLayer {
    pub fn new(name: impl Into<String>, key: JoinKey, columns: Vec<ColumnSpec>) -> Self {
        FeatureLayer {
            name: name.into(),
            key,
            columns,
            rows: HashMap::new(),
            duplicate_keys: 0,
        }
    }

    /// Insert a row; the first row for a key wins so the join stays
    /// one-to-one. Returns whether the row was kept.
    pub fn insert(&mut self, key: Vec<String>, values: Vec<Cell>) -> Result<bool> {
        if values.len() != self.columns.len() || key.len() != self.key.arity() {
            return Err(PipelineError::Invariant(format!(
                "layer {} row shape does not match its declaration",
                self.name
            )));
        }
        if self.rows.contains_key(&key) {
            self.duplicate_keys += 1;
            return Ok(false);
        }
        self.rows.insert(key, values);
        Ok(true)
    }

    pub fn get(&self, key: &[String]) -> Option<&Vec<Cell>> {
        self.rows.get(key)
    }
}

/// A layer that could not be produced. Its columns still appear in the
/// output, empty until imputation.
#[derive(Debug, Clone)]
pub struct LayerUnavailable {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub reason: String,
}

impl fmt::Display for LayerUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer {} unavailable: {}", self.name, self.reason)
    }
}

pub type LayerResult = std::result::Result<FeatureLayer, LayerUnavailable>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_row_per_key_wins() {
        let mut layer = FeatureLayer::new("park", JoinKey::HomeTeam, vec![ColumnSpec::numeric("factor")]);
        assert!(layer.insert(vec!["T1".into()], vec![Cell::Num(Some(1.1))]).unwrap());
        assert!(!layer.insert(vec!["T1".into()], vec![Cell::Num(Some(0.9))]).unwrap());
        assert_eq!(layer.get(&["T1".to_string()]), Some(&vec![Cell::Num(Some(1.1))]));
        assert_eq!(layer.duplicate_keys, 1);
    }

    #[test]
    fn push_column_checks_length() {
        let mut table = FeatureTable::new(vec![ColumnSpec::identifier("game_id")]);
        table.push_row(vec![Cell::text("g1")]).unwrap();
        assert!(table.push_column(ColumnSpec::numeric("x"), vec![]).is_err());
        table
            .push_column(ColumnSpec::numeric("x"), vec![Cell::Num(Some(2.0))])
            .unwrap();
        assert_eq!(table.num(0, 1), Some(2.0));
        assert_eq!(table.key_of(0, &[0]), Some(vec!["g1".to_string()]));
    }

    #[test]
    fn market_kind_reads_neutral_from_json() {
        let kind: ColumnKind = serde_json::from_str(r#"{"kind": "market", "neutral": 100}"#).unwrap();
        assert_eq!(kind, ColumnKind::Market { neutral: Some(100.0) });
        let kind: ColumnKind = serde_json::from_str(r#"{"kind": "numeric"}"#).unwrap();
        assert_eq!(kind, ColumnKind::Numeric);
        assert_eq!(Cell::Num(Some(15.0)).to_field(), "15");
    }
}
