use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::RowIssue;
use crate::features::season::SeasonPhase;

/// A single cell exactly as the store returned it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl RawValue {
    /// Text content, with empty strings treated as null.
    pub fn as_text(&self) -> Option<String> {
        match self {
            RawValue::Null => None,
            RawValue::Integer(v) => Some(v.to_string()),
            RawValue::Real(v) => Some(v.to_string()),
            RawValue::Text(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_string())
            }
        }
    }

    /// Numeric content. Nulls and blank strings are `Ok(None)`; text that
    /// does not parse is a row-level issue.
    pub fn as_number(&self, field: &str) -> Result<Option<f64>, RowIssue> {
        let value = match self {
            RawValue::Null => return Ok(None),
            RawValue::Integer(v) => *v as f64,
            RawValue::Real(v) => *v,
            RawValue::Text(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return Ok(None);
                }
                s.parse::<f64>().map_err(|_| RowIssue::MalformedNumber {
                    field: field.to_string(),
                    raw: s.to_string(),
                })?
            }
        };
        if value.is_finite() {
            Ok(Some(value))
        } else {
            Err(RowIssue::MalformedNumber {
                field: field.to_string(),
                raw: value.to_string(),
            })
        }
    }
}

impl From<rusqlite::types::ValueRef<'_>> for RawValue {
    fn from(value: rusqlite::types::ValueRef<'_>) -> Self {
        use rusqlite::types::ValueRef;
        match value {
            ValueRef::Null => RawValue::Null,
            ValueRef::Integer(v) => RawValue::Integer(v),
            ValueRef::Real(v) => RawValue::Real(v),
            ValueRef::Text(bytes) => RawValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(_) => RawValue::Null,
        }
    }
}

/// Game row as deposited by the collection layer, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawGame {
    /// Insertion order in the store (first-seen order)
    pub seq: i64,
    pub game_id: Option<String>,
    pub date: Option<String>,
    pub home_entity_id: Option<String>,
    pub away_entity_id: Option<String>,
    pub home_score: RawValue,
    pub away_score: RawValue,
    pub season_label: Option<String>,
    /// Collection strategy that produced the row
    pub source: Option<String>,
}

/// Per-entity box-score row as deposited by the collection layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawStatRow {
    pub seq: i64,
    pub entity_id: Option<String>,
    pub game_id: Option<String>,
    pub team_id: Option<String>,
    pub source: Option<String>,
    pub metrics: BTreeMap<String, RawValue>,
}

/// A validated game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    pub game_id: String,
    pub date: NaiveDate,
    pub home_entity_id: String,
    pub away_entity_id: String,
    /// Null until the game is played
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
    pub season_label: Option<String>,
    pub phase: SeasonPhase,
    pub source: String,
    pub seq: i64,
}

impl GameEvent {
    pub fn is_played(&self) -> bool {
        self.home_score.is_some() && self.away_score.is_some()
    }

    /// Whether the given team was at home, `None` if it did not play.
    pub fn is_home(&self, team: &str) -> Option<bool> {
        if team == self.home_entity_id {
            Some(true)
        } else if team == self.away_entity_id {
            Some(false)
        } else {
            None
        }
    }

    pub fn opponent(&self, team: &str) -> Option<&str> {
        match self.is_home(team)? {
            true => Some(&self.away_entity_id),
            false => Some(&self.home_entity_id),
        }
    }
}

/// A validated per-entity box-score row, dated by its game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStatRow {
    pub entity_id: String,
    pub game_id: String,
    pub date: NaiveDate,
    pub team_id: Option<String>,
    pub source: String,
    pub seq: i64,
    pub metrics: BTreeMap<String, Option<f64>>,
}
