//! Season segmentation by calendar-date ranges.
//!
//! Leagues fix their phase dates per year, so the ranges come from
//! configuration and are never inferred from the data. A range covers
//! `[start, end)`: a game on a boundary date belongs to the phase that
//! starts on that date.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeasonPhase {
    PreSeason,
    RegularSeason,
    Playoffs,
    Other,
}

impl SeasonPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeasonPhase::PreSeason => "pre_season",
            SeasonPhase::RegularSeason => "regular_season",
            SeasonPhase::Playoffs => "playoffs",
            SeasonPhase::Other => "other",
        }
    }
}

impl fmt::Display for SeasonPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured phase window, inclusive of `start`, exclusive of `end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRange {
    pub phase: SeasonPhase,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl PhaseRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }
}

#[derive(Debug, Clone, Default)]
pub struct SeasonCalendar {
    ranges: Vec<PhaseRange>,
}

impl SeasonCalendar {
    /// Build a calendar, rejecting inverted or overlapping ranges so no date
    /// can be classified twice.
    pub fn new(ranges: &[PhaseRange]) -> Result<Self> {
        let mut ranges = ranges.to_vec();
        ranges.sort_by_key(|r| (r.start, r.end));
        for r in &ranges {
            if r.start >= r.end {
                return Err(PipelineError::Config(format!(
                    "season range {} {}..{} is empty or inverted",
                    r.phase, r.start, r.end
                )));
            }
        }
        for pair in ranges.windows(2) {
            if pair[1].start < pair[0].end {
                return Err(PipelineError::Config(format!(
                    "season ranges overlap: {} {}..{} and {} {}..{}",
                    pair[0].phase, pair[0].start, pair[0].end, pair[1].phase, pair[1].start, pair[1].end
                )));
            }
        }
        Ok(SeasonCalendar { ranges })
    }

    pub fn classify(&self, date: NaiveDate) -> SeasonPhase {
        // Sorted and disjoint: the last range starting on or before `date`
        // is the only candidate.
        let idx = self.ranges.partition_point(|r| r.start <= date);
        match idx.checked_sub(1).map(|i| &self.ranges[i]) {
            Some(range) if range.contains(date) => range.phase,
            _ => SeasonPhase::Other,
        }
    }
}
