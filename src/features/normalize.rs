//! Entity event normalization.
//!
//! Turns raw game / box-score rows from several collection strategies into
//! validated, deduplicated records, and groups entity rows into sequences
//! ordered by `(date, game_id)`.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::db::models::{EntityStatRow, GameEvent, RawGame, RawStatRow, RawValue};
use crate::error::{PipelineError, Result, RowIssue};
use crate::features::season::SeasonCalendar;

const DEFAULT_SOURCE: &str = "unknown";

/// Which duplicate wins when two rows share a key and an equally
/// authoritative source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    KeepFirst,
    #[default]
    KeepLast,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupPolicy {
    /// Collection sources, most authoritative first. Unlisted sources rank
    /// below every listed one.
    pub source_priority: Vec<String>,
    pub on_tie: TieBreak,
}

impl DedupPolicy {
    fn rank(&self, source: &str) -> usize {
        self.source_priority
            .iter()
            .position(|s| s.eq_ignore_ascii_case(source))
            .unwrap_or(self.source_priority.len())
    }

    /// Whether `candidate` should replace `incumbent`. Depends only on the
    /// records, never on arrival order, so the result is reproducible.
    pub fn prefers<T: Provenance>(&self, candidate: &T, incumbent: &T) -> bool {
        let (rc, ri) = (self.rank(candidate.source()), self.rank(incumbent.source()));
        if rc != ri {
            return rc < ri;
        }
        // `Greater` means the candidate wins. Equal seq falls through to the
        // source name and then the record contents.
        let by_seq = match self.on_tie {
            TieBreak::KeepFirst => incumbent.seq().cmp(&candidate.seq()),
            TieBreak::KeepLast => candidate.seq().cmp(&incumbent.seq()),
        };
        by_seq
            .then_with(|| incumbent.source().cmp(candidate.source()))
            .then_with(|| incumbent.content_cmp(candidate))
            == Ordering::Greater
    }
}

/// Where a record came from and when it was inserted.
pub trait Provenance {
    fn source(&self) -> &str;
    fn seq(&self) -> i64;
    /// Total order over the record's payload, the last resort between
    /// duplicates sharing source and seq.
    fn content_cmp(&self, other: &Self) -> Ordering;
}

impl Provenance for GameEvent {
    fn source(&self) -> &str {
        &self.source
    }
    fn seq(&self) -> i64 {
        self.seq
    }
    fn content_cmp(&self, other: &Self) -> Ordering {
        (
            self.date,
            &self.home_entity_id,
            &self.away_entity_id,
            self.home_score,
            self.away_score,
            &self.season_label,
        )
            .cmp(&(
                other.date,
                &other.home_entity_id,
                &other.away_entity_id,
                other.home_score,
                other.away_score,
                &other.season_label,
            ))
    }
}

impl Provenance for EntityStatRow {
    fn source(&self) -> &str {
        &self.source
    }
    fn seq(&self) -> i64 {
        self.seq
    }
    fn content_cmp(&self, other: &Self) -> Ordering {
        (self.date, &self.team_id)
            .cmp(&(other.date, &other.team_id))
            .then_with(|| cmp_metrics(&self.metrics, &other.metrics))
    }
}

fn cmp_metrics(a: &BTreeMap<String, Option<f64>>, b: &BTreeMap<String, Option<f64>>) -> Ordering {
    for ((ka, va), (kb, vb)) in a.iter().zip(b) {
        let ord = ka.cmp(kb).then_with(|| match (va, vb) {
            (Some(x), Some(y)) => x.total_cmp(y),
            _ => va.is_some().cmp(&vb.is_some()),
        });
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Keep one record per key. Output is ordered by key.
pub fn dedup_by_key<T, K, F>(records: Vec<T>, key: F, policy: &DedupPolicy) -> (Vec<T>, usize)
where
    T: Provenance,
    K: Ord,
    F: Fn(&T) -> K,
{
    let total = records.len();
    let mut kept: BTreeMap<K, T> = BTreeMap::new();
    for record in records {
        let k = key(&record);
        match kept.get(&k) {
            Some(incumbent) if !policy.prefers(&record, incumbent) => {}
            _ => {
                kept.insert(k, record);
            }
        }
    }
    let removed = total - kept.len();
    (kept.into_values().collect(), removed)
}

pub fn dedup_games(games: Vec<GameEvent>, policy: &DedupPolicy) -> (Vec<GameEvent>, usize) {
    dedup_by_key(games, |g| g.game_id.clone(), policy)
}

pub fn dedup_stat_rows(
    rows: Vec<EntityStatRow>,
    policy: &DedupPolicy,
) -> (Vec<EntityStatRow>, usize) {
    dedup_by_key(rows, |r| (r.entity_id.clone(), r.game_id.clone()), policy)
}

/// Inclusive bounds for a metric; values outside drop the row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricRange {
    pub min: f64,
    pub max: f64,
}

/// Parse the date formats the collectors are known to emit. Time of day,
/// when present, is discarded.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%Y%m%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(d);
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.date());
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.naive_local().date())
}

fn parse_score(raw: &RawValue, field: &str) -> std::result::Result<Option<i32>, RowIssue> {
    match raw.as_number(field)? {
        None => Ok(None),
        Some(v) if v.fract() == 0.0 && v >= 0.0 && v <= i32::MAX as f64 => Ok(Some(v as i32)),
        Some(v) => Err(RowIssue::MalformedNumber {
            field: field.to_string(),
            raw: v.to_string(),
        }),
    }
}

/// Per-run counts, serialized into the run report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizeReport {
    pub raw_games: usize,
    pub raw_stat_rows: usize,
    pub games: usize,
    pub stat_rows: usize,
    pub entities: usize,
    pub duplicate_games: usize,
    pub duplicate_stat_rows: usize,
    pub season_filtered_games: usize,
    pub season_filtered_stat_rows: usize,
    /// Dropped rows by reason
    pub dropped_games: BTreeMap<String, usize>,
    pub dropped_stat_rows: BTreeMap<String, usize>,
}

/// Normalized data for one run.
#[derive(Debug, Clone, Default)]
pub struct NormalizedData {
    /// Ordered by `(date, game_id)`
    pub games: Vec<GameEvent>,
    /// Entity id → rows ordered by `(date, game_id)`
    pub sequences: BTreeMap<String, Vec<EntityStatRow>>,
    pub report: NormalizeReport,
}

impl NormalizedData {
    pub fn game_index(&self) -> HashMap<&str, &GameEvent> {
        self.games.iter().map(|g| (g.game_id.as_str(), g)).collect()
    }

    pub fn stat_rows(&self) -> impl Iterator<Item = &EntityStatRow> {
        self.sequences.values().flatten()
    }
}

pub struct Normalizer<'a> {
    pub calendar: &'a SeasonCalendar,
    pub dedup: &'a DedupPolicy,
    pub range_checks: &'a BTreeMap<String, MetricRange>,
    pub season_filter: Option<&'a [String]>,
    /// Stat columns to parse. `None` parses every column; with a set, other
    /// columns are skipped, so an unused text column cannot drop the row.
    pub metrics: Option<&'a BTreeSet<String>>,
}

impl<'a> Normalizer<'a> {
    pub fn validate_game(&self, raw: &RawGame) -> std::result::Result<GameEvent, RowIssue> {
        let game_id = raw.game_id.clone().ok_or(RowIssue::MissingField("game_id"))?;
        let raw_date = raw.date.as_deref().ok_or(RowIssue::MissingField("date"))?;
        let date = parse_date(raw_date).ok_or_else(|| RowIssue::UnparseableDate(raw_date.to_string()))?;
        let home = raw
            .home_entity_id
            .clone()
            .ok_or(RowIssue::MissingField("home_entity_id"))?;
        let away = raw
            .away_entity_id
            .clone()
            .ok_or(RowIssue::MissingField("away_entity_id"))?;
        if home == away {
            return Err(RowIssue::SelfMatch);
        }
        Ok(GameEvent {
            game_id,
            date,
            home_entity_id: home,
            away_entity_id: away,
            home_score: parse_score(&raw.home_score, "home_score")?,
            away_score: parse_score(&raw.away_score, "away_score")?,
            season_label: raw.season_label.clone(),
            phase: self.calendar.classify(date),
            source: raw.source.clone().unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            seq: raw.seq,
        })
    }

    pub fn validate_stat_row(
        &self,
        raw: &RawStatRow,
        games: &HashMap<&str, &GameEvent>,
    ) -> std::result::Result<EntityStatRow, RowIssue> {
        let entity_id = raw.entity_id.clone().ok_or(RowIssue::MissingField("entity_id"))?;
        let game_id = raw.game_id.clone().ok_or(RowIssue::MissingField("game_id"))?;
        let game = games.get(game_id.as_str()).ok_or(RowIssue::UnknownGame)?;

        let mut metrics = BTreeMap::new();
        for (name, value) in &raw.metrics {
            if !self.reads_metric(name) {
                continue;
            }
            let value = value.as_number(name)?;
            if let (Some(v), Some(range)) = (value, self.range_checks.get(name)) {
                if v < range.min || v > range.max {
                    return Err(RowIssue::OutOfRange { metric: name.clone() });
                }
            }
            metrics.insert(name.clone(), value);
        }

        Ok(EntityStatRow {
            entity_id,
            game_id,
            date: game.date,
            team_id: raw.team_id.clone(),
            source: raw.source.clone().unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            seq: raw.seq,
            metrics,
        })
    }

    fn reads_metric(&self, name: &str) -> bool {
        self.range_checks.contains_key(name) || self.metrics.map_or(true, |m| m.contains(name))
    }

    fn keeps_season(&self, game: &GameEvent) -> bool {
        match self.season_filter {
            None => true,
            Some(seasons) => game
                .season_label
                .as_ref()
                .is_some_and(|label| seasons.iter().any(|s| s == label)),
        }
    }

    pub fn normalize(&self, raw_games: &[RawGame], raw_stats: &[RawStatRow]) -> Result<NormalizedData> {
        let mut report = NormalizeReport {
            raw_games: raw_games.len(),
            raw_stat_rows: raw_stats.len(),
            ..Default::default()
        };

        // ── Games ────────────────────────────────────────────────────────────
        let mut valid_games = Vec::with_capacity(raw_games.len());
        for raw in raw_games {
            match self.validate_game(raw) {
                Ok(game) => valid_games.push(game),
                Err(issue) => {
                    warn!(
                        "Dropping game row #{} ({}): {}",
                        raw.seq,
                        raw.game_id.as_deref().unwrap_or("?"),
                        issue
                    );
                    *report.dropped_games.entry(issue.kind().to_string()).or_default() += 1;
                }
            }
        }
        let (games, duplicates) = dedup_games(valid_games, self.dedup);
        report.duplicate_games = duplicates;

        let mut filtered_ids = HashSet::new();
        let mut games: Vec<GameEvent> = games
            .into_iter()
            .filter(|g| {
                let keep = self.keeps_season(g);
                if !keep {
                    filtered_ids.insert(g.game_id.clone());
                }
                keep
            })
            .collect();
        report.season_filtered_games = filtered_ids.len();
        games.sort_by(|a, b| (a.date, &a.game_id).cmp(&(b.date, &b.game_id)));

        // ── Entity rows ──────────────────────────────────────────────────────
        let index: HashMap<&str, &GameEvent> = games.iter().map(|g| (g.game_id.as_str(), g)).collect();
        if let (Some(wanted), Some(first)) = (self.metrics, raw_stats.first()) {
            let ignored: Vec<&str> = first
                .metrics
                .keys()
                .filter(|name| !wanted.contains(*name) && !self.range_checks.contains_key(*name))
                .map(String::as_str)
                .collect();
            if !ignored.is_empty() {
                debug!("Ignoring stat columns not used by this run: {}", ignored.join(", "));
            }
        }
        let mut valid_rows = Vec::with_capacity(raw_stats.len());
        for raw in raw_stats {
            if raw
                .game_id
                .as_ref()
                .is_some_and(|id| filtered_ids.contains(id))
            {
                report.season_filtered_stat_rows += 1;
                continue;
            }
            match self.validate_stat_row(raw, &index) {
                Ok(row) => valid_rows.push(row),
                Err(issue) => {
                    warn!(
                        "Dropping stat row #{} ({} in {}): {}",
                        raw.seq,
                        raw.entity_id.as_deref().unwrap_or("?"),
                        raw.game_id.as_deref().unwrap_or("?"),
                        issue
                    );
                    *report.dropped_stat_rows.entry(issue.kind().to_string()).or_default() += 1;
                }
            }
        }
        let (rows, duplicates) = dedup_stat_rows(valid_rows, self.dedup);
        report.duplicate_stat_rows = duplicates;

        let mut sequences: BTreeMap<String, Vec<EntityStatRow>> = BTreeMap::new();
        for row in rows {
            sequences.entry(row.entity_id.clone()).or_default().push(row);
        }
        for seq in sequences.values_mut() {
            seq.sort_by(|a, b| (a.date, &a.game_id).cmp(&(b.date, &b.game_id)));
        }

        check_ordering(&games, &sequences)?;

        report.games = games.len();
        report.stat_rows = sequences.values().map(Vec::len).sum();
        report.entities = sequences.len();
        info!(
            "Normalized {} games ({} duplicates) and {} entity rows ({} duplicates) across {} entities",
            report.games,
            report.duplicate_games,
            report.stat_rows,
            report.duplicate_stat_rows,
            report.entities
        );

        Ok(NormalizedData {
            games,
            sequences,
            report,
        })
    }
}

/// Post-dedup guarantee: keys are unique and sequences strictly increase by
/// `(date, game_id)`. A failure here means deduplication is broken.
fn check_ordering(games: &[GameEvent], sequences: &BTreeMap<String, Vec<EntityStatRow>>) -> Result<()> {
    for pair in games.windows(2) {
        if (pair[0].date, &pair[0].game_id) >= (pair[1].date, &pair[1].game_id) {
            return Err(PipelineError::Invariant(format!(
                "game {} appears more than once after deduplication",
                pair[1].game_id
            )));
        }
    }
    for (entity, seq) in sequences {
        for pair in seq.windows(2) {
            if (pair[0].date, &pair[0].game_id) >= (pair[1].date, &pair[1].game_id) {
                return Err(PipelineError::Invariant(format!(
                    "entity {} has duplicate or unordered rows at game {}",
                    entity, pair[1].game_id
                )));
            }
        }
    }
    Ok(())
}
