//! Team strength: reshape each game into one row per team, roll the
//! per-team streams, then pivot the results back onto the schedule as
//! `home_team_*` / `away_team_*` columns.
//!
//! The pivot is always keyed by `(game_id, team_id)`. Keying by date would
//! bleed values across games when a team shows up twice on one day.

use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::db::models::{EntityStatRow, GameEvent};
use crate::error::Result;
use crate::features::rolling::{compute_rolling_features, feature_columns, Observation, SameDayPolicy};
use crate::features::table::{Cell, ColumnSpec, FeatureLayer, JoinKey};

pub const POINTS_FOR: &str = "points_for";
pub const POINTS_AGAINST: &str = "points_against";
pub const POINT_DIFF: &str = "point_diff";
pub const WIN: &str = "win";

/// One team's view of one game.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamGameRow {
    pub team_id: String,
    pub game_id: String,
    pub date: NaiveDate,
    pub is_home: bool,
    pub stats: BTreeMap<String, Option<f64>>,
}

impl Observation for TeamGameRow {
    fn game_id(&self) -> &str {
        &self.game_id
    }
    fn date(&self) -> NaiveDate {
        self.date
    }
    fn metric(&self, name: &str) -> Option<f64> {
        self.stats.get(name).copied().flatten()
    }
}

/// Box-score totals per `(game_id, team_id)`.
pub type TeamBoxScores = HashMap<(String, String), BTreeMap<String, f64>>;

/// Sum each metric over a team's entity rows in a game. A metric with no
/// non-null value for the team is left out rather than reported as zero.
pub fn sum_team_box_scores<'a, I>(rows: I, metrics: &[String]) -> TeamBoxScores
where
    I: IntoIterator<Item = &'a EntityStatRow>,
{
    let mut totals: TeamBoxScores = HashMap::new();
    for row in rows {
        let Some(team) = &row.team_id else { continue };
        for metric in metrics {
            if let Some(v) = row.metrics.get(metric).copied().flatten() {
                *totals
                    .entry((row.game_id.clone(), team.clone()))
                    .or_default()
                    .entry(metric.clone())
                    .or_insert(0.0) += v;
            }
        }
    }
    totals
}

fn derived_stat(stat: &str, points_for: Option<f64>, points_against: Option<f64>) -> Option<Option<f64>> {
    let both = points_for.zip(points_against);
    let value = match stat {
        POINTS_FOR => points_for,
        POINTS_AGAINST => points_against,
        POINT_DIFF => both.map(|(f, a)| f - a),
        WIN => both.map(|(f, a)| {
            if f > a {
                1.0
            } else if f < a {
                0.0
            } else {
                0.5
            }
        }),
        _ => return None,
    };
    Some(value)
}

/// Two rows per game, home first. Score-derived stats come from the game
/// record; any other stat is looked up in the box-score totals.
pub fn reshape(games: &[GameEvent], stats: &[String], box_scores: &TeamBoxScores) -> Vec<TeamGameRow> {
    let mut rows = Vec::with_capacity(games.len() * 2);
    for game in games {
        let home = game.home_score.map(f64::from);
        let away = game.away_score.map(f64::from);
        for (team, is_home, pf, pa) in [
            (&game.home_entity_id, true, home, away),
            (&game.away_entity_id, false, away, home),
        ] {
            let totals = box_scores.get(&(game.game_id.clone(), team.clone()));
            let values = stats
                .iter()
                .map(|stat| {
                    let value = derived_stat(stat, pf, pa)
                        .unwrap_or_else(|| totals.and_then(|t| t.get(stat).copied()));
                    (stat.clone(), value)
                })
                .collect();
            rows.push(TeamGameRow {
                team_id: team.clone(),
                game_id: game.game_id.clone(),
                date: game.date,
                is_home,
                stats: values,
            });
        }
    }
    rows
}

/// Rolling team stats keyed by `(game_id, team_id)`.
#[derive(Debug, Clone, Default)]
pub struct TeamRolling {
    /// `<stat>_roll_avg_<w>g`
    pub columns: Vec<String>,
    pub values: HashMap<(String, String), Vec<Option<f64>>>,
}

impl TeamRolling {
    pub fn get(&self, game_id: &str, team_id: &str, column: &str) -> Option<f64> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values
            .get(&(game_id.to_string(), team_id.to_string()))
            .and_then(|row| row[idx])
    }

    pub fn row(&self, game_id: &str, team_id: &str) -> Option<&Vec<Option<f64>>> {
        self.values.get(&(game_id.to_string(), team_id.to_string()))
    }
}

pub fn reshape_and_aggregate(
    games: &[GameEvent],
    box_scores: &TeamBoxScores,
    stats: &[String],
    windows: &[usize],
    policy: SameDayPolicy,
) -> Result<TeamRolling> {
    let mut per_team: BTreeMap<String, Vec<TeamGameRow>> = BTreeMap::new();
    for row in reshape(games, stats, box_scores) {
        per_team.entry(row.team_id.clone()).or_default().push(row);
    }

    let mut values = HashMap::new();
    for (team, rows) in &mut per_team {
        rows.sort_by(|a, b| (a.date, &a.game_id).cmp(&(b.date, &b.game_id)));
        let rolled = compute_rolling_features(&rows[..], stats, windows, policy)?;
        for (game_id, row) in rolled.rows {
            values.insert((game_id, team.clone()), row);
        }
    }
    debug!("Rolled {} team streams over {} games", per_team.len(), games.len());

    Ok(TeamRolling {
        columns: feature_columns(stats, windows),
        values,
    })
}

/// Attach the home team's and the away team's values to each game.
pub fn pivot_onto_schedule(games: &[GameEvent], rolling: &TeamRolling) -> Result<FeatureLayer> {
    let columns = rolling
        .columns
        .iter()
        .map(|c| ColumnSpec::numeric(format!("home_team_{}", c)))
        .chain(rolling.columns.iter().map(|c| ColumnSpec::numeric(format!("away_team_{}", c))))
        .collect();
    let mut layer = FeatureLayer::new("team_strength", JoinKey::Game, columns);

    let empty = vec![None; rolling.columns.len()];
    for game in games {
        let home = rolling.row(&game.game_id, &game.home_entity_id).unwrap_or(&empty);
        let away = rolling.row(&game.game_id, &game.away_entity_id).unwrap_or(&empty);
        let values = home.iter().chain(away.iter()).map(|v| Cell::Num(*v)).collect();
        layer.insert(vec![game.game_id.clone()], values)?;
    }
    Ok(layer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::season::SeasonPhase;
    use approx::assert_relative_eq;

    fn game(id: &str, day: u32, home: &str, away: &str, hs: i32, aws: i32) -> GameEvent {
        GameEvent {
            game_id: id.into(),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            home_entity_id: home.into(),
            away_entity_id: away.into(),
            home_score: Some(hs),
            away_score: Some(aws),
            season_label: None,
            phase: SeasonPhase::RegularSeason,
            source: "test".into(),
            seq: 0,
        }
    }

    fn stats(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reshape_swaps_scores_for_the_away_side() {
        let games = vec![game("g1", 1, "T1", "T2", 100, 90)];
        let rows = reshape(&games, &stats(&[POINTS_FOR, POINTS_AGAINST, POINT_DIFF, WIN]), &HashMap::new());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].team_id, "T1");
        assert_eq!(rows[0].metric(POINTS_FOR), Some(100.0));
        assert_eq!(rows[0].metric(WIN), Some(1.0));
        assert_eq!(rows[1].team_id, "T2");
        assert_eq!(rows[1].metric(POINTS_AGAINST), Some(100.0));
        assert_eq!(rows[1].metric(POINT_DIFF), Some(-10.0));
        assert_eq!(rows[1].metric(WIN), Some(0.0));
    }

    #[test]
    fn box_score_stats_are_team_sums() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let row = |entity: &str, team: Option<&str>, reb: Option<f64>| EntityStatRow {
            entity_id: entity.into(),
            game_id: "g1".into(),
            date,
            team_id: team.map(str::to_string),
            source: "test".into(),
            seq: 0,
            metrics: [("rebounds".to_string(), reb)].into_iter().collect(),
        };
        let rows = vec![
            row("p1", Some("T1"), Some(7.0)),
            row("p2", Some("T1"), Some(5.0)),
            row("p3", Some("T1"), None),
            row("p4", None, Some(3.0)),
            row("p5", Some("T2"), None),
        ];
        let totals = sum_team_box_scores(&rows, &stats(&["rebounds"]));
        assert_eq!(totals[&("g1".to_string(), "T1".to_string())]["rebounds"], 12.0);
        assert!(!totals.contains_key(&("g1".to_string(), "T2".to_string())));

        let games = vec![game("g1", 1, "T1", "T2", 100, 90)];
        let reshaped = reshape(&games, &stats(&["rebounds"]), &totals);
        assert_eq!(reshaped[0].metric("rebounds"), Some(12.0));
        assert_eq!(reshaped[1].metric("rebounds"), None);
    }

    #[test]
    fn pivot_attaches_each_side_by_team() {
        let games = vec![
            game("g1", 1, "T1", "T2", 100, 90),
            game("g2", 3, "T2", "T1", 80, 110),
            game("g3", 5, "T1", "T2", 95, 95),
        ];
        let rolling =
            reshape_and_aggregate(&games, &HashMap::new(), &stats(&[POINTS_FOR]), &[2], SameDayPolicy::default())
                .unwrap();
        let layer = pivot_onto_schedule(&games, &rolling).unwrap();
        assert_eq!(layer.columns[0].name, "home_team_points_for_roll_avg_2g");
        assert_eq!(layer.columns[1].name, "away_team_points_for_roll_avg_2g");

        let g1 = layer.get(&["g1".to_string()]).unwrap();
        assert_eq!(g1, &vec![Cell::Num(None), Cell::Num(None)]);

        // T1 scored 100 then 110; T2 scored 90 then 80.
        let g3 = layer.get(&["g3".to_string()]).unwrap();
        assert_relative_eq!(g3[0].as_f64().unwrap(), 105.0);
        assert_relative_eq!(g3[1].as_f64().unwrap(), 85.0);
        assert_relative_eq!(rolling.get("g2", "T2", "points_for_roll_avg_2g").unwrap(), 90.0);
    }

    #[test]
    fn double_header_values_stay_with_their_game() {
        // T1 plays g2 at home and g3 away on the same date.
        let games = vec![
            game("g1", 1, "T1", "T2", 100, 90),
            game("g2", 3, "T1", "T3", 120, 70),
            game("g3", 3, "T4", "T1", 60, 90),
            game("g4", 5, "T2", "T1", 99, 98),
        ];
        let rolling =
            reshape_and_aggregate(&games, &HashMap::new(), &stats(&[POINTS_FOR]), &[2], SameDayPolicy::default())
                .unwrap();
        let layer = pivot_onto_schedule(&games, &rolling).unwrap();

        let g2 = layer.get(&["g2".to_string()]).unwrap();
        assert_relative_eq!(g2[0].as_f64().unwrap(), 100.0);
        assert_eq!(g2[1], Cell::Num(None));

        let g3 = layer.get(&["g3".to_string()]).unwrap();
        assert_eq!(g3[0], Cell::Num(None));
        assert_relative_eq!(g3[1].as_f64().unwrap(), 100.0);

        // Both same-day games count once each afterwards.
        let g4 = layer.get(&["g4".to_string()]).unwrap();
        assert_relative_eq!(g4[1].as_f64().unwrap(), 105.0);
        assert_eq!(layer.rows.len(), 4);
    }

    #[test]
    fn unplayed_games_do_not_enter_windows() {
        let mut future = game("g2", 3, "T1", "T2", 0, 0);
        future.home_score = None;
        future.away_score = None;
        let games = vec![game("g1", 1, "T1", "T2", 100, 90), future, game("g3", 5, "T1", "T2", 90, 80)];
        let rolling =
            reshape_and_aggregate(&games, &HashMap::new(), &stats(&[WIN]), &[2], SameDayPolicy::default()).unwrap();
        assert_relative_eq!(rolling.get("g3", "T1", "win_roll_avg_2g").unwrap(), 1.0);
        assert_relative_eq!(rolling.get("g2", "T2", "win_roll_avg_2g").unwrap(), 0.0);
    }
}
