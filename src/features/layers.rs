//! Base tables and the built-in feature layers.

use chrono::{Datelike, Weekday};
use tracing::debug;

use crate::db::models::GameEvent;
use crate::error::Result;
use crate::features::normalize::NormalizedData;
use crate::features::rest::RestTable;
use crate::features::rolling::{compute_rolling_features, feature_columns, rolling_column_name, SameDayPolicy};
use crate::features::table::{Cell, ColumnSpec, FeatureLayer, FeatureTable, JoinKey};
use crate::features::team_strength::{TeamRolling, POINTS_AGAINST};

fn game_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::identifier("game_id"),
        ColumnSpec::identifier("date"),
        ColumnSpec::identifier("season_label"),
        ColumnSpec::categorical("season_phase"),
        ColumnSpec::identifier("home_team_id"),
        ColumnSpec::identifier("away_team_id"),
    ]
}

fn game_cells(game: &GameEvent) -> Vec<Cell> {
    vec![
        Cell::text(game.game_id.clone()),
        Cell::text(game.date.format("%Y-%m-%d").to_string()),
        Cell::Text(game.season_label.clone()),
        Cell::text(game.phase.as_str()),
        Cell::text(game.home_entity_id.clone()),
        Cell::text(game.away_entity_id.clone()),
    ]
}

fn score_cells(game: &GameEvent) -> [Cell; 2] {
    [
        Cell::Num(game.home_score.map(f64::from)),
        Cell::Num(game.away_score.map(f64::from)),
    ]
}

/// One row per game.
pub fn game_base(data: &NormalizedData) -> Result<FeatureTable> {
    let mut columns = game_columns();
    columns.push(ColumnSpec::outcome("home_score"));
    columns.push(ColumnSpec::outcome("away_score"));

    let mut table = FeatureTable::new(columns);
    for game in &data.games {
        let mut row = game_cells(game);
        row.extend(score_cells(game));
        table.push_row(row)?;
    }
    Ok(table)
}

/// One row per (game, entity). The entity's realized metrics for the game
/// are outcomes: they exist for labelling and are not model inputs.
pub fn player_game_base(data: &NormalizedData, metrics: &[String]) -> Result<FeatureTable> {
    let mut columns = game_columns();
    columns.push(ColumnSpec::identifier("entity_id"));
    columns.push(ColumnSpec::identifier("team_id"));
    columns.push(ColumnSpec::outcome("home_score"));
    columns.push(ColumnSpec::outcome("away_score"));
    columns.extend(metrics.iter().map(ColumnSpec::outcome));

    let games = data.game_index();
    let mut table = FeatureTable::new(columns);
    // Schedule order, then entity, so the table reads chronologically.
    let mut rows: Vec<_> = data.stat_rows().collect();
    rows.sort_by(|a, b| (a.date, &a.game_id, &a.entity_id).cmp(&(b.date, &b.game_id, &b.entity_id)));
    for stat in rows {
        let Some(game) = games.get(stat.game_id.as_str()) else {
            continue;
        };
        let mut row = game_cells(game);
        row.push(Cell::text(stat.entity_id.clone()));
        row.push(Cell::Text(stat.team_id.clone()));
        row.extend(score_cells(game));
        row.extend(metrics.iter().map(|m| Cell::Num(stat.metrics.get(m).copied().flatten())));
        table.push_row(row)?;
    }
    Ok(table)
}

/// Per-entity rolling averages, joined on (game, entity).
pub fn player_rolling_layer(
    data: &NormalizedData,
    metrics: &[String],
    windows: &[usize],
    policy: SameDayPolicy,
) -> Result<FeatureLayer> {
    let columns = feature_columns(metrics, windows).into_iter().map(ColumnSpec::numeric).collect();
    let mut layer = FeatureLayer::new("player_rolling", JoinKey::GameEntity, columns);
    for (entity, sequence) in &data.sequences {
        let rolled = compute_rolling_features(sequence, metrics, windows, policy)?;
        for (game_id, values) in rolled.rows {
            layer.insert(vec![game_id, entity.clone()], values.into_iter().map(Cell::Num).collect())?;
        }
    }
    debug!("Player rolling layer covers {} entity-games", layer.rows.len());
    Ok(layer)
}

/// Schedule context per game: rest and day of week.
pub fn context_layer(games: &[GameEvent], rest: &RestTable) -> Result<FeatureLayer> {
    let columns = vec![
        ColumnSpec::numeric("home_rest_days"),
        ColumnSpec::numeric("away_rest_days"),
        ColumnSpec::numeric("rest_advantage"),
        ColumnSpec::numeric("is_weekend"),
    ];
    let mut layer = FeatureLayer::new("context", JoinKey::Game, columns);
    for game in games {
        let r = rest.get(&game.game_id).unwrap_or_default();
        let weekend = matches!(game.date.weekday(), Weekday::Sat | Weekday::Sun);
        layer.insert(
            vec![game.game_id.clone()],
            vec![
                r.home.into(),
                r.away.into(),
                r.advantage().into(),
                Cell::Num(Some(if weekend { 1.0 } else { 0.0 })),
            ],
        )?;
    }
    Ok(layer)
}

/// The entity's side of its game: home flag, both teams' rest, and how many
/// points the opponent has been conceding.
pub fn matchup_layer(
    data: &NormalizedData,
    rest: &RestTable,
    team_rolling: &TeamRolling,
    windows: &[usize],
) -> Result<FeatureLayer> {
    let mut columns = vec![
        ColumnSpec::numeric("is_home"),
        ColumnSpec::numeric("team_rest_days"),
        ColumnSpec::numeric("opponent_rest_days"),
    ];
    let conceded: Vec<String> = windows.iter().map(|&w| rolling_column_name(POINTS_AGAINST, w)).collect();
    columns.extend(conceded.iter().map(|c| ColumnSpec::numeric(format!("opponent_{}", c))));
    let width = columns.len();
    let mut layer = FeatureLayer::new("matchup", JoinKey::GameEntity, columns);

    let games = data.game_index();
    for row in data.stat_rows() {
        let side = games
            .get(row.game_id.as_str())
            .copied()
            .zip(row.team_id.as_deref())
            .and_then(|(g, team)| Some((g, team, g.opponent(team)?)));

        let values = match side {
            Some((game, team, opponent)) => {
                let mut v = vec![
                    Cell::Num(game.is_home(team).map(|h| if h { 1.0 } else { 0.0 })),
                    rest.for_team(game, team).into(),
                    rest.for_team(game, opponent).into(),
                ];
                v.extend(
                    conceded
                        .iter()
                        .map(|c| Cell::Num(team_rolling.get(&game.game_id, opponent, c))),
                );
                v
            }
            // Team unknown or not one of the two sides: nothing to attribute.
            None => vec![Cell::Num(None); width],
        };
        layer.insert(vec![row.game_id.clone(), row.entity_id.clone()], values)?;
    }
    Ok(layer)
}
