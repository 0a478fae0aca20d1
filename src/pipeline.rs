//! One batch run: load → normalize → {rolling, rest, team strength} →
//! assemble → targets → impute.
//!
//! Everything a run needs travels in a `PipelineContext`; nothing is kept
//! between runs.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use crate::config::{ModelingUnit, PipelineSettings};
use crate::db::models::{RawGame, RawStatRow};
use crate::db::Database;
use crate::error::{AtStage, Stage, StageFailure};
use crate::features::assemble::{impute, merge_layers, ImputationReport, MergeReport};
use crate::features::layers::{context_layer, game_base, matchup_layer, player_game_base, player_rolling_layer};
use crate::features::normalize::{NormalizeReport, NormalizedData, Normalizer};
use crate::features::rest::{compute_rest_days, RestTable};
use crate::features::rolling::rolling_column_name;
use crate::features::season::SeasonCalendar;
use crate::features::side_tables::load_side_table;
use crate::features::table::{FeatureLayer, FeatureTable, LayerResult};
use crate::features::target::{derive_targets, TargetReport};
use crate::features::team_strength::{
    pivot_onto_schedule, reshape_and_aggregate, sum_team_box_scores, TeamRolling, POINTS_AGAINST,
};

/// Configuration plus the in-memory results of one run.
pub struct PipelineContext<'a> {
    pub settings: &'a PipelineSettings,
    pub calendar: SeasonCalendar,
    pub data: NormalizedData,
    pub rest: RestTable,
    pub team_rolling: TeamRolling,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub unit: ModelingUnit,
    pub rows: usize,
    pub columns: Vec<String>,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub teams: usize,
    pub entities: usize,
    pub seasons: Vec<String>,
    /// Games per season phase
    pub phases: BTreeMap<String, usize>,
    pub normalization: NormalizeReport,
    pub merge: MergeReport,
    pub targets: TargetReport,
    pub imputation: ImputationReport,
}

pub struct PipelineOutput {
    pub table: FeatureTable,
    pub report: RunReport,
}

/// Read the store and build the table.
pub fn run(settings: &PipelineSettings, db: &Database) -> Result<PipelineOutput, StageFailure> {
    let games = db.load_games().at(Stage::Load)?;
    let stats = db.load_stat_rows().at(Stage::Load)?;
    info!("Loaded {} game rows and {} entity rows", games.len(), stats.len());
    build_table(settings, &games, &stats)
}

/// Build the table from raw rows already in memory.
pub fn build_table(
    settings: &PipelineSettings,
    raw_games: &[RawGame],
    raw_stats: &[RawStatRow],
) -> Result<PipelineOutput, StageFailure> {
    let calendar = settings.calendar().at(Stage::Normalize)?;
    let consumed = settings.consumed_metrics();
    let normalizer = Normalizer {
        calendar: &calendar,
        dedup: &settings.dedup,
        range_checks: &settings.range_checks,
        season_filter: settings.season_filter.as_deref(),
        metrics: Some(&consumed),
    };
    let data = normalizer.normalize(raw_games, raw_stats).at(Stage::Normalize)?;

    let rest = compute_rest_days(&data.games, &settings.rest);
    info!("Computed rest intervals for {} games", rest.len());

    let mut team_stats = settings.team_stats.clone();
    if settings.unit == ModelingUnit::PlayerGame && !team_stats.iter().any(|s| s == POINTS_AGAINST) {
        // The matchup layer reads the opponent's conceded-points average.
        team_stats.push(POINTS_AGAINST.to_string());
    }
    let box_scores = sum_team_box_scores(data.stat_rows(), &team_stats);
    let team_rolling = reshape_and_aggregate(&data.games, &box_scores, &team_stats, &settings.windows, settings.same_day)
        .at(Stage::TeamStrength)?;

    let ctx = PipelineContext {
        settings,
        calendar,
        data,
        rest,
        team_rolling,
    };
    assemble(&ctx)
}

fn build_layers(ctx: &PipelineContext<'_>) -> Result<Vec<LayerResult>, StageFailure> {
    let settings = ctx.settings;
    let mut layers: Vec<LayerResult> = Vec::new();

    if settings.unit == ModelingUnit::PlayerGame {
        let player = player_rolling_layer(&ctx.data, &settings.player_metrics, &settings.windows, settings.same_day)
            .at(Stage::Rolling)?;
        layers.push(Ok(player));
    }
    layers.push(Ok(context_layer(&ctx.data.games, &ctx.rest).at(Stage::Rest)?));

    let mut strength = pivot_onto_schedule(&ctx.data.games, &ctx.team_rolling).at(Stage::TeamStrength)?;
    if settings.unit == ModelingUnit::PlayerGame {
        // Keep only the configured stats; any extra was rolled for the matchup layer.
        let wanted: BTreeSet<String> = settings
            .team_stats
            .iter()
            .flat_map(|s| settings.windows.iter().map(move |&w| rolling_column_name(s, w)))
            .flat_map(|c| [format!("home_team_{}", c), format!("away_team_{}", c)])
            .collect();
        retain_layer_columns(&mut strength, &wanted);
        let matchup = matchup_layer(&ctx.data, &ctx.rest, &ctx.team_rolling, &settings.windows)
            .at(Stage::TeamStrength)?;
        layers.push(Ok(strength));
        layers.push(Ok(matchup));
    } else {
        layers.push(Ok(strength));
    }

    for spec in &settings.side_tables {
        layers.push(load_side_table(spec));
    }
    Ok(layers)
}

fn retain_layer_columns(layer: &mut FeatureLayer, wanted: &BTreeSet<String>) {
    let keep: Vec<bool> = layer.columns.iter().map(|c| wanted.contains(&c.name)).collect();
    if keep.iter().all(|k| *k) {
        return;
    }
    let mut flags = keep.iter();
    layer.columns.retain(|_| *flags.next().unwrap_or(&false));
    for values in layer.rows.values_mut() {
        let mut flags = keep.iter();
        values.retain(|_| *flags.next().unwrap_or(&false));
    }
}

fn assemble(ctx: &PipelineContext<'_>) -> Result<PipelineOutput, StageFailure> {
    let settings = ctx.settings;
    let base = match settings.unit {
        ModelingUnit::Game => game_base(&ctx.data),
        ModelingUnit::PlayerGame => player_game_base(&ctx.data, &settings.player_metrics),
    }
    .at(Stage::Assemble)?;
    info!("Base table has {} rows", base.len());

    let layers = build_layers(ctx)?;
    let (mut table, merge) = merge_layers(base, layers, settings.collisions).at(Stage::Assemble)?;

    // Labels first: rows without a baseline must go before imputation
    // could paper over the missing rolling value.
    let targets = derive_targets(&mut table, &settings.effective_targets()).at(Stage::Target)?;
    let imputation = impute(&mut table, &settings.imputation).at(Stage::Impute)?;

    let report = summarize(ctx, &table, merge, targets, imputation);
    info!(
        "Assembled {} rows x {} columns ({} layers merged, {} skipped)",
        report.rows,
        report.columns.len(),
        report.merge.layers_merged.len(),
        report.merge.layers_skipped.len()
    );
    Ok(PipelineOutput { table, report })
}

fn summarize(
    ctx: &PipelineContext<'_>,
    table: &FeatureTable,
    merge: MergeReport,
    targets: TargetReport,
    imputation: ImputationReport,
) -> RunReport {
    let games = &ctx.data.games;
    let teams: BTreeSet<&str> = games
        .iter()
        .flat_map(|g| [g.home_entity_id.as_str(), g.away_entity_id.as_str()])
        .collect();
    let seasons: BTreeSet<String> = games.iter().filter_map(|g| g.season_label.clone()).collect();
    let mut phases = BTreeMap::new();
    for g in games {
        *phases.entry(g.phase.to_string()).or_insert(0) += 1;
    }

    RunReport {
        unit: ctx.settings.unit,
        rows: table.len(),
        columns: table.columns.iter().map(|c| c.name.clone()).collect(),
        first_date: games.first().map(|g| g.date),
        last_date: games.last().map(|g| g.date),
        teams: teams.len(),
        entities: ctx.data.sequences.len(),
        seasons: seasons.into_iter().collect(),
        phases,
        normalization: ctx.data.report.clone(),
        merge,
        targets,
        imputation,
    }
}
