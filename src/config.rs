use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{PipelineError, Result};
use crate::features::assemble::{CollisionPolicy, ImputationSettings};
use crate::features::normalize::{DedupPolicy, MetricRange};
use crate::features::rest::RestPolicy;
use crate::features::rolling::SameDayPolicy;
use crate::features::season::{PhaseRange, SeasonCalendar};
use crate::features::side_tables::SideTableSpec;
use crate::features::table::ColumnKind;
use crate::features::target::TargetSpec;

/// Build a leakage-free, model-ready feature table from collected games and
/// box scores
#[derive(Parser, Debug, Clone)]
#[command(name = "boxscore-features", version, about)]
pub struct Config {
    /// SQLite store written by the collection layer
    #[arg(long, env = "DATABASE_PATH", default_value = "data/sports_model.db")]
    pub database_path: String,

    /// Where the assembled feature table is written (CSV)
    #[arg(
        long,
        env = "OUTPUT_PATH",
        default_value = "data/processed/featured_data.csv"
    )]
    pub output_path: String,

    /// Optional JSON run report
    #[arg(long, env = "REPORT_PATH")]
    pub report_path: Option<String>,

    /// Pipeline settings file (JSON); defaults are used when absent
    #[arg(long, env = "PIPELINE_SETTINGS")]
    pub settings: Option<String>,

    /// Modeling unit, overrides the settings file
    #[arg(long, env = "MODELING_UNIT", value_enum)]
    pub unit: Option<ModelingUnit>,

    /// Rolling window sizes, e.g. `3,5,10`; overrides the settings file
    #[arg(long, env = "ROLLING_WINDOWS", value_delimiter = ',')]
    pub windows: Vec<usize>,

    /// Lower clip bound for rest days
    #[arg(long, env = "REST_MIN_DAYS")]
    pub rest_min: Option<i64>,

    /// Upper clip bound for rest days
    #[arg(long, env = "REST_MAX_DAYS")]
    pub rest_max: Option<i64>,
}

impl Config {
    /// Load the settings file (if any), apply CLI overrides and validate.
    pub fn load_settings(&self) -> anyhow::Result<PipelineSettings> {
        let mut settings = match &self.settings {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read settings file {}", path))?;
                serde_json::from_str::<PipelineSettings>(&content)
                    .with_context(|| format!("failed to parse settings file {}", path))?
            }
            None => PipelineSettings::default(),
        };

        if let Some(unit) = self.unit {
            settings.unit = unit;
        }
        if !self.windows.is_empty() {
            settings.windows = self.windows.clone();
        }
        if let Some(min) = self.rest_min {
            settings.rest.min_days = min;
        }
        if let Some(max) = self.rest_max {
            settings.rest.max_days = max;
        }

        settings.validate()?;
        Ok(settings)
    }
}

/// What one output row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ModelingUnit {
    Game,
    PlayerGame,
}

/// Everything a run needs to know besides the data itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub unit: ModelingUnit,
    pub windows: Vec<usize>,
    pub same_day: SameDayPolicy,
    /// Entity metrics that get rolling averages
    pub player_metrics: Vec<String>,
    /// Per-team stats aggregated by the team strength layer
    pub team_stats: Vec<String>,
    pub rest: RestPolicy,
    pub season_calendar: Vec<PhaseRange>,
    /// Keep only these season labels (all when absent)
    pub season_filter: Option<Vec<String>>,
    pub dedup: DedupPolicy,
    pub range_checks: BTreeMap<String, MetricRange>,
    pub side_tables: Vec<SideTableSpec>,
    pub collisions: CollisionPolicy,
    pub imputation: ImputationSettings,
    /// Labels to derive; unit defaults when absent
    pub targets: Option<Vec<TargetSpec>>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            unit: ModelingUnit::PlayerGame,
            windows: vec![5, 10],
            same_day: SameDayPolicy::default(),
            player_metrics: vec!["points".into(), "rebounds".into(), "assists".into()],
            team_stats: vec![
                "points_for".into(),
                "points_against".into(),
                "point_diff".into(),
                "win".into(),
            ],
            rest: RestPolicy::default(),
            season_calendar: Vec::new(),
            season_filter: None,
            dedup: DedupPolicy::default(),
            range_checks: BTreeMap::new(),
            side_tables: Vec::new(),
            collisions: CollisionPolicy::default(),
            imputation: ImputationSettings::default(),
            targets: None,
        }
    }
}

impl PipelineSettings {
    /// Targets to derive: the configured list, or the unit default
    /// (`home_win` per game, first metric over its first-window average per
    /// player-game).
    pub fn effective_targets(&self) -> Vec<TargetSpec> {
        if let Some(targets) = &self.targets {
            return targets.clone();
        }
        match self.unit {
            ModelingUnit::Game => vec![TargetSpec::HomeWin],
            ModelingUnit::PlayerGame => match (self.player_metrics.first(), self.windows.first()) {
                (Some(metric), Some(window)) => vec![TargetSpec::OverTrailingAverage {
                    metric: metric.clone(),
                    window: *window,
                }],
                _ => Vec::new(),
            },
        }
    }

    /// Stat columns the run reads. Any other column in the store is ignored
    /// by the normalizer instead of being parsed.
    pub fn consumed_metrics(&self) -> BTreeSet<String> {
        self.player_metrics
            .iter()
            .chain(&self.team_stats)
            .chain(self.range_checks.keys())
            .cloned()
            .collect()
    }

    pub fn calendar(&self) -> Result<SeasonCalendar> {
        SeasonCalendar::new(&self.season_calendar)
    }

    pub fn validate(&self) -> Result<()> {
        if self.windows.is_empty() {
            return Err(PipelineError::Config("at least one rolling window is required".into()));
        }
        let mut seen = BTreeSet::new();
        for w in &self.windows {
            if *w == 0 {
                return Err(PipelineError::Config("rolling windows must be positive".into()));
            }
            if !seen.insert(*w) {
                return Err(PipelineError::Config(format!("rolling window {} listed twice", w)));
            }
        }
        self.rest.validate()?;
        self.calendar()?;

        for (metric, range) in &self.range_checks {
            if range.min > range.max {
                return Err(PipelineError::Config(format!(
                    "range check for {} has min {} above max {}",
                    metric, range.min, range.max
                )));
            }
        }

        for spec in &self.side_tables {
            spec.validate()?;
            for col in &spec.columns {
                if let ColumnKind::Market { neutral } = col.kind {
                    if self.imputation.market_neutral(&col.name, neutral).is_none() {
                        return Err(PipelineError::Config(format!(
                            "market column {} in side table {} has no neutral value",
                            col.name, spec.name
                        )));
                    }
                }
            }
        }

        for target in self.effective_targets() {
            if let TargetSpec::OverTrailingAverage { metric, window } = &target {
                if self.unit != ModelingUnit::PlayerGame {
                    return Err(PipelineError::Config(format!(
                        "target {} needs the player-game unit",
                        target.column_name()
                    )));
                }
                if !self.player_metrics.contains(metric) {
                    return Err(PipelineError::Config(format!(
                        "target {} references metric {} that has no rolling feature",
                        target.column_name(),
                        metric
                    )));
                }
                if !self.windows.contains(window) {
                    return Err(PipelineError::Config(format!(
                        "target {} references window {} that is not computed",
                        target.column_name(),
                        window
                    )));
                }
            }
        }
        Ok(())
    }
}
