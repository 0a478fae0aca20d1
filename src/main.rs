use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use boxscore_features::config::Config;
use boxscore_features::db::Database;
use boxscore_features::{output, pipeline};

fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let settings = config.load_settings()?;
    info!(
        "Building {:?} features with windows {:?} (rest clipped to [{}, {}])",
        settings.unit, settings.windows, settings.rest.min_days, settings.rest.max_days
    );

    let db = Database::open_read_only(&config.database_path)
        .with_context(|| format!("failed to open store {}", config.database_path))?;
    info!("Database opened: {}", config.database_path);

    let out = match pipeline::run(&settings, &db) {
        Ok(out) => out,
        Err(failure) => {
            error!("{}", failure);
            return Err(failure.into());
        }
    };

    if let Err(failure) = output::write_outputs(&out, &config.output_path, config.report_path.as_deref()) {
        error!("{}", failure);
        return Err(failure.into());
    }

    info!(
        "Done: {} rows, {} columns, {} rows dropped by labelling",
        out.report.rows,
        out.report.columns.len(),
        out.report.targets.rows_before - out.report.targets.rows_after
    );
    Ok(())
}
