use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::info;

use crate::error::{AtStage, Result, Stage, StageFailure};
use crate::features::table::FeatureTable;
use crate::pipeline::{PipelineOutput, RunReport};

/// Temp file next to `path`, so the final rename stays on one filesystem.
fn staging_file(path: &Path) -> Result<NamedTempFile> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            fs::create_dir_all(parent)?;
            parent
        }
        None => Path::new("."),
    };
    Ok(NamedTempFile::new_in(dir)?)
}

/// Move a fully written temp file over `path`. Until this succeeds the
/// previous file at `path`, if any, is untouched.
fn commit(file: NamedTempFile, path: &Path) -> Result<()> {
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Write the table as CSV: header in column order, empty fields for
/// missing values.
pub fn write_table(table: &FeatureTable, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut file = staging_file(path)?;
    {
        let mut writer = csv::Writer::from_writer(file.as_file_mut());
        writer.write_record(table.columns.iter().map(|c| c.name.as_str()))?;
        for row in &table.rows {
            writer.write_record(row.iter().map(|cell| cell.to_field()))?;
        }
        writer.flush()?;
    }
    commit(file, path)?;
    info!("Wrote {} rows to {}", table.len(), path.display());
    Ok(())
}

pub fn write_report(report: &RunReport, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut file = staging_file(path)?;
    serde_json::to_writer_pretty(file.as_file_mut(), report)?;
    file.as_file_mut().write_all(b"\n")?;
    commit(file, path)?;
    info!("Wrote run report to {}", path.display());
    Ok(())
}

/// Write the table and, when asked, the report. Failures are tagged with
/// the write stage.
pub fn write_outputs(
    out: &PipelineOutput,
    table_path: impl AsRef<Path>,
    report_path: Option<&str>,
) -> std::result::Result<(), StageFailure> {
    write_table(&out.table, table_path).at(Stage::Write)?;
    if let Some(path) = report_path {
        write_report(&out.report, path).at(Stage::Write)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::table::{Cell, ColumnSpec};

    #[test]
    fn csv_keeps_column_order_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.csv");
        let mut table = FeatureTable::new(vec![ColumnSpec::identifier("game_id"), ColumnSpec::numeric("rest")]);
        table.push_row(vec![Cell::text("g1"), Cell::Num(Some(2.0))]).unwrap();
        table.push_row(vec![Cell::text("g2"), Cell::Num(None)]).unwrap();
        write_table(&table, &path).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "game_id,rest\ng1,2\ng2,\n");
    }

    #[test]
    fn failed_write_keeps_the_previous_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "game_id\ng0\n").unwrap();

        // Rows wider than the header make the csv writer fail midway.
        let mut table = FeatureTable::new(vec![ColumnSpec::identifier("game_id")]);
        table.push_row(vec![Cell::text("g1")]).unwrap();
        table.rows.push(vec![Cell::text("g2"), Cell::text("extra")]);
        assert!(write_table(&table, &path).is_err());

        assert_eq!(fs::read_to_string(&path).unwrap(), "game_id\ng0\n");
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
