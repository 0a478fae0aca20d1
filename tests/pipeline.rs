use std::collections::BTreeMap;
use std::fs;

use tempfile::tempdir;

use boxscore_features::config::{ModelingUnit, PipelineSettings};
use boxscore_features::db::models::{RawGame, RawStatRow, RawValue};
use boxscore_features::db::Database;
use boxscore_features::features::normalize::DedupPolicy;
use boxscore_features::features::side_tables::{SideTableColumn, SideTableSpec};
use boxscore_features::features::table::{ColumnKind, JoinKey};
use boxscore_features::{output, pipeline, PipelineError, Stage};

fn game(id: &str, date: &str, home: &str, away: &str, hs: i64, aws: i64) -> RawGame {
    RawGame {
        seq: 0,
        game_id: Some(id.into()),
        date: Some(date.into()),
        home_entity_id: Some(home.into()),
        away_entity_id: Some(away.into()),
        home_score: RawValue::Integer(hs),
        away_score: RawValue::Integer(aws),
        season_label: Some("2023-24".into()),
        source: Some("nba_api".into()),
    }
}

fn stat(entity: &str, game: &str, team: &str, points: f64, source: &str) -> RawStatRow {
    let mut metrics = BTreeMap::new();
    metrics.insert("points".to_string(), RawValue::Real(points));
    metrics.insert("rebounds".to_string(), RawValue::Real(points / 4.0));
    RawStatRow {
        seq: 0,
        entity_id: Some(entity.into()),
        game_id: Some(game.into()),
        team_id: Some(team.into()),
        source: Some(source.into()),
        metrics,
    }
}

fn seed(path: &str) {
    let db = Database::open(path).expect("open store");
    let games = [
        game("g1", "2024-01-01", "BOS", "NYK", 110, 100),
        game("g2", "2024-01-03", "NYK", "BOS", 105, 99),
        game("g3", "2024-01-05", "BOS", "NYK", 120, 118),
        game("g4", "2024-01-08", "NYK", "BOS", 101, 101),
    ];
    for g in &games {
        db.insert_game(g).expect("insert game");
    }
    // Second copy from a scraper, plus a row the normalizer must drop.
    db.insert_game(&RawGame {
        source: Some("scrape".into()),
        ..games[0].clone()
    })
    .expect("insert duplicate game");
    db.insert_game(&game("gx", "not a date", "BOS", "NYK", 1, 0))
        .expect("insert bad game");

    for (g, pts) in [("g1", 20.0), ("g2", 30.0), ("g3", 10.0), ("g4", 40.0)] {
        db.insert_stat_row(&stat("p1", g, "BOS", pts, "nba_api")).expect("insert stat");
        db.insert_stat_row(&stat("p2", g, "NYK", pts / 2.0, "nba_api")).expect("insert stat");
    }
    // Lower-priority duplicate that must lose even though it arrived last.
    db.insert_stat_row(&stat("p1", "g2", "BOS", 99.0, "scrape")).expect("insert duplicate stat");

    // Bookkeeping column the pipeline never reads.
    let conn = rusqlite::Connection::open(path).expect("raw connection");
    conn.execute_batch("ALTER TABLE entity_stats ADD COLUMN created_at TEXT DEFAULT '2024-01-09 10:00:00';")
        .expect("add created_at");
}

fn settings(dir: &std::path::Path) -> PipelineSettings {
    let park = dir.join("park.csv");
    fs::write(&park, "team,run_factor,roof\nBOS,1.05,dome\nBOS,0.95,open\n").expect("write park");

    PipelineSettings {
        unit: ModelingUnit::PlayerGame,
        windows: vec![2],
        player_metrics: vec!["points".into(), "rebounds".into()],
        dedup: DedupPolicy {
            source_priority: vec!["nba_api".into()],
            ..Default::default()
        },
        side_tables: vec![
            SideTableSpec {
                name: "park".into(),
                path: park,
                join: JoinKey::HomeTeam,
                key_columns: vec!["team".into()],
                columns: vec![
                    SideTableColumn {
                        name: "run_factor".into(),
                        kind: ColumnKind::Numeric,
                    },
                    SideTableColumn {
                        name: "roof".into(),
                        kind: ColumnKind::Categorical,
                    },
                ],
                namespace: Some("park".into()),
            },
            SideTableSpec {
                name: "odds".into(),
                path: dir.join("missing_odds.csv"),
                join: JoinKey::Game,
                key_columns: vec!["game_id".into()],
                columns: vec![SideTableColumn {
                    name: "home_moneyline".into(),
                    kind: ColumnKind::Market { neutral: Some(100.0) },
                }],
                namespace: None,
            },
        ],
        ..Default::default()
    }
}

#[test]
fn full_run_writes_a_complete_table() {
    let dir = tempdir().expect("tempdir");
    let db_path = dir.path().join("sports.db");
    let db_path = db_path.to_str().expect("utf-8 path");
    seed(db_path);

    let settings = settings(dir.path());
    settings.validate().expect("valid settings");

    let db = Database::open_read_only(db_path).expect("open read-only");
    let out = pipeline::run(&settings, &db).expect("pipeline run");

    // 8 entity-games, minus each player's first game (no baseline).
    assert_eq!(out.table.len(), 6);
    assert_eq!(out.report.normalization.duplicate_games, 1);
    assert_eq!(out.report.normalization.duplicate_stat_rows, 1);
    assert_eq!(out.report.normalization.dropped_games.get("unparseable_date"), Some(&1));
    assert!(out.report.normalization.dropped_stat_rows.is_empty());
    assert_eq!(out.report.merge.layers_skipped.len(), 1);
    assert_eq!(out.report.merge.layers_skipped[0].name, "odds");

    let csv_path = dir.path().join("out/features.csv");
    let report_path = dir.path().join("out/report.json");
    output::write_table(&out.table, &csv_path).expect("write table");
    output::write_report(&out.report, &report_path).expect("write report");

    let mut reader = csv::Reader::from_path(&csv_path).expect("read back");
    let headers: Vec<String> = reader.headers().expect("headers").iter().map(String::from).collect();
    assert_eq!(&headers[..2], &["game_id", "date"]);
    let pos = |name: &str| headers.iter().position(|h| h == name).unwrap_or_else(|| panic!("no column {name}"));
    assert!(pos("points_roll_avg_2g") < pos("home_rest_days"));
    assert!(pos("home_rest_days") < pos("home_team_points_for_roll_avg_2g"));
    assert!(pos("opponent_points_against_roll_avg_2g") < pos("park_run_factor"));
    assert!(pos("park_roof") < pos("home_moneyline"));
    assert_eq!(headers.last().map(String::as_str), Some("points_over_avg_2g"));

    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.expect("record")).collect();
    assert_eq!(rows.len(), 6);
    let p1_g3 = rows
        .iter()
        .find(|r| &r[pos("game_id")] == "g3" && &r[pos("entity_id")] == "p1")
        .expect("p1 in g3");
    // The scraped 99 for g2 lost to the authoritative 30.
    assert_eq!(&p1_g3[pos("points_roll_avg_2g")], "25");
    assert_eq!(&p1_g3[pos("points_over_avg_2g")], "0");
    assert_eq!(&p1_g3[pos("park_run_factor")], "1.05");
    assert_eq!(&p1_g3[pos("park_roof")], "dome");
    assert_eq!(&p1_g3[pos("home_moneyline")], "100");
    assert_eq!(&p1_g3[pos("home_rest_days")], "2");

    let p2_g2 = rows
        .iter()
        .find(|r| &r[pos("game_id")] == "g2" && &r[pos("entity_id")] == "p2")
        .expect("p2 in g2");
    // NYK hosts g2: no park row, so the sentinel shows.
    assert_eq!(&p2_g2[pos("park_roof")], "unknown");
    assert_eq!(&p2_g2[pos("is_home")], "1");

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).expect("report")).expect("json");
    assert_eq!(report["rows"], 6);
    assert_eq!(report["teams"], 2);
    assert_eq!(report["seasons"][0], "2023-24");

    // A directory that cannot be created fails at the write stage and
    // leaves the earlier table alone.
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "").expect("write blocker");
    let failure = output::write_outputs(&out, blocker.join("features.csv"), None)
        .err()
        .expect("must fail");
    assert_eq!(failure.stage, Stage::Write);
    assert_eq!(
        csv::Reader::from_path(&csv_path).expect("reread").records().count(),
        6
    );
}

#[test]
fn missing_table_fails_at_load() {
    let dir = tempdir().expect("tempdir");
    let db_path = dir.path().join("empty.db");
    {
        let conn = rusqlite::Connection::open(&db_path).expect("create");
        conn.execute_batch("CREATE TABLE games (game_id TEXT);").expect("schema");
    }
    let db = Database::open_read_only(db_path.to_str().expect("utf-8 path")).expect("open");
    let failure = pipeline::run(&PipelineSettings::default(), &db).err().expect("must fail");
    assert_eq!(failure.stage, Stage::Load);
    assert!(matches!(failure.source, PipelineError::Schema(_)));
}
