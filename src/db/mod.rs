use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::error::{PipelineError, Result};

pub mod models;
use models::*;

/// Required columns of the `games` table.
pub const GAME_COLUMNS: [&str; 7] = [
    "game_id",
    "date",
    "home_entity_id",
    "away_entity_id",
    "home_score",
    "away_score",
    "season_label",
];

/// Required columns of the `entity_stats` table. Every other column except
/// the optional `team_id` / `source` is read as a numeric metric.
pub const STAT_KEY_COLUMNS: [&str; 2] = ["entity_id", "game_id"];
const STAT_OPTIONAL_COLUMNS: [&str; 2] = ["team_id", "source"];

const SEQ_ALIAS: &str = "__seq";

/// Shared SQLite handle (single connection behind a coarse lock, so parallel
/// collectors serialize their writes)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the store at the given path and make sure the base
    /// tables exist. Used by the collection layer.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an existing store without write access. The pipeline never
    /// mutates the tables it reads.
    pub fn open_read_only(path: &str) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store with the base schema (tests and dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Invariant("database connection lock poisoned".into()))
    }

    /// Create the base tables (idempotent)
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Games ────────────────────────────────────────────────────────────────

    /// Insert a raw game row exactly as collected (duplicates allowed)
    pub fn insert_game(&self, game: &RawGame) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO games (
                game_id, date, home_entity_id, away_entity_id,
                home_score, away_score, season_label, source
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                game.game_id,
                game.date,
                game.home_entity_id,
                game.away_entity_id,
                sql_value(&game.home_score),
                sql_value(&game.away_score),
                game.season_label,
                game.source,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Read every game row in insertion order.
    pub fn load_games(&self) -> Result<Vec<RawGame>> {
        let conn = self.conn()?;
        ensure_table(&conn, "games")?;
        let mut stmt = conn.prepare(&format!(
            "SELECT rowid AS {SEQ_ALIAS}, * FROM games ORDER BY rowid"
        ))?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let cols = GameColumns::from_names(&names)?;

        let mut rows = stmt.query([])?;
        let mut games = Vec::new();
        while let Some(row) = rows.next()? {
            games.push(cols.read(row)?);
        }
        debug!("Loaded {} raw game rows", games.len());
        Ok(games)
    }

    // ── Entity stats ─────────────────────────────────────────────────────────

    /// Insert a raw entity stat row, adding metric columns the table does not
    /// have yet.
    pub fn insert_stat_row(&self, row: &RawStatRow) -> Result<i64> {
        let conn = self.conn()?;
        let existing = table_columns(&conn, "entity_stats")?;
        for metric in row.metrics.keys() {
            if !existing.iter().any(|c| c == metric) {
                conn.execute_batch(&format!(
                    "ALTER TABLE entity_stats ADD COLUMN {} REAL",
                    quote_ident(metric)
                ))?;
            }
        }

        let mut columns = vec![
            "entity_id".to_string(),
            "game_id".to_string(),
            "team_id".to_string(),
            "source".to_string(),
        ];
        let mut values = vec![
            text_value(&row.entity_id),
            text_value(&row.game_id),
            text_value(&row.team_id),
            text_value(&row.source),
        ];
        for (metric, value) in &row.metrics {
            columns.push(quote_ident(metric));
            values.push(sql_value(value));
        }
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
        conn.execute(
            &format!(
                "INSERT INTO entity_stats ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            ),
            params_from_iter(values.iter()),
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Read every entity stat row in insertion order.
    pub fn load_stat_rows(&self) -> Result<Vec<RawStatRow>> {
        let conn = self.conn()?;
        ensure_table(&conn, "entity_stats")?;
        let mut stmt = conn.prepare(&format!(
            "SELECT rowid AS {SEQ_ALIAS}, * FROM entity_stats ORDER BY rowid"
        ))?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let cols = StatColumns::from_names(&names)?;

        let mut rows = stmt.query([])?;
        let mut stats = Vec::new();
        while let Some(row) = rows.next()? {
            stats.push(cols.read(row)?);
        }
        debug!(
            "Loaded {} raw entity stat rows ({} metric columns)",
            stats.len(),
            cols.metrics.len()
        );
        Ok(stats)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn lookup(names: &[String], table: &str, name: &str) -> Result<usize> {
    names
        .iter()
        .position(|n| n == name)
        .ok_or_else(|| PipelineError::Schema(format!("{table}.{name} column is missing")))
}

struct GameColumns {
    seq: usize,
    game_id: usize,
    date: usize,
    home_entity_id: usize,
    away_entity_id: usize,
    home_score: usize,
    away_score: usize,
    season_label: usize,
    source: Option<usize>,
}

impl GameColumns {
    fn from_names(names: &[String]) -> Result<Self> {
        Ok(Self {
            seq: lookup(names, "games", SEQ_ALIAS)?,
            game_id: lookup(names, "games", "game_id")?,
            date: lookup(names, "games", "date")?,
            home_entity_id: lookup(names, "games", "home_entity_id")?,
            away_entity_id: lookup(names, "games", "away_entity_id")?,
            home_score: lookup(names, "games", "home_score")?,
            away_score: lookup(names, "games", "away_score")?,
            season_label: lookup(names, "games", "season_label")?,
            source: names.iter().position(|n| n == "source"),
        })
    }

    fn read(&self, row: &Row<'_>) -> Result<RawGame> {
        let text = |i: usize| -> Result<Option<String>> {
            Ok(RawValue::from(row.get_ref(i)?).as_text())
        };
        Ok(RawGame {
            seq: row.get(self.seq)?,
            game_id: text(self.game_id)?,
            date: text(self.date)?,
            home_entity_id: text(self.home_entity_id)?,
            away_entity_id: text(self.away_entity_id)?,
            home_score: RawValue::from(row.get_ref(self.home_score)?),
            away_score: RawValue::from(row.get_ref(self.away_score)?),
            season_label: text(self.season_label)?,
            source: match self.source {
                Some(i) => text(i)?,
                None => None,
            },
        })
    }
}

struct StatColumns {
    seq: usize,
    entity_id: usize,
    game_id: usize,
    team_id: Option<usize>,
    source: Option<usize>,
    metrics: Vec<(usize, String)>,
}

impl StatColumns {
    fn from_names(names: &[String]) -> Result<Self> {
        let metrics = names
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                n.as_str() != SEQ_ALIAS
                    && !STAT_KEY_COLUMNS.contains(&n.as_str())
                    && !STAT_OPTIONAL_COLUMNS.contains(&n.as_str())
            })
            .map(|(i, n)| (i, n.clone()))
            .collect();
        Ok(Self {
            seq: lookup(names, "entity_stats", SEQ_ALIAS)?,
            entity_id: lookup(names, "entity_stats", "entity_id")?,
            game_id: lookup(names, "entity_stats", "game_id")?,
            team_id: names.iter().position(|n| n == "team_id"),
            source: names.iter().position(|n| n == "source"),
            metrics,
        })
    }

    fn read(&self, row: &Row<'_>) -> Result<RawStatRow> {
        let text = |i: usize| -> Result<Option<String>> {
            Ok(RawValue::from(row.get_ref(i)?).as_text())
        };
        let optional = |i: Option<usize>| -> Result<Option<String>> {
            match i {
                Some(i) => text(i),
                None => Ok(None),
            }
        };
        let mut metrics = BTreeMap::new();
        for (i, name) in &self.metrics {
            metrics.insert(name.clone(), RawValue::from(row.get_ref(*i)?));
        }
        Ok(RawStatRow {
            seq: row.get(self.seq)?,
            entity_id: text(self.entity_id)?,
            game_id: text(self.game_id)?,
            team_id: optional(self.team_id)?,
            source: optional(self.source)?,
            metrics,
        })
    }
}

fn ensure_table(conn: &Connection, table: &str) -> Result<()> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        params![table],
        |r| r.get(0),
    )?;
    if count == 0 {
        return Err(PipelineError::Schema(format!("table {table} does not exist")));
    }
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_value(value: &RawValue) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match value {
        RawValue::Null => Value::Null,
        RawValue::Integer(v) => Value::Integer(*v),
        RawValue::Real(v) => Value::Real(*v),
        RawValue::Text(s) => Value::Text(s.clone()),
    }
}

fn text_value(value: &Option<String>) -> rusqlite::types::Value {
    match value {
        Some(s) => rusqlite::types::Value::Text(s.clone()),
        None => rusqlite::types::Value::Null,
    }
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS). No uniqueness
/// constraints: several collection strategies may deposit the same game.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS games (
    game_id         TEXT,
    date            TEXT,
    home_entity_id  TEXT,
    away_entity_id  TEXT,
    home_score      INTEGER,
    away_score      INTEGER,
    season_label    TEXT,
    source          TEXT
);

CREATE TABLE IF NOT EXISTS entity_stats (
    entity_id       TEXT,
    game_id         TEXT,
    team_id         TEXT,
    source          TEXT,
    minutes_played  REAL,
    points          REAL,
    rebounds        REAL,
    assists         REAL
);

CREATE INDEX IF NOT EXISTS idx_games_game ON games(game_id);
CREATE INDEX IF NOT EXISTS idx_entity_stats_key ON entity_stats(entity_id, game_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_game(id: &str, date: &str) -> RawGame {
        RawGame {
            seq: 0,
            game_id: Some(id.into()),
            date: Some(date.into()),
            home_entity_id: Some("BOS".into()),
            away_entity_id: Some("NYK".into()),
            home_score: RawValue::Integer(110),
            away_score: RawValue::Null,
            season_label: Some("2023-24".into()),
            source: Some("espn".into()),
        }
    }

    #[test]
    fn games_round_trip_in_insertion_order() {
        let db = Database::open_in_memory().unwrap();
        db.insert_game(&raw_game("g2", "2024-01-03")).unwrap();
        db.insert_game(&raw_game("g1", "2024-01-01")).unwrap();

        let games = db.load_games().unwrap();
        assert_eq!(games.len(), 2);
        assert_eq!(games[0].game_id.as_deref(), Some("g2"));
        assert!(games[0].seq < games[1].seq);
        assert_eq!(games[0].home_score, RawValue::Integer(110));
        assert_eq!(games[0].away_score, RawValue::Null);
        assert_eq!(games[1].source.as_deref(), Some("espn"));
    }

    #[test]
    fn unknown_metric_columns_are_added_and_read_back() {
        let db = Database::open_in_memory().unwrap();
        let mut metrics = BTreeMap::new();
        metrics.insert("points".to_string(), RawValue::Real(21.0));
        metrics.insert("steals".to_string(), RawValue::Integer(3));
        db.insert_stat_row(&RawStatRow {
            seq: 0,
            entity_id: Some("p1".into()),
            game_id: Some("g1".into()),
            team_id: Some("BOS".into()),
            source: None,
            metrics,
        })
        .unwrap();

        let rows = db.load_stat_rows().unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        // Metric columns have REAL affinity.
        assert_eq!(row.metrics.get("steals"), Some(&RawValue::Real(3.0)));
        assert_eq!(row.metrics.get("points"), Some(&RawValue::Real(21.0)));
        assert_eq!(row.metrics.get("rebounds"), Some(&RawValue::Null));
        assert!(!row.metrics.contains_key("team_id"));
        assert!(!row.metrics.contains_key(SEQ_ALIAS));
    }

    #[test]
    fn missing_required_column_is_a_schema_violation() {
        let db = Database::open_in_memory().unwrap();
        {
            let conn = db.conn().unwrap();
            conn.execute_batch("DROP TABLE games; CREATE TABLE games (game_id TEXT, date TEXT);")
                .unwrap();
        }
        match db.load_games() {
            Err(PipelineError::Schema(msg)) => assert!(msg.contains("home_entity_id")),
            other => panic!("expected schema violation, got {:?}", other.map(|g| g.len())),
        }
    }

    #[test]
    fn missing_table_is_a_schema_violation() {
        let db = Database::open_in_memory().unwrap();
        db.conn().unwrap().execute_batch("DROP TABLE entity_stats;").unwrap();
        assert!(matches!(db.load_stat_rows(), Err(PipelineError::Schema(_))));
    }

    #[test]
    fn raw_value_number_parsing() {
        assert_eq!(RawValue::Text(" 12.5 ".into()).as_number("x"), Ok(Some(12.5)));
        assert_eq!(RawValue::Text("".into()).as_number("x"), Ok(None));
        assert_eq!(RawValue::Null.as_number("x"), Ok(None));
        assert!(RawValue::Text("DNP".into()).as_number("x").is_err());
    }
}
