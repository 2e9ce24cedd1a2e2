use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use seqmine_core::raw::ParsedSequence;
use seqmine_core::stats::MiningStats;
use seqmine_core::{format_id, DerivedFlags, GuessOutcome, SequenceRecord, XrefRelation};

pub const MINER_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub id: String,
    pub reason: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossReference {
    pub id_a: String,
    pub id_b: String,
    pub relation: XrefRelation,
}

/// Predicate filters for exploratory queries over visited records.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFilter {
    pub hard: Option<bool>,
    pub not_easy: Option<bool>,
    pub is_new: Option<bool>,
    pub check_cf: Option<bool>,
    pub found: Option<bool>,
    pub limit: Option<u32>,
}

pub struct MinerStore {
    conn: Connection,
}

const RECORD_COLUMNS: &str = "
    id, name, raw_formula_text, terms_json, keyword_flags, visited,
    closed_form, simplified_closed_form, algo, check_cf, is_new, hard, not_easy
";

impl MinerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > MINER_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: MINER_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Seed the table with empty unvisited rows for ids 1..=count.
    /// Idempotent; returns how many rows were actually inserted.
    pub fn seed_ids(&self, count: u32) -> Result<u64, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0u64;
        {
            let mut statement =
                tx.prepare("INSERT OR IGNORE INTO sequence (id) VALUES (?1)")?;
            for number in 1..=count {
                inserted += statement.execute([format_id(number)])? as u64;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Insert or refresh the fetched metadata for one id. Result columns
    /// (`visited`, `closed_form`, ...) are never touched here.
    pub fn upsert_raw(
        &self,
        seq: &ParsedSequence,
        flags: DerivedFlags,
    ) -> Result<(), StorageError> {
        let terms_json = serde_json::to_string(&seq.terms)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let keyword_flags = seq.keywords.join(",");
        self.conn.execute(
            "
            INSERT INTO sequence (id, name, raw_formula_text, terms_json, keyword_flags, hard, not_easy)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                raw_formula_text = excluded.raw_formula_text,
                terms_json = excluded.terms_json,
                keyword_flags = excluded.keyword_flags,
                hard = excluded.hard,
                not_easy = excluded.not_easy
            ",
            params![
                seq.id,
                seq.name,
                seq.formula_text,
                terms_json,
                keyword_flags,
                flags.hard as i64,
                flags.not_easy as i64
            ],
        )?;
        Ok(())
    }

    /// Ascending-id batch of unvisited ids. Ascending order keeps progress
    /// deterministic and resumable after an interruption.
    pub fn next_unvisited_batch(&self, limit: u32) -> Result<Vec<String>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT id FROM sequence WHERE visited = 0 ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = statement.query_map([limit], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Mark a record's analysis attempt complete and persist its outcome in
    /// one statement. Re-applying the same outcome leaves the row unchanged.
    pub fn mark_visited(&self, id: &str, outcome: &GuessOutcome) -> Result<(), StorageError> {
        match outcome {
            GuessOutcome::Found(found) => {
                self.conn.execute(
                    "
                    UPDATE sequence SET
                        visited = 1,
                        closed_form = ?2,
                        simplified_closed_form = ?3,
                        algo = ?4,
                        check_cf = ?5,
                        is_new = ?6
                    WHERE id = ?1
                    ",
                    params![
                        id,
                        found.formula,
                        found.simplified,
                        found.algo.as_str(),
                        found.verified as i64,
                        found.is_new as i64
                    ],
                )?;
            }
            GuessOutcome::NotFound | GuessOutcome::Skipped { .. } => {
                self.conn
                    .execute("UPDATE sequence SET visited = 1 WHERE id = ?1", [id])?;
            }
        }
        Ok(())
    }

    pub fn record(&self, id: &str) -> Result<Option<SequenceRecord>, StorageError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM sequence WHERE id = ?1");
        let record = self
            .conn
            .query_row(&sql, [id], row_to_record)
            .optional()?;
        Ok(record)
    }

    pub fn query(&self, filter: &RecordFilter) -> Result<Vec<SequenceRecord>, StorageError> {
        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM sequence WHERE visited = 1");
        let mut push_flag = |column: &str, value: Option<bool>| {
            if let Some(value) = value {
                sql.push_str(" AND ");
                sql.push_str(column);
                sql.push_str(if value { " = 1" } else { " = 0" });
            }
        };
        push_flag("hard", filter.hard);
        push_flag("not_easy", filter.not_easy);
        push_flag("is_new", filter.is_new);
        push_flag("check_cf", filter.check_cf);
        if let Some(found) = filter.found {
            sql.push_str(if found {
                " AND closed_form IS NOT NULL"
            } else {
                " AND closed_form IS NULL"
            });
        }
        sql.push_str(" ORDER BY id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map([], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn blacklist_add(&self, id: &str, reason: &str) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "INSERT OR IGNORE INTO blacklist (id, reason, added_at) VALUES (?1, ?2, ?3)",
            params![id, reason, Utc::now().to_rfc3339()],
        )?;
        Ok(changes > 0)
    }

    pub fn blacklist_remove(&self, id: &str) -> Result<bool, StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM blacklist WHERE id = ?1", [id])?;
        Ok(changes > 0)
    }

    pub fn blacklist_contains(&self, id: &str) -> Result<bool, StorageError> {
        let found = self
            .conn
            .query_row("SELECT 1 FROM blacklist WHERE id = ?1", [id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn blacklist_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut statement = self
            .conn
            .prepare("SELECT id FROM blacklist ORDER BY id ASC")?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn blacklist_entries(&self) -> Result<Vec<BlacklistEntry>, StorageError> {
        let mut statement = self
            .conn
            .prepare("SELECT id, reason, added_at FROM blacklist ORDER BY id ASC")?;
        let rows = statement.query_map([], |row| {
            let added_at = parse_timestamp(row.get::<_, String>(2)?).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
            Ok(BlacklistEntry {
                id: row.get(0)?,
                reason: row.get(1)?,
                added_at,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn insert_xref(
        &self,
        id_a: &str,
        id_b: &str,
        relation: XrefRelation,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "INSERT OR IGNORE INTO xref (id_a, id_b, relation) VALUES (?1, ?2, ?3)",
            params![id_a, id_b, relation.as_str()],
        )?;
        Ok(changes > 0)
    }

    pub fn xref_exists(&self, id_a: &str, id_b: &str) -> Result<bool, StorageError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM xref WHERE id_a = ?1 AND id_b = ?2",
                [id_a, id_b],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn xrefs(&self) -> Result<Vec<CrossReference>, StorageError> {
        let mut statement = self
            .conn
            .prepare("SELECT id_a, id_b, relation FROM xref ORDER BY id_a ASC, id_b ASC")?;
        let rows = statement.query_map([], |row| {
            let relation: String = row.get(2)?;
            let relation = relation.parse::<XrefRelation>().map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    Box::new(StorageError::Serialization(err)),
                )
            })?;
            Ok(CrossReference {
                id_a: row.get(0)?,
                id_b: row.get(1)?,
                relation,
            })
        })?;
        let mut xrefs = Vec::new();
        for row in rows {
            xrefs.push(row?);
        }
        Ok(xrefs)
    }

    /// All discovered closed forms, ascending by id, for the pairwise
    /// cross-reference pass.
    pub fn closed_forms(&self) -> Result<Vec<(String, String)>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT id, closed_form FROM sequence WHERE closed_form IS NOT NULL ORDER BY id ASC",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut forms = Vec::new();
        for row in rows {
            forms.push(row?);
        }
        Ok(forms)
    }

    /// Recompute the run counters from the table; used as a consistency
    /// check against the driver's in-memory accumulator.
    pub fn recompute_stats(&self) -> Result<MiningStats, StorageError> {
        let count = |sql: &str| -> Result<i64, StorageError> {
            Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
        };
        let processed = count("SELECT COUNT(*) FROM sequence WHERE visited = 1")?;
        let found = count(
            "SELECT COUNT(*) FROM sequence WHERE visited = 1 AND closed_form IS NOT NULL",
        )?;
        let new_found =
            count("SELECT COUNT(*) FROM sequence WHERE visited = 1 AND is_new = 1")?;
        Ok(MiningStats {
            processed: processed as u64,
            found: found as u64,
            new_found: new_found as u64,
        })
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

/// The blacklist as used during a run: loaded once into memory for O(1)
/// lookups, written through to the store on every addition so a later crash
/// cannot lose the entry.
#[derive(Debug, Default)]
pub struct Blacklist {
    entries: HashSet<String>,
}

impl Blacklist {
    pub fn load(store: &MinerStore) -> Result<Self, StorageError> {
        Ok(Self {
            entries: store.blacklist_ids()?.into_iter().collect(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn add(
        &mut self,
        store: &MinerStore,
        key: &str,
        reason: &str,
    ) -> Result<bool, StorageError> {
        store.blacklist_add(key, reason)?;
        Ok(self.entries.insert(key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<SequenceRecord> {
    let terms_json: Option<String> = row.get(3)?;
    let terms: Vec<i64> = match terms_json {
        Some(json) if !json.is_empty() => serde_json::from_str(&json).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?,
        _ => Vec::new(),
    };

    let keyword_flags: Option<String> = row.get(4)?;
    let keyword_flags = keyword_flags
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|kw| !kw.is_empty())
        .map(str::to_string)
        .collect();

    let algo: Option<String> = row.get(8)?;
    let algo = match algo {
        Some(value) => Some(value.parse().map_err(|err: String| {
            rusqlite::Error::FromSqlConversionFailure(
                8,
                rusqlite::types::Type::Text,
                Box::new(StorageError::Serialization(err)),
            )
        })?),
        None => None,
    };

    Ok(SequenceRecord {
        id: row.get(0)?,
        name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        raw_formula_text: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        terms,
        keyword_flags,
        visited: row.get::<_, i64>(5)? != 0,
        closed_form: row.get(6)?,
        simplified_closed_form: row.get(7)?,
        algo,
        check_cf: row.get::<_, i64>(9)? != 0,
        is_new: row.get::<_, i64>(10)? != 0,
        hard: row.get::<_, i64>(11)? != 0,
        not_easy: row.get::<_, i64>(12)? != 0,
    })
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
