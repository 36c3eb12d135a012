//! # Stage: SQLite Store
//!
//! ## Responsibility
//! Durable rusqlite backend for [`ExperimentStore`]. Owns the schema, the
//! `(test_id, visitor_id)` uniqueness constraint that makes allocation safe
//! under concurrent first requests, and the transactions used for test
//! creation, rebalancing, and batched retention deletes.
//!
//! ## Guarantees
//! - One connection per store handle, serialized behind a `Mutex`. Several
//!   handles (or processes) may open the same file; WAL mode plus
//!   `busy_timeout` arbitrates between them
//! - Foreign keys are on: deleting a test cascades to every dependent row
//! - A unique-index violation on `ab_allocations` is reported as
//!   [`AllocationWrite::Conflict`]; every other SQLite error propagates

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{AllocationWrite, ExperimentStore, PurgedAllocations, TestInsert, VariantTally};
use crate::config::StorageConfig;
use crate::error::{EngineError, Result};
use crate::model::{
    Allocation, Conversion, NewConversion, PageId, Test, TestId, TestStatus, Variant, VariantId,
};

pub const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS ab_tests (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    page_id          INTEGER NOT NULL,
    name             TEXT    NOT NULL,
    status           TEXT    NOT NULL DEFAULT 'draft'
                     CHECK (status IN ('draft', 'running', 'paused', 'completed')),
    started_at       INTEGER,
    ended_at         INTEGER,
    confidence_level REAL    NOT NULL,
    min_sample_size  INTEGER NOT NULL,
    goals_json       TEXT    NOT NULL DEFAULT '[]',
    created_at       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ab_tests_page_status ON ab_tests (page_id, status);

CREATE TABLE IF NOT EXISTS ab_variants (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    test_id            INTEGER NOT NULL REFERENCES ab_tests (id) ON DELETE CASCADE,
    name               TEXT    NOT NULL,
    target             TEXT    NOT NULL,
    traffic_percentage INTEGER NOT NULL CHECK (traffic_percentage BETWEEN 0 AND 100),
    is_control         INTEGER NOT NULL DEFAULT 0,
    position           INTEGER NOT NULL,
    UNIQUE (test_id, name)
);

CREATE TABLE IF NOT EXISTS ab_allocations (
    test_id      INTEGER NOT NULL REFERENCES ab_tests (id) ON DELETE CASCADE,
    variant_id   INTEGER NOT NULL REFERENCES ab_variants (id) ON DELETE CASCADE,
    visitor_id   TEXT    NOT NULL,
    allocated_at INTEGER NOT NULL,
    UNIQUE (test_id, visitor_id)
);
CREATE INDEX IF NOT EXISTS idx_ab_allocations_variant ON ab_allocations (variant_id);
CREATE INDEX IF NOT EXISTS idx_ab_allocations_allocated_at ON ab_allocations (allocated_at);

CREATE TABLE IF NOT EXISTS ab_conversions (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    test_id         INTEGER NOT NULL REFERENCES ab_tests (id) ON DELETE CASCADE,
    variant_id      INTEGER NOT NULL REFERENCES ab_variants (id) ON DELETE CASCADE,
    visitor_id      TEXT    NOT NULL,
    conversion_type TEXT    NOT NULL,
    value           REAL,
    converted_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ab_conversions_variant ON ab_conversions (test_id, variant_id);
CREATE INDEX IF NOT EXISTS idx_ab_conversions_converted_at ON ab_conversions (converted_at);
";

const TEST_COLUMNS: &str = "id, page_id, name, status, started_at, ended_at, \
                            confidence_level, min_sample_size, goals_json, created_at";

const VARIANT_COLUMNS: &str = "id, test_id, name, target, traffic_percentage, is_control, position";

impl ToSql for TestStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TestStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: EngineError| FromSqlError::Other(Box::new(e)))
    }
}

/// rusqlite-backed experiment store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file in WAL mode.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(busy_timeout)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::with_connection(conn)
    }

    /// Private in-memory database, gone when the store is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::with_connection(conn)
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        if config.path.as_os_str() == ":memory:" {
            Self::open_in_memory()
        } else {
            Self::open(&config.path, Duration::from_millis(config.busy_timeout_ms))
        }
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite mid-statement.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn query_test(conn: &Connection, id: TestId) -> Result<Option<Test>> {
        let sql = format!("SELECT {TEST_COLUMNS} FROM ab_tests WHERE id = ?1");
        Ok(conn.query_row(&sql, [id], row_to_test).optional()?)
    }
}

fn row_to_test(row: &Row<'_>) -> rusqlite::Result<Test> {
    let goals_json: String = row.get(8)?;
    let goals = serde_json::from_str(&goals_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;
    Ok(Test {
        id: row.get(0)?,
        page_id: row.get(1)?,
        name: row.get(2)?,
        status: row.get(3)?,
        started_at_ms: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        ended_at_ms: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
        confidence_level: row.get(6)?,
        min_sample_size: row.get(7)?,
        goals,
        created_at_ms: row.get::<_, i64>(9)? as u64,
    })
}

fn row_to_variant(row: &Row<'_>) -> rusqlite::Result<Variant> {
    Ok(Variant {
        id: row.get(0)?,
        test_id: row.get(1)?,
        name: row.get(2)?,
        target: row.get(3)?,
        traffic_percentage: row.get(4)?,
        is_control: row.get(5)?,
        position: row.get(6)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

impl ExperimentStore for SqliteStore {
    fn create_test(&self, insert: &TestInsert<'_>) -> Result<(Test, Vec<Variant>)> {
        let goals_json = serde_json::to_string(insert.goals)?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO ab_tests
             (page_id, name, status, confidence_level, min_sample_size, goals_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                insert.page_id,
                insert.name,
                TestStatus::Draft,
                insert.confidence_level,
                insert.min_sample_size,
                goals_json,
                insert.created_at_ms as i64,
            ],
        )?;
        let test_id = tx.last_insert_rowid();

        let mut variants = Vec::with_capacity(insert.variants.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ab_variants
                 (test_id, name, target, traffic_percentage, is_control, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (position, v) in insert.variants.iter().enumerate() {
                let position = position as u32;
                stmt.execute(params![
                    test_id,
                    v.name,
                    v.target,
                    v.traffic_percentage,
                    v.is_control,
                    position,
                ])
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        EngineError::InvalidConfig(format!("duplicate variant name '{}'", v.name))
                    } else {
                        EngineError::from(e)
                    }
                })?;
                variants.push(Variant {
                    id: tx.last_insert_rowid(),
                    test_id,
                    name: v.name.clone(),
                    target: v.target.clone(),
                    traffic_percentage: v.traffic_percentage,
                    is_control: v.is_control,
                    position,
                });
            }
        }
        tx.commit()?;

        let test = Test {
            id: test_id,
            page_id: insert.page_id,
            name: insert.name.to_string(),
            status: TestStatus::Draft,
            started_at_ms: None,
            ended_at_ms: None,
            confidence_level: insert.confidence_level,
            min_sample_size: insert.min_sample_size,
            goals: insert.goals.to_vec(),
            created_at_ms: insert.created_at_ms,
        };
        Ok((test, variants))
    }

    fn get_test(&self, id: TestId) -> Result<Option<Test>> {
        Self::query_test(&self.conn(), id)
    }

    fn tests_for_page(&self, page_id: PageId, status: Option<TestStatus>) -> Result<Vec<Test>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {TEST_COLUMNS} FROM ab_tests
             WHERE page_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let tests = stmt
            .query_map(params![page_id, status], row_to_test)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tests)
    }

    fn update_status(&self, id: TestId, status: TestStatus, now_ms: u64) -> Result<Option<Test>> {
        let conn = self.conn();
        let now = now_ms as i64;
        let changed = match status {
            TestStatus::Running => conn.execute(
                "UPDATE ab_tests SET status = ?2, started_at = COALESCE(started_at, ?3) WHERE id = ?1",
                params![id, status, now],
            )?,
            TestStatus::Completed => conn.execute(
                "UPDATE ab_tests SET status = ?2, ended_at = ?3 WHERE id = ?1",
                params![id, status, now],
            )?,
            TestStatus::Draft | TestStatus::Paused => conn.execute(
                "UPDATE ab_tests SET status = ?2 WHERE id = ?1",
                params![id, status],
            )?,
        };
        if changed == 0 {
            return Ok(None);
        }
        Self::query_test(&conn, id)
    }

    fn delete_test(&self, id: TestId) -> Result<bool> {
        let deleted = self.conn().execute("DELETE FROM ab_tests WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    fn variants(&self, test_id: TestId) -> Result<Vec<Variant>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {VARIANT_COLUMNS} FROM ab_variants WHERE test_id = ?1 ORDER BY position, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let variants = stmt
            .query_map([test_id], row_to_variant)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(variants)
    }

    fn get_variant(&self, id: VariantId) -> Result<Option<Variant>> {
        let conn = self.conn();
        let sql = format!("SELECT {VARIANT_COLUMNS} FROM ab_variants WHERE id = ?1");
        Ok(conn.query_row(&sql, [id], row_to_variant).optional()?)
    }

    fn set_traffic(&self, test_id: TestId, split: &[(VariantId, u8)]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for &(variant_id, pct) in split {
            let updated = tx.execute(
                "UPDATE ab_variants SET traffic_percentage = ?3 WHERE id = ?1 AND test_id = ?2",
                params![variant_id, test_id, pct],
            )?;
            if updated == 0 {
                return Err(EngineError::VariantNotFound(variant_id));
            }
        }
        let total: i64 = tx.query_row(
            "SELECT COALESCE(SUM(traffic_percentage), 0) FROM ab_variants WHERE test_id = ?1",
            [test_id],
            |row| row.get(0),
        )?;
        if total != 100 {
            return Err(EngineError::InvalidTrafficSplit { total: total as u32 });
        }
        tx.commit()?;
        Ok(())
    }

    fn find_allocation(&self, test_id: TestId, visitor_id: &str) -> Result<Option<Allocation>> {
        let conn = self.conn();
        let allocation = conn
            .query_row(
                "SELECT test_id, variant_id, visitor_id, allocated_at
                 FROM ab_allocations WHERE test_id = ?1 AND visitor_id = ?2",
                params![test_id, visitor_id],
                |row| {
                    Ok(Allocation {
                        test_id: row.get(0)?,
                        variant_id: row.get(1)?,
                        visitor_id: row.get(2)?,
                        allocated_at_ms: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(allocation)
    }

    fn insert_allocation(&self, allocation: &Allocation) -> Result<AllocationWrite> {
        let result = self.conn().execute(
            "INSERT INTO ab_allocations (test_id, variant_id, visitor_id, allocated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                allocation.test_id,
                allocation.variant_id,
                allocation.visitor_id,
                allocation.allocated_at_ms as i64,
            ],
        );
        match result {
            Ok(_) => Ok(AllocationWrite::Inserted),
            Err(e) if is_unique_violation(&e) => {
                debug!(
                    test_id = allocation.test_id,
                    visitor_id = %allocation.visitor_id,
                    "allocation slot already taken"
                );
                Ok(AllocationWrite::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn insert_conversion(&self, conversion: &NewConversion) -> Result<Conversion> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO ab_conversions
             (test_id, variant_id, visitor_id, conversion_type, value, converted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversion.test_id,
                conversion.variant_id,
                conversion.visitor_id,
                conversion.conversion_type,
                conversion.value,
                conversion.converted_at_ms as i64,
            ],
        )?;
        Ok(Conversion {
            id: conn.last_insert_rowid(),
            test_id: conversion.test_id,
            variant_id: conversion.variant_id,
            visitor_id: conversion.visitor_id.clone(),
            conversion_type: conversion.conversion_type.clone(),
            value: conversion.value,
            converted_at_ms: conversion.converted_at_ms,
        })
    }

    fn tallies(&self, test_id: TestId) -> Result<Vec<VariantTally>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT v.id,
                    (SELECT COUNT(DISTINCT a.visitor_id) FROM ab_allocations a
                      WHERE a.test_id = v.test_id AND a.variant_id = v.id),
                    (SELECT COUNT(DISTINCT c.visitor_id) FROM ab_conversions c
                       JOIN ab_allocations a
                         ON a.test_id = c.test_id AND a.visitor_id = c.visitor_id
                        AND a.variant_id = c.variant_id
                      WHERE c.test_id = v.test_id AND c.variant_id = v.id),
                    (SELECT COUNT(*) FROM ab_conversions c
                      WHERE c.test_id = v.test_id AND c.variant_id = v.id),
                    (SELECT COALESCE(SUM(c.value), 0.0) FROM ab_conversions c
                      WHERE c.test_id = v.test_id AND c.variant_id = v.id)
             FROM ab_variants v
             WHERE v.test_id = ?1
             ORDER BY v.position, v.id",
        )?;
        let tallies = stmt
            .query_map([test_id], |row| {
                Ok(VariantTally {
                    variant_id: row.get(0)?,
                    visitors: row.get::<_, i64>(1)? as u64,
                    converted_visitors: row.get::<_, i64>(2)? as u64,
                    conversion_events: row.get::<_, i64>(3)? as u64,
                    total_value: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tallies)
    }

    fn delete_conversions_before(&self, cutoff_ms: u64, limit: usize) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM ab_conversions WHERE id IN (
                 SELECT id FROM ab_conversions WHERE converted_at < ?1 LIMIT ?2
             )",
            params![cutoff_ms as i64, limit as i64],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    fn delete_allocations_before(&self, cutoff_ms: u64, limit: usize) -> Result<PurgedAllocations> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let batch: Vec<(i64, TestId, String)> = {
            let mut stmt = tx.prepare(
                "SELECT rowid, test_id, visitor_id FROM ab_allocations WHERE allocated_at < ?1 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![cutoff_ms as i64, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut purged = PurgedAllocations::default();
        {
            let mut delete_conversions =
                tx.prepare("DELETE FROM ab_conversions WHERE test_id = ?1 AND visitor_id = ?2")?;
            let mut delete_allocation = tx.prepare("DELETE FROM ab_allocations WHERE rowid = ?1")?;
            for (rowid, test_id, visitor_id) in &batch {
                purged.conversions += delete_conversions.execute(params![test_id, visitor_id])?;
                purged.allocations += delete_allocation.execute([rowid])?;
            }
        }
        tx.commit()?;
        Ok(purged)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
