// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The persistent result cache.
//!
//! Content-addressed store of `(object, filter, input attribute set) →
//! (verdict, output attribute set)` backed by SQLite. Entries are
//! write-once; replay validity rests on filter determinism: a cached
//! entry applies to an object state whenever every attribute the filter
//! read still carries the signature recorded at insert time.
//!
//! `current_attrs` is a TEMP table scoped to this connection and
//! partitioned by query id: it tracks the attribute signatures the
//! running search has accepted for the in-flight object, and is what the
//! stage-1 subset lookup matches against.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::sig::{AttrSigSet, Signature};

const OCACHE_DB_NAME: &str = "ocache.db";

const SCHEMA: &str = "
BEGIN;
CREATE TABLE IF NOT EXISTS cache (
    cache_entry INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    create_time TEXT DEFAULT CURRENT_TIMESTAMP,
    filter_sig  BLOB NOT NULL,
    object_sig  BLOB NOT NULL,
    iattr_sig   BLOB NOT NULL,
    confidence  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS filter_object_idx ON cache (filter_sig, object_sig);

CREATE TABLE IF NOT EXISTS attrs (
    attr_id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    name    TEXT NOT NULL,
    sig     BLOB NOT NULL,
    value   BLOB,
    UNIQUE (name, sig)
);

CREATE TABLE IF NOT EXISTS input_attrs (
    cache_entry INTEGER,
    attr_id     INTEGER,
    PRIMARY KEY (cache_entry, attr_id) ON CONFLICT IGNORE
);
CREATE INDEX IF NOT EXISTS input_attr_idx ON input_attrs (attr_id);

CREATE TABLE IF NOT EXISTS output_attrs (
    cache_entry INTEGER,
    attr_id     INTEGER,
    PRIMARY KEY (cache_entry, attr_id) ON CONFLICT IGNORE
);
CREATE INDEX IF NOT EXISTS output_attr_idx ON output_attrs (cache_entry);

CREATE TABLE IF NOT EXISTS initial_attrs (
    object_sig  BLOB,
    attr_id     INTEGER,
    PRIMARY KEY (object_sig, attr_id) ON CONFLICT IGNORE
);
CREATE INDEX IF NOT EXISTS initial_attr_idx ON initial_attrs (object_sig);

CREATE TEMP TABLE current_attrs (
    query_id    INTEGER,
    attr_id     INTEGER,
    PRIMARY KEY (query_id, attr_id) ON CONFLICT IGNORE
);
CREATE INDEX current_attr_idx ON current_attrs (query_id);
COMMIT;
";

/// A stage-1 hit: the verdict of a prior identical execution.
#[derive(Debug, Clone, Copy)]
pub struct CacheHit {
    pub entry_id: i64,
    pub confidence: i32,
    pub iattr_sig: Signature,
}

/// One output attribute of a cached execution, with its bytes when they
/// were captured at insert time.
#[derive(Debug, Clone)]
pub struct CachedAttr {
    pub name: String,
    pub sig: Signature,
    pub value: Option<Vec<u8>>,
}

pub struct CacheDb {
    conn: Connection,
}

impl CacheDb {
    /// Open (or create) `<cache_dir>/ocache.db` and install the schema.
    pub fn open(cache_dir: &Path) -> Result<Self> {
        Self::open_at(&cache_dir.join(OCACHE_DB_NAME))
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn open_at(db_file: &Path) -> Result<Self> {
        let conn = Connection::open(db_file)
            .with_context(|| format!("cannot open result cache at {db_file:?}"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)
            .context("result cache schema initialization failed")?;
        Ok(Self { conn })
    }

    /// Stage-1 lookup: find an entry for `(object, filter)` whose input
    /// attribute set is a subset of this query's `current_attrs`. By the
    /// determinism invariant any match is correct, so the first row wins.
    pub fn lookup(
        &self,
        object_sig: &Signature,
        filter_sig: &Signature,
        query_id: i64,
    ) -> Result<Option<CacheHit>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT cache_entry, confidence, iattr_sig FROM cache
               WHERE object_sig = ?1 AND filter_sig = ?2 AND
               cache_entry NOT IN
               (SELECT input_attrs.cache_entry FROM input_attrs, cache
                  WHERE cache.cache_entry = input_attrs.cache_entry AND
                  cache.object_sig = ?1 AND cache.filter_sig = ?2 AND
                  input_attrs.attr_id NOT IN
                  (SELECT attr_id FROM current_attrs WHERE query_id = ?3))
               LIMIT 1",
        )?;
        let hit = stmt
            .query_row(
                params![object_sig.as_bytes(), filter_sig.as_bytes(), query_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i32>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                },
            )
            .optional()?;

        Ok(match hit {
            Some((entry_id, confidence, raw)) => Some(CacheHit {
                entry_id,
                confidence,
                iattr_sig: sig_from_blob(&raw)?,
            }),
            None => None,
        })
    }

    /// Extend this query's `current_attrs` with a hit's output set: the
    /// search now behaves as if the filter had run and produced them.
    pub fn combine_attr_set(&self, query_id: i64, entry_id: i64) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO current_attrs (query_id, attr_id)
               SELECT ?1, attr_id FROM output_attrs WHERE cache_entry = ?2",
        )?;
        stmt.execute(params![query_id, entry_id])?;
        Ok(())
    }

    /// The output attributes of an entry, for replaying onto an object
    /// that passed by cache alone.
    pub fn output_attrs(&self, entry_id: i64) -> Result<Vec<CachedAttr>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT attrs.name, attrs.sig, attrs.value
               FROM output_attrs JOIN attrs USING (attr_id)
               WHERE output_attrs.cache_entry = ?1",
        )?;
        let rows = stmt.query_map(params![entry_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Option<Vec<u8>>>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (name, raw_sig, value) = row?;
            out.push(CachedAttr {
                name,
                sig: sig_from_blob(&raw_sig)?,
                value,
            });
        }
        Ok(out)
    }

    /// Record the attribute signatures an object carried when first
    /// fetched, before any filter ran.
    pub fn set_init_attrs(&mut self, object_sig: &Signature, attrs: &AttrSigSet) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (name, sig) in attrs.iter() {
            tx.prepare_cached("INSERT OR IGNORE INTO attrs (name, sig) VALUES (?1, ?2)")?
                .execute(params![name, sig.as_bytes()])?;
            tx.prepare_cached(
                "INSERT OR IGNORE INTO initial_attrs (object_sig, attr_id)
                   SELECT ?1, attr_id FROM attrs WHERE name = ?2 AND sig = ?3",
            )?
            .execute(params![object_sig.as_bytes(), name, sig.as_bytes()])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Reset this query's `current_attrs` and seed it from the object's
    /// recorded initial set. Returns how many attributes were seeded;
    /// zero means the object was never seen and its current attributes
    /// should be captured via [`CacheDb::set_init_attrs`] first.
    pub fn prime_current_attrs(&mut self, query_id: i64, object_sig: &Signature) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.prepare_cached("DELETE FROM current_attrs WHERE query_id = ?1")?
            .execute(params![query_id])?;
        let seeded = tx
            .prepare_cached(
                "INSERT OR IGNORE INTO current_attrs (query_id, attr_id)
                   SELECT ?1, attr_id FROM initial_attrs WHERE object_sig = ?2",
            )?
            .execute(params![query_id, object_sig.as_bytes()])?;
        tx.commit()?;
        Ok(seeded)
    }

    /// Forget a query's `current_attrs` rows once its search stops.
    pub fn drop_query(&self, query_id: i64) -> Result<()> {
        self.conn
            .prepare_cached("DELETE FROM current_attrs WHERE query_id = ?1")?
            .execute(params![query_id])?;
        Ok(())
    }

    /// Stage-2 insertion: intern the input/output attribute sets, write
    /// the entry, and fold the outputs into this query's `current_attrs`.
    /// Output attribute bytes are captured when provided so later cache
    /// passes can replay them.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_entry(
        &mut self,
        object_sig: &Signature,
        filter_sig: &Signature,
        confidence: i32,
        query_id: i64,
        input: &AttrSigSet,
        output: &AttrSigSet,
        output_values: &[(String, Vec<u8>)],
    ) -> Result<i64> {
        let iattr_sig = input.signature();
        let tx = self.conn.transaction()?;

        tx.prepare_cached(
            "INSERT INTO cache (filter_sig, object_sig, iattr_sig, confidence)
               VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![
            filter_sig.as_bytes(),
            object_sig.as_bytes(),
            iattr_sig.as_bytes(),
            confidence
        ])?;
        let entry_id = tx.last_insert_rowid();

        for (name, sig) in input.iter() {
            tx.prepare_cached("INSERT OR IGNORE INTO attrs (name, sig) VALUES (?1, ?2)")?
                .execute(params![name, sig.as_bytes()])?;
            tx.prepare_cached(
                "INSERT OR IGNORE INTO input_attrs (cache_entry, attr_id)
                   SELECT ?1, attr_id FROM attrs WHERE name = ?2 AND sig = ?3",
            )?
            .execute(params![entry_id, name, sig.as_bytes()])?;
        }

        for (name, sig) in output.iter() {
            let value = output_values
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_slice());
            tx.prepare_cached(
                "INSERT OR IGNORE INTO attrs (name, sig, value) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![name, sig.as_bytes(), value])?;
            tx.prepare_cached(
                "INSERT OR IGNORE INTO output_attrs (cache_entry, attr_id)
                   SELECT ?1, attr_id FROM attrs WHERE name = ?2 AND sig = ?3",
            )?
            .execute(params![entry_id, name, sig.as_bytes()])?;
            tx.prepare_cached(
                "INSERT OR IGNORE INTO current_attrs (query_id, attr_id)
                   SELECT ?1, attr_id FROM attrs WHERE name = ?2 AND sig = ?3",
            )?
            .execute(params![query_id, name, sig.as_bytes()])?;
        }

        tx.commit()?;
        Ok(entry_id)
    }

    /// Fold an attribute the engine just observed (read during an actual
    /// execution) into this query's `current_attrs`.
    pub fn add_current_attr(&self, query_id: i64, name: &str, sig: &Signature) -> Result<()> {
        self.conn
            .prepare_cached("INSERT OR IGNORE INTO attrs (name, sig) VALUES (?1, ?2)")?
            .execute(params![name, sig.as_bytes()])?;
        self.conn
            .prepare_cached(
                "INSERT OR IGNORE INTO current_attrs (query_id, attr_id)
                   SELECT ?1, attr_id FROM attrs WHERE name = ?2 AND sig = ?3",
            )?
            .execute(params![query_id, name, sig.as_bytes()])?;
        Ok(())
    }
}

fn sig_from_blob(raw: &[u8]) -> Result<Signature> {
    let mut out = [0u8; crate::sig::SIG_LEN];
    anyhow::ensure!(
        raw.len() == out.len(),
        "corrupt signature blob of {} bytes in result cache",
        raw.len()
    );
    out.copy_from_slice(raw);
    Ok(Signature(out))
}
