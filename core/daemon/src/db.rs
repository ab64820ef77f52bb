//! SQLite persistence for plugin-sync-daemon.
//!
//! This is the single-writer store backing the daemon: entity state, processing
//! locks, error contexts, the global quota cache, and a bounded transition log.
//! Every multi-statement write runs in an IMMEDIATE transaction so the read that
//! validates a change and the write that applies it cannot interleave with
//! another writer.

use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use plugin_sync_protocol::{is_allowed, ErrorContext, PluginState};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;

const QUOTA_KEY: &str = "global";
const TRANSITION_LOG_MAX_ROWS: i64 = 1000;
/// Entity states that can always be derived again from upstream and the
/// host registry, so expired rows in these states may be pruned.
const PRUNABLE_STATES: [PluginState; 3] = [
    PluginState::Unknown,
    PluginState::NotPlugin,
    PluginState::Available,
];

pub struct Db {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    pub id: String,
    pub state: PluginState,
    pub metadata: Map<String, Value>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub entity_id: String,
    pub acquired_at: String,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl QuotaSnapshot {
    pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
        self.remaining == 0 && self.reset_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionLogRow {
    pub entity_id: String,
    pub from_state: String,
    pub to_state: String,
    pub accepted: bool,
    pub reason: Option<String>,
    pub source: String,
    pub recorded_at: String,
}

pub struct TransitionWrite<'a> {
    pub id: &'a str,
    pub target: PluginState,
    pub metadata: &'a Map<String, Value>,
    pub error: Option<&'a ErrorContext>,
    pub source: &'a str,
    pub force: bool,
    pub entity_ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Accepted {
        from: PluginState,
        to: PluginState,
    },
    Rejected {
        from: PluginState,
    },
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    /// Creates the entity at `unknown` if it has never been referenced.
    pub fn ensure_entity(
        &self,
        id: &str,
        now: DateTime<Utc>,
        entity_ttl_secs: u64,
    ) -> Result<EntityRecord, String> {
        self.with_connection(|conn| {
            insert_unknown_entity(conn, id, now, entity_ttl_secs)?;
            read_entity(conn, id)?.ok_or_else(|| format!("Entity {} vanished after insert", id))
        })
    }

    pub fn get_entity(&self, id: &str) -> Result<Option<EntityRecord>, String> {
        self.with_connection(|conn| read_entity(conn, id))
    }

    pub fn list_entities(&self) -> Result<Vec<EntityRecord>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, state, metadata, updated_at FROM entities ORDER BY id ASC")
                .map_err(|err| format!("Failed to prepare entities query: {}", err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(|err| format!("Failed to read entity rows: {}", err))?;

            let mut entities = Vec::new();
            for row in rows {
                let (id, state, metadata, updated_at) =
                    row.map_err(|err| format!("Failed to decode entity row: {}", err))?;
                entities.push(decode_entity(id, &state, &metadata, updated_at)?);
            }
            Ok(entities)
        })
    }

    /// Validates and applies a transition as one check-and-set.
    ///
    /// The current state is read inside the same IMMEDIATE transaction that
    /// writes the new one, and the UPDATE is conditioned on that state.
    pub fn apply_transition(
        &self,
        write: &TransitionWrite<'_>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| format!("Failed to begin transition: {}", err))?;

            insert_unknown_entity(&tx, write.id, now, write.entity_ttl_secs)?;
            let current = read_entity(&tx, write.id)?
                .ok_or_else(|| format!("Entity {} vanished during transition", write.id))?;
            let from = current.state;
            let recorded_at = timestamp(now);

            if !write.force && !is_allowed(from, write.target) {
                insert_log(
                    &tx,
                    write.id,
                    from,
                    write.target,
                    false,
                    Some("invalid_transition"),
                    write.source,
                    &recorded_at,
                )?;
                prune_transition_log(&tx)?;
                tx.commit()
                    .map_err(|err| format!("Failed to commit rejected transition: {}", err))?;
                return Ok(TransitionOutcome::Rejected { from });
            }

            let mut metadata = current.metadata;
            for (key, value) in write.metadata {
                metadata.insert(key.clone(), value.clone());
            }
            let metadata_json = serde_json::to_string(&metadata)
                .map_err(|err| format!("Failed to serialize metadata: {}", err))?;

            let changed = tx
                .execute(
                    "UPDATE entities SET state = ?2, metadata = ?3, updated_at = ?4, expires_at_ms = ?5 \
                     WHERE id = ?1 AND state = ?6",
                    params![
                        write.id,
                        write.target.as_str(),
                        metadata_json,
                        recorded_at,
                        expiry_ms(now, write.entity_ttl_secs),
                        from.as_str()
                    ],
                )
                .map_err(|err| format!("Failed to update entity state: {}", err))?;
            if changed != 1 {
                return Err(format!(
                    "Entity {} changed state concurrently; transition aborted",
                    write.id
                ));
            }

            match (write.target, write.error) {
                (PluginState::Error, Some(error)) => {
                    let payload = serde_json::to_string(error)
                        .map_err(|err| format!("Failed to serialize error context: {}", err))?;
                    tx.execute(
                        "INSERT INTO error_contexts (entity_id, kind, payload, recorded_at) \
                         VALUES (?1, ?2, ?3, ?4) \
                         ON CONFLICT(entity_id) DO UPDATE SET \
                            kind = excluded.kind, \
                            payload = excluded.payload, \
                            recorded_at = excluded.recorded_at",
                        params![write.id, error.kind.as_str(), payload, recorded_at],
                    )
                    .map_err(|err| format!("Failed to upsert error context: {}", err))?;
                }
                (PluginState::Error, None) => {
                    return Err(format!(
                        "Transition of {} to error requires an error context",
                        write.id
                    ));
                }
                _ => {
                    tx.execute(
                        "DELETE FROM error_contexts WHERE entity_id = ?1",
                        params![write.id],
                    )
                    .map_err(|err| format!("Failed to clear error context: {}", err))?;
                }
            }

            let reason = if write.force { Some("forced") } else { None };
            insert_log(
                &tx,
                write.id,
                from,
                write.target,
                true,
                reason,
                write.source,
                &recorded_at,
            )?;
            prune_transition_log(&tx)?;

            tx.commit()
                .map_err(|err| format!("Failed to commit transition: {}", err))?;
            Ok(TransitionOutcome::Accepted {
                from,
                to: write.target,
            })
        })
    }

    pub fn get_error_context(&self, id: &str) -> Result<Option<ErrorContext>, String> {
        self.with_connection(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM error_contexts WHERE entity_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| format!("Failed to query error context: {}", err))?;
            payload
                .map(|payload| {
                    serde_json::from_str(&payload)
                        .map_err(|err| format!("Failed to parse error context: {}", err))
                })
                .transpose()
        })
    }

    /// Atomic acquire: an expired row is removed and a fresh one inserted only
    /// if no live row remains, inside one IMMEDIATE transaction.
    pub fn try_acquire_lock(
        &self,
        id: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| format!("Failed to begin lock acquire: {}", err))?;
            tx.execute(
                "DELETE FROM locks WHERE entity_id = ?1 AND expires_at_ms <= ?2",
                params![id, now.timestamp_millis()],
            )
            .map_err(|err| format!("Failed to clear expired lock: {}", err))?;
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO locks (entity_id, acquired_at, ttl_secs, expires_at_ms) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        id,
                        timestamp(now),
                        ttl_secs as i64,
                        expiry_ms(now, ttl_secs)
                    ],
                )
                .map_err(|err| format!("Failed to insert lock: {}", err))?;
            tx.commit()
                .map_err(|err| format!("Failed to commit lock acquire: {}", err))?;
            Ok(inserted == 1)
        })
    }

    pub fn release_lock(&self, id: &str) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM locks WHERE entity_id = ?1", params![id])
                .map_err(|err| format!("Failed to release lock: {}", err))?;
            Ok(())
        })
    }

    /// Returns the live lock for `id`; expired rows are invisible.
    pub fn get_lock(&self, id: &str, now: DateTime<Utc>) -> Result<Option<LockInfo>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT entity_id, acquired_at, ttl_secs FROM locks \
                 WHERE entity_id = ?1 AND expires_at_ms > ?2",
                params![id, now.timestamp_millis()],
                |row| {
                    Ok(LockInfo {
                        entity_id: row.get(0)?,
                        acquired_at: row.get(1)?,
                        ttl_secs: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()
            .map_err(|err| format!("Failed to query lock: {}", err))
        })
    }

    pub fn record_quota(&self, quota: &QuotaSnapshot) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO quota_cache (key, remaining, limit_value, reset_at_ms, recorded_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(key) DO UPDATE SET \
                    remaining = excluded.remaining, \
                    limit_value = excluded.limit_value, \
                    reset_at_ms = excluded.reset_at_ms, \
                    recorded_at_ms = excluded.recorded_at_ms",
                params![
                    QUOTA_KEY,
                    quota.remaining as i64,
                    quota.limit as i64,
                    quota.reset_at.timestamp_millis(),
                    quota.recorded_at.timestamp_millis()
                ],
            )
            .map_err(|err| format!("Failed to record quota: {}", err))?;
            Ok(())
        })
    }

    /// Returns the cached quota unless it is older than `max_age_secs`, in which
    /// case it is treated as absent.
    pub fn get_quota(
        &self,
        now: DateTime<Utc>,
        max_age_secs: i64,
    ) -> Result<Option<QuotaSnapshot>, String> {
        let row = self.with_connection(|conn| {
            conn.query_row(
                "SELECT remaining, limit_value, reset_at_ms, recorded_at_ms FROM quota_cache WHERE key = ?1",
                params![QUOTA_KEY],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|err| format!("Failed to query quota cache: {}", err))
        })?;

        let Some((remaining, limit, reset_at_ms, recorded_at_ms)) = row else {
            return Ok(None);
        };
        let (Some(reset_at), Some(recorded_at)) = (from_millis(reset_at_ms), from_millis(recorded_at_ms))
        else {
            return Ok(None);
        };
        if now.signed_duration_since(recorded_at) > Duration::seconds(max_age_secs) {
            return Ok(None);
        }

        Ok(Some(QuotaSnapshot {
            remaining: remaining.max(0) as u64,
            limit: limit.max(0) as u64,
            reset_at,
            recorded_at,
        }))
    }

    /// Removes expired locks and expired, re-derivable entities that carry no
    /// live lock and no error context. Returns the number of entities removed.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, String> {
        let now_ms = now.timestamp_millis();
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM locks WHERE expires_at_ms <= ?1",
                params![now_ms],
            )
            .map_err(|err| format!("Failed to prune expired locks: {}", err))?;

            conn.execute(
                "DELETE FROM entities \
                 WHERE expires_at_ms <= ?1 \
                   AND state IN (?2, ?3, ?4) \
                   AND id NOT IN (SELECT entity_id FROM locks) \
                   AND id NOT IN (SELECT entity_id FROM error_contexts)",
                params![
                    now_ms,
                    PRUNABLE_STATES[0].as_str(),
                    PRUNABLE_STATES[1].as_str(),
                    PRUNABLE_STATES[2].as_str()
                ],
            )
            .map_err(|err| format!("Failed to prune expired entities: {}", err))
        })
    }

    pub fn recent_transitions(&self, limit: usize) -> Result<Vec<TransitionLogRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT entity_id, from_state, to_state, accepted, reason, source, recorded_at \
                     FROM transition_log ORDER BY seq DESC LIMIT ?1",
                )
                .map_err(|err| format!("Failed to prepare transition log query: {}", err))?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok(TransitionLogRow {
                        entity_id: row.get(0)?,
                        from_state: row.get(1)?,
                        to_state: row.get(2)?,
                        accepted: row.get::<_, i64>(3)? != 0,
                        reason: row.get(4)?,
                        source: row.get(5)?,
                        recorded_at: row.get(6)?,
                    })
                })
                .map_err(|err| format!("Failed to read transition log: {}", err))?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|err| format!("Failed to decode transition log row: {}", err))
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS entities (
                    id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    updated_at TEXT NOT NULL,
                    expires_at_ms INTEGER NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS locks (
                    entity_id TEXT PRIMARY KEY,
                    acquired_at TEXT NOT NULL,
                    ttl_secs INTEGER NOT NULL,
                    expires_at_ms INTEGER NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS error_contexts (
                    entity_id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    recorded_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS quota_cache (
                    key TEXT PRIMARY KEY,
                    remaining INTEGER NOT NULL,
                    limit_value INTEGER NOT NULL,
                    reset_at_ms INTEGER NOT NULL,
                    recorded_at_ms INTEGER NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS transition_log (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity_id TEXT NOT NULL,
                    from_state TEXT NOT NULL,
                    to_state TEXT NOT NULL,
                    accepted INTEGER NOT NULL,
                    reason TEXT,
                    source TEXT NOT NULL,
                    recorded_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_entities_expires ON entities(expires_at_ms);
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

fn insert_unknown_entity(
    conn: &Connection,
    id: &str,
    now: DateTime<Utc>,
    entity_ttl_secs: u64,
) -> Result<(), String> {
    conn.execute(
        "INSERT OR IGNORE INTO entities (id, state, metadata, updated_at, expires_at_ms) \
         VALUES (?1, ?2, '{}', ?3, ?4)",
        params![
            id,
            PluginState::Unknown.as_str(),
            timestamp(now),
            expiry_ms(now, entity_ttl_secs)
        ],
    )
    .map_err(|err| format!("Failed to insert entity: {}", err))?;
    Ok(())
}

fn read_entity(conn: &Connection, id: &str) -> Result<Option<EntityRecord>, String> {
    let row = conn
        .query_row(
            "SELECT id, state, metadata, updated_at FROM entities WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .map_err(|err| format!("Failed to query entity: {}", err))?;

    row.map(|(id, state, metadata, updated_at)| decode_entity(id, &state, &metadata, updated_at))
        .transpose()
}

fn decode_entity(
    id: String,
    state: &str,
    metadata: &str,
    updated_at: String,
) -> Result<EntityRecord, String> {
    let state = PluginState::from_str(state)
        .ok_or_else(|| format!("Entity {} has unknown state {:?}", id, state))?;
    let metadata = match serde_json::from_str::<Value>(metadata) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(err) => {
            tracing::warn!(entity = %id, error = %err, "Entity metadata unreadable; using empty map");
            Map::new()
        }
    };
    Ok(EntityRecord {
        id,
        state,
        metadata,
        updated_at,
    })
}

#[allow(clippy::too_many_arguments)]
fn insert_log(
    conn: &Connection,
    id: &str,
    from: PluginState,
    to: PluginState,
    accepted: bool,
    reason: Option<&str>,
    source: &str,
    recorded_at: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO transition_log (entity_id, from_state, to_state, accepted, reason, source, recorded_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            from.as_str(),
            to.as_str(),
            accepted as i64,
            reason,
            source,
            recorded_at
        ],
    )
    .map_err(|err| format!("Failed to insert transition log row: {}", err))?;
    Ok(())
}

/// Keeps only the newest `TRANSITION_LOG_MAX_ROWS` log rows.
fn prune_transition_log(conn: &Connection) -> Result<(), String> {
    conn.execute(
        "DELETE FROM transition_log WHERE seq NOT IN \
            (SELECT seq FROM transition_log ORDER BY seq DESC LIMIT ?1)",
        params![TRANSITION_LOG_MAX_ROWS],
    )
    .map_err(|err| format!("Failed to prune transition log: {}", err))?;
    Ok(())
}

pub fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn expiry_ms(now: DateTime<Utc>, ttl_secs: u64) -> i64 {
    now.timestamp_millis()
        .saturating_add((ttl_secs as i64).saturating_mul(1000))
}

fn from_millis(value: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(value).single()
}
