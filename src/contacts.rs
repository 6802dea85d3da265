// MESHPATH: Graph-Assisted Resolution of LoRa Mesh Routing Traces
// Copyright (C) 2025 The meshpath developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Contact-store types and queries.
//!
//! The resolver consumes the tracking table of known nodes through the
//! narrow [`ContactStore`] interface; [`SqliteContactStore`] is the
//! production implementation. Queries open one connection each and run on
//! the blocking pool so the decoder task only suspends, never blocks.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::{scoring, Prefix};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("store task failed: {0}")]
    Task(String),
}

/// Role of a known node. Only repeaters and roomservers take part in
/// routing, so everything else is ignored by the candidate queries.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum NodeRole {
    Repeater,
    Roomserver,
    Client,
    #[strum(default)]
    Other(String),
}

/// A known node as tracked by the contact store.
#[derive(Debug, Clone, PartialEq)]
pub struct RepeaterRecord {
    pub public_key: String,
    pub name: String,
    pub role: NodeRole,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub last_heard: Option<DateTime<Utc>>,
    pub last_advert_timestamp: Option<DateTime<Utc>>,
    pub advert_count: u32,
    pub signal_strength: Option<f64>,
    /// Present only when the bot heard this node directly.
    pub snr: Option<f64>,
    pub hop_count: Option<u32>,
    pub is_starred: bool,
    pub is_active: bool,
}

impl RepeaterRecord {
    pub fn prefix(&self) -> Option<Prefix> {
        Prefix::of_key(&self.public_key)
    }

    /// Most recent of last-heard and last-advert; recency uses the max.
    pub fn most_recent_activity(&self) -> Option<DateTime<Utc>> {
        match (self.last_heard, self.last_advert_timestamp) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Valid coordinates, treating `(0, 0)` as withheld.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        scoring::valid_coordinates(self.latitude, self.longitude)
    }
}

/// A path historically observed terminating at some node, as recorded by
/// the passive packet observer. Used as collision-breaking evidence.
#[derive(Debug, Clone)]
pub struct ObservedPath {
    pub path_hex: String,
    pub observation_count: u32,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ObservedPath {
    /// The path split into its two-digit prefix tokens. Malformed stored
    /// hex yields no tokens rather than an error.
    pub fn prefixes(&self) -> Vec<Prefix> {
        self.path_hex
            .as_bytes()
            .chunks_exact(2)
            .filter_map(|pair| std::str::from_utf8(pair).ok())
            .filter_map(Prefix::parse)
            .collect()
    }
}

/// An entry of the radio's live contact list, consulted only when the
/// persistent store has no candidates for a prefix.
#[derive(Debug, Clone)]
pub struct LiveContact {
    pub name: String,
    pub public_key: String,
}

/// The radio's in-memory contact cache.
pub trait LiveContacts: Send + Sync {
    /// All repeater contacts whose public key starts with `prefix`.
    fn repeaters_matching(&self, prefix: Prefix) -> Vec<LiveContact>;
}

/// Narrow query interface the resolver and learner need from the tracking
/// datastore. All calls are suspension points for the decoder task.
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Repeaters and roomservers whose key starts with `prefix`, newest
    /// first, restricted to the last `max_age_days` (0 = unrestricted).
    async fn repeaters_by_prefix(
        &self,
        prefix: Prefix,
        max_age_days: i64,
    ) -> Result<Vec<RepeaterRecord>, StoreError>;

    /// Coordinates of a routing node identified by its full public key.
    async fn location_by_public_key(
        &self,
        public_key: &str,
    ) -> Result<Option<(f64, f64)>, StoreError>;

    /// Best-known coordinates for a prefix: starred entries first, then the
    /// most recently heard, within the configured age window.
    async fn best_location_for_prefix(
        &self,
        prefix: Prefix,
        max_age_days: i64,
    ) -> Result<Option<(f64, f64)>, StoreError>;

    /// Coordinates of an arbitrary node (any role), e.g. a message sender.
    async fn sender_location(&self, public_key: &str) -> Result<Option<(f64, f64)>, StoreError>;

    /// Advert paths observed terminating at `public_key`, strongest first.
    async fn observed_paths_for_key(
        &self,
        public_key: &str,
    ) -> Result<Vec<ObservedPath>, StoreError>;
}

/// Timestamp format used throughout the SQLite tables. Keeping one format
/// makes the textual `>=` comparisons in the queries well-defined.
pub(crate) fn timestamp_to_sql(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored timestamp; malformed values degrade to `None` with a
/// debug log and never interrupt a decode.
pub(crate) fn timestamp_from_sql(text: Option<String>) -> Option<DateTime<Utc>> {
    let text = text?;
    match DateTime::parse_from_rfc3339(&text) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            log::debug!("ignoring malformed timestamp {text:?}: {e}");
            None
        }
    }
}

/// Cutoff timestamp for an age window of `days` days, if one is configured.
pub(crate) fn age_cutoff(days: i64) -> Option<String> {
    (days > 0).then(|| timestamp_to_sql(Utc::now() - Duration::days(days)))
}

const REPEATER_COLUMNS: &str = "name, public_key, role, latitude, longitude, city, state, \
     country, last_heard, last_advert_timestamp, advert_count, signal_strength, snr, \
     hop_count, is_starred, is_active";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RepeaterRecord> {
    let role: String = row.get("role")?;
    Ok(RepeaterRecord {
        name: row.get("name")?,
        public_key: row.get("public_key")?,
        role: NodeRole::from_str(&role).unwrap_or(NodeRole::Other(role)),
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
        city: row.get("city")?,
        state: row.get("state")?,
        country: row.get("country")?,
        last_heard: timestamp_from_sql(row.get("last_heard")?),
        last_advert_timestamp: timestamp_from_sql(row.get("last_advert_timestamp")?),
        advert_count: row.get("advert_count")?,
        signal_strength: row.get("signal_strength")?,
        snr: row.get("snr")?,
        hop_count: row.get("hop_count")?,
        is_starred: row.get("is_starred")?,
        is_active: row.get("is_active")?,
    })
}

/// SQLite-backed contact store. Opens one connection per query.
#[derive(Debug, Clone)]
pub struct SqliteContactStore {
    path: PathBuf,
}

impl SqliteContactStore {
    /// Open (creating tables if necessary) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS contacts (
                 public_key TEXT PRIMARY KEY,
                 name TEXT NOT NULL,
                 role TEXT NOT NULL,
                 latitude REAL,
                 longitude REAL,
                 city TEXT,
                 state TEXT,
                 country TEXT,
                 last_heard TEXT,
                 last_advert_timestamp TEXT,
                 advert_count INTEGER NOT NULL DEFAULT 0,
                 signal_strength REAL,
                 snr REAL,
                 hop_count INTEGER,
                 is_starred INTEGER NOT NULL DEFAULT 0,
                 is_active INTEGER NOT NULL DEFAULT 1
             );
             CREATE TABLE IF NOT EXISTS observed_paths (
                 public_key TEXT NOT NULL,
                 path_hex TEXT NOT NULL,
                 packet_type TEXT NOT NULL,
                 observation_count INTEGER NOT NULL DEFAULT 1,
                 last_seen TEXT,
                 from_prefix TEXT,
                 to_prefix TEXT,
                 PRIMARY KEY (public_key, path_hex, packet_type)
             );",
        )?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace a tracked contact. Used by the enclosing bot's
    /// advertisement observer; the resolver itself only reads.
    pub fn insert_contact(&self, record: &RepeaterRecord) -> Result<(), StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "INSERT OR REPLACE INTO contacts (public_key, name, role, latitude, longitude, \
             city, state, country, last_heard, last_advert_timestamp, advert_count, \
             signal_strength, snr, hop_count, is_starred, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            rusqlite::params![
                record.public_key,
                record.name,
                record.role.to_string(),
                record.latitude,
                record.longitude,
                record.city,
                record.state,
                record.country,
                record.last_heard.map(timestamp_to_sql),
                record.last_advert_timestamp.map(timestamp_to_sql),
                record.advert_count,
                record.signal_strength,
                record.snr,
                record.hop_count,
                record.is_starred,
                record.is_active,
            ],
        )?;
        Ok(())
    }

    /// Record one observation of an advert path terminating at `public_key`.
    pub fn record_observed_path(
        &self,
        public_key: &str,
        path: &[Prefix],
        from_prefix: Option<Prefix>,
        to_prefix: Option<Prefix>,
    ) -> Result<(), StoreError> {
        let path_hex: String = path.iter().map(|p| p.as_str()).collect();
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "INSERT INTO observed_paths \
             (public_key, path_hex, packet_type, observation_count, last_seen, from_prefix, to_prefix)
             VALUES (?1, ?2, 'advert', 1, ?3, ?4, ?5)
             ON CONFLICT (public_key, path_hex, packet_type) DO UPDATE SET
                 observation_count = observation_count + 1,
                 last_seen = excluded.last_seen",
            rusqlite::params![
                public_key.to_ascii_lowercase(),
                path_hex,
                timestamp_to_sql(Utc::now()),
                from_prefix.map(|p| p.as_str().to_string()),
                to_prefix.map(|p| p.as_str().to_string()),
            ],
        )?;
        Ok(())
    }

    /// Run `f` with a fresh connection on the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl ContactStore for SqliteContactStore {
    async fn repeaters_by_prefix(
        &self,
        prefix: Prefix,
        max_age_days: i64,
    ) -> Result<Vec<RepeaterRecord>, StoreError> {
        let pattern = format!("{prefix}%");
        let cutoff = age_cutoff(max_age_days);
        self.with_connection(move |conn| {
            let rows = match &cutoff {
                Some(cutoff) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {REPEATER_COLUMNS} FROM contacts
                         WHERE public_key LIKE ?1 AND role IN ('repeater', 'roomserver')
                           AND ((last_advert_timestamp IS NOT NULL AND last_advert_timestamp >= ?2)
                             OR (last_advert_timestamp IS NULL AND last_heard >= ?2))
                         ORDER BY COALESCE(last_advert_timestamp, last_heard) DESC"
                    ))?;
                    let rows = stmt
                        .query_map(rusqlite::params![pattern, cutoff], row_to_record)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {REPEATER_COLUMNS} FROM contacts
                         WHERE public_key LIKE ?1 AND role IN ('repeater', 'roomserver')
                         ORDER BY COALESCE(last_advert_timestamp, last_heard) DESC"
                    ))?;
                    let rows = stmt
                        .query_map(rusqlite::params![pattern], row_to_record)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };
            Ok(rows)
        })
        .await
    }

    async fn location_by_public_key(
        &self,
        public_key: &str,
    ) -> Result<Option<(f64, f64)>, StoreError> {
        let key = public_key.to_ascii_lowercase();
        self.with_connection(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT latitude, longitude FROM contacts
                     WHERE public_key = ?1
                       AND latitude IS NOT NULL AND longitude IS NOT NULL
                       AND latitude != 0 AND longitude != 0
                       AND role IN ('repeater', 'roomserver')
                     ORDER BY is_starred DESC, COALESCE(last_advert_timestamp, last_heard) DESC
                     LIMIT 1",
                    [&key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })
        .await
    }

    async fn best_location_for_prefix(
        &self,
        prefix: Prefix,
        max_age_days: i64,
    ) -> Result<Option<(f64, f64)>, StoreError> {
        let pattern = format!("{prefix}%");
        let cutoff = age_cutoff(max_age_days);
        self.with_connection(move |conn| {
            let base = "SELECT latitude, longitude FROM contacts
                 WHERE public_key LIKE ?1
                   AND latitude IS NOT NULL AND longitude IS NOT NULL
                   AND latitude != 0 AND longitude != 0
                   AND role IN ('repeater', 'roomserver')";
            let order = "ORDER BY is_starred DESC, \
                 COALESCE(last_advert_timestamp, last_heard) DESC LIMIT 1";
            let found = match &cutoff {
                Some(cutoff) => conn
                    .query_row(
                        &format!(
                            "{base}
                             AND ((last_advert_timestamp IS NOT NULL AND last_advert_timestamp >= ?2)
                               OR (last_advert_timestamp IS NULL AND last_heard >= ?2))
                             {order}"
                        ),
                        rusqlite::params![pattern, cutoff],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?,
                None => conn
                    .query_row(
                        &format!("{base} {order}"),
                        rusqlite::params![pattern],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?,
            };
            Ok(found)
        })
        .await
    }

    async fn sender_location(&self, public_key: &str) -> Result<Option<(f64, f64)>, StoreError> {
        let key = public_key.to_ascii_lowercase();
        self.with_connection(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT latitude, longitude FROM contacts
                     WHERE public_key = ?1
                       AND latitude IS NOT NULL AND longitude IS NOT NULL
                       AND latitude != 0 AND longitude != 0
                     ORDER BY COALESCE(last_advert_timestamp, last_heard) DESC
                     LIMIT 1",
                    [&key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })
        .await
    }

    async fn observed_paths_for_key(
        &self,
        public_key: &str,
    ) -> Result<Vec<ObservedPath>, StoreError> {
        let key = public_key.to_ascii_lowercase();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT path_hex, observation_count, last_seen FROM observed_paths
                 WHERE public_key = ?1 AND packet_type = 'advert'
                 ORDER BY observation_count DESC, last_seen DESC
                 LIMIT 10",
            )?;
            let rows = stmt
                .query_map([&key], |row| {
                    Ok(ObservedPath {
                        path_hex: row.get(0)?,
                        observation_count: row.get(1)?,
                        last_seen: timestamp_from_sql(row.get(2)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}
