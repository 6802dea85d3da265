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
//! SQLite projection of the mesh graph.
//!
//! One connection per flush; a batch commits once and rolls back as a whole
//! on error. While writing, stored geographic distances are recomputed from
//! full public keys where available, so that prefix collisions do not leave
//! a wrong candidate's coordinates baked into an edge.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use ordered_float::OrderedFloat;
use rusqlite::{Connection, OptionalExtension, Row};

use super::MeshEdge;
use crate::contacts::{timestamp_from_sql, timestamp_to_sql, StoreError};
use crate::{scoring, Prefix};

/// Location lookups repeat heavily within one flush; cache the successful
/// ones per flush, keyed by `pk:<key>` or `prefix:<p>[:<lat>:<lon>]`.
type LocationCache = HashMap<String, (f64, f64)>;

/// Update contract for an existing edge: a non-null key overwrites,
/// a null key preserves whatever was learned before.
const EDGE_UPDATE_SQL: &str = "UPDATE mesh_connections
     SET observation_count = ?1, last_seen = ?2,
         avg_hop_position = ?3, geographic_distance = ?4,
         from_public_key = CASE WHEN ?5 IS NOT NULL THEN ?6 ELSE from_public_key END,
         to_public_key = CASE WHEN ?7 IS NOT NULL THEN ?8 ELSE to_public_key END
     WHERE from_prefix = ?9 AND to_prefix = ?10";

/// Persistent store for [`MeshEdge`] rows.
#[derive(Debug, Clone)]
pub struct EdgeStore {
    path: PathBuf,
}

impl EdgeStore {
    /// Open the store at `path`, creating the table if necessary.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS mesh_connections (
                 from_prefix TEXT NOT NULL,
                 to_prefix TEXT NOT NULL,
                 from_public_key TEXT,
                 to_public_key TEXT,
                 observation_count INTEGER NOT NULL,
                 first_seen TEXT NOT NULL,
                 last_seen TEXT NOT NULL,
                 avg_hop_position REAL,
                 geographic_distance REAL,
                 PRIMARY KEY (from_prefix, to_prefix)
             );",
        )?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all persisted edges, optionally restricted to the ones seen
    /// within the last `load_days` days (0 loads everything).
    pub fn load_edges(&self, load_days: i64) -> Result<Vec<MeshEdge>, StoreError> {
        let conn = Connection::open(&self.path)?;
        let base = "SELECT from_prefix, to_prefix, from_public_key, to_public_key,
                 observation_count, first_seen, last_seen, avg_hop_position,
                 geographic_distance
             FROM mesh_connections";

        let mut rows = Vec::new();
        let mut collect = |row: &Row<'_>| -> rusqlite::Result<()> {
            if let Some(edge) = row_to_edge(row)? {
                rows.push(edge);
            }
            Ok(())
        };
        if load_days > 0 {
            let cutoff = timestamp_to_sql(Utc::now() - Duration::days(load_days));
            let mut stmt =
                conn.prepare(&format!("{base} WHERE last_seen >= ?1 ORDER BY last_seen DESC"))?;
            let mut raw = stmt.query([cutoff])?;
            while let Some(row) = raw.next()? {
                collect(row)?;
            }
        } else {
            let mut stmt = conn.prepare(&format!("{base} ORDER BY last_seen DESC"))?;
            let mut raw = stmt.query([])?;
            while let Some(row) = raw.next()? {
                collect(row)?;
            }
        }
        Ok(rows)
    }

    /// Write one edge with its own connection (immediate / hybrid-new path).
    /// Recomputes the stored distance first; the caller carries any
    /// correction back into the in-memory edge.
    pub fn write_edge(&self, edge: &mut MeshEdge, is_new: bool) -> Result<(), StoreError> {
        let conn = Connection::open(&self.path)?;
        let mut cache = LocationCache::new();
        self.refresh_distance(&conn, edge, &mut cache);
        if is_new {
            insert_edge(&conn, edge)?;
        } else {
            update_edge(&conn, edge)?;
        }
        Ok(())
    }

    /// Flush a batch of edges in one transaction. Whether each edge needs an
    /// INSERT or an UPDATE is decided by an existence check on the same
    /// connection; distance recomputation shares one location cache across
    /// the whole flush. Returns the number of rows written.
    pub fn flush_edges(&self, edges: &mut [MeshEdge]) -> Result<usize, StoreError> {
        let mut conn = Connection::open(&self.path)?;
        let mut cache = LocationCache::new();
        let tx = conn.transaction()?;
        let mut written = 0;
        for edge in edges.iter_mut() {
            self.refresh_distance(&tx, edge, &mut cache);
            let exists: bool = tx
                .query_row(
                    "SELECT 1 FROM mesh_connections WHERE from_prefix = ?1 AND to_prefix = ?2",
                    [edge.from_prefix.as_str(), edge.to_prefix.as_str()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                update_edge(&tx, edge)?;
            } else {
                insert_edge(&tx, edge)?;
            }
            written += 1;
        }
        tx.commit()?;
        Ok(written)
    }

    /// Recompute the edge distance from the best available identities and
    /// apply it: unset distances are filled in, stored distances are only
    /// corrected when the recomputed value deviates by more than 20%.
    fn refresh_distance(&self, conn: &Connection, edge: &mut MeshEdge, cache: &mut LocationCache) {
        if edge.from_public_key.is_none() && edge.to_public_key.is_none() {
            return;
        }
        let Some(recalculated) = self.recompute_distance(conn, edge, cache) else {
            return;
        };
        match edge.geographic_distance {
            None => {
                log::debug!(
                    "mesh graph: recalculated distance for {}->{} using public keys: {recalculated:.1} km",
                    edge.from_prefix,
                    edge.to_prefix
                );
                edge.geographic_distance = Some(recalculated);
            }
            Some(current) => {
                if (recalculated - current).abs() / current.max(1.0) > 0.2 {
                    log::info!(
                        "mesh graph: corrected distance for {}->{}: {current:.1} -> {recalculated:.1} km",
                        edge.from_prefix,
                        edge.to_prefix
                    );
                    edge.geographic_distance = Some(recalculated);
                }
            }
        }
    }

    /// Resolve both endpoint locations, preferring full public keys and
    /// falling back to the best prefix match (with the opposite endpoint as
    /// reference, since LoRa range makes closer candidates likelier).
    fn recompute_distance(
        &self,
        conn: &Connection,
        edge: &MeshEdge,
        cache: &mut LocationCache,
    ) -> Option<f64> {
        let mut from_location = edge
            .from_public_key
            .as_deref()
            .and_then(|key| location_by_public_key(conn, key, cache));
        if from_location.is_none() {
            let reference = edge
                .to_public_key
                .as_deref()
                .and_then(|key| location_by_public_key(conn, key, cache))
                .or_else(|| location_by_prefix(conn, edge.to_prefix, None, cache));
            from_location = location_by_prefix(conn, edge.from_prefix, reference, cache);
        }

        let mut to_location = edge
            .to_public_key
            .as_deref()
            .and_then(|key| location_by_public_key(conn, key, cache));
        if to_location.is_none() {
            to_location = location_by_prefix(conn, edge.to_prefix, from_location, cache);
        }

        Some(scoring::distance_km(from_location?, to_location?))
    }
}

fn row_to_edge(row: &Row<'_>) -> rusqlite::Result<Option<MeshEdge>> {
    let from: String = row.get("from_prefix")?;
    let to: String = row.get("to_prefix")?;
    let (Some(from_prefix), Some(to_prefix)) = (Prefix::parse(&from), Prefix::parse(&to)) else {
        log::debug!("skipping stored edge with invalid prefixes {from:?} -> {to:?}");
        return Ok(None);
    };
    let (Some(first_seen), Some(last_seen)) = (
        timestamp_from_sql(row.get("first_seen")?),
        timestamp_from_sql(row.get("last_seen")?),
    ) else {
        log::debug!("skipping stored edge {from}->{to} with malformed timestamps");
        return Ok(None);
    };
    Ok(Some(MeshEdge {
        from_prefix,
        to_prefix,
        from_public_key: row.get("from_public_key")?,
        to_public_key: row.get("to_public_key")?,
        observation_count: row.get("observation_count")?,
        first_seen,
        last_seen,
        avg_hop_position: row.get("avg_hop_position")?,
        geographic_distance: row.get("geographic_distance")?,
    }))
}

/// Insert a new edge. The conflict clause keeps the write idempotent when
/// the in-memory view diverges from the table (e.g. a startup load window
/// skipped an old row): first_seen stays, null keys preserve.
fn insert_edge(conn: &Connection, edge: &MeshEdge) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO mesh_connections
             (from_prefix, to_prefix, from_public_key, to_public_key,
              observation_count, first_seen, last_seen, avg_hop_position,
              geographic_distance)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT (from_prefix, to_prefix) DO UPDATE SET
             observation_count = excluded.observation_count,
             last_seen = excluded.last_seen,
             avg_hop_position = excluded.avg_hop_position,
             geographic_distance = excluded.geographic_distance,
             from_public_key = COALESCE(excluded.from_public_key, from_public_key),
             to_public_key = COALESCE(excluded.to_public_key, to_public_key)",
        rusqlite::params![
            edge.from_prefix.as_str(),
            edge.to_prefix.as_str(),
            edge.from_public_key,
            edge.to_public_key,
            edge.observation_count,
            timestamp_to_sql(edge.first_seen),
            timestamp_to_sql(edge.last_seen),
            edge.avg_hop_position,
            edge.geographic_distance,
        ],
    )
}

fn update_edge(conn: &Connection, edge: &MeshEdge) -> rusqlite::Result<usize> {
    let rows = conn.execute(
        EDGE_UPDATE_SQL,
        rusqlite::params![
            edge.observation_count,
            timestamp_to_sql(edge.last_seen),
            edge.avg_hop_position,
            edge.geographic_distance,
            edge.from_public_key,
            edge.from_public_key,
            edge.to_public_key,
            edge.to_public_key,
            edge.from_prefix.as_str(),
            edge.to_prefix.as_str(),
        ],
    )?;
    if rows == 0 {
        log::warn!(
            "mesh graph: edge update affected no rows for {}->{}",
            edge.from_prefix,
            edge.to_prefix
        );
    }
    Ok(rows)
}

fn location_by_public_key(
    conn: &Connection,
    public_key: &str,
    cache: &mut LocationCache,
) -> Option<(f64, f64)> {
    let cache_key = format!("pk:{public_key}");
    if let Some(location) = cache.get(&cache_key) {
        return Some(*location);
    }
    let result = conn
        .query_row(
            "SELECT latitude, longitude FROM contacts
             WHERE public_key = ?1
               AND latitude IS NOT NULL AND longitude IS NOT NULL
               AND latitude != 0 AND longitude != 0
               AND role IN ('repeater', 'roomserver')
             ORDER BY is_starred DESC, COALESCE(last_advert_timestamp, last_heard) DESC
             LIMIT 1",
            [public_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional();
    match result {
        Ok(Some(location)) => {
            cache.insert(cache_key, location);
            Some(location)
        }
        Ok(None) => None,
        Err(e) => {
            log::debug!("error getting location by public key: {e}");
            None
        }
    }
}

/// Best-known location for a prefix. With a reference location and several
/// candidates, starred entries win first, then the closest (LoRa range is
/// limited), then the most recently heard.
fn location_by_prefix(
    conn: &Connection,
    prefix: Prefix,
    reference: Option<(f64, f64)>,
    cache: &mut LocationCache,
) -> Option<(f64, f64)> {
    let cache_key = match reference {
        Some((lat, lon)) => format!("prefix:{prefix}:{lat}:{lon}"),
        None => format!("prefix:{prefix}"),
    };
    if let Some(location) = cache.get(&cache_key) {
        return Some(*location);
    }

    let rows: Vec<(f64, f64, bool, Option<String>)> = {
        let mut stmt = match conn.prepare(
            "SELECT latitude, longitude, is_starred,
                    COALESCE(last_advert_timestamp, last_heard) AS last_seen
             FROM contacts
             WHERE public_key LIKE ?1
               AND latitude IS NOT NULL AND longitude IS NOT NULL
               AND latitude != 0 AND longitude != 0
               AND role IN ('repeater', 'roomserver')",
        ) {
            Ok(stmt) => stmt,
            Err(e) => {
                log::debug!("error getting location by prefix {prefix}: {e}");
                return None;
            }
        };
        let result = stmt
            .query_map([format!("{prefix}%")], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .and_then(|rows| rows.collect());
        match result {
            Ok(rows) => rows,
            Err(e) => {
                log::debug!("error getting location by prefix {prefix}: {e}");
                return None;
            }
        }
    };
    if rows.is_empty() {
        return None;
    }

    let mut candidates: Vec<(bool, f64, Option<String>, (f64, f64))> = rows
        .into_iter()
        .map(|(lat, lon, starred, last_seen)| {
            let distance = reference
                .map(|r| scoring::distance_km(r, (lat, lon)))
                .unwrap_or(0.0);
            (starred, distance, last_seen, (lat, lon))
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(OrderedFloat(a.1).cmp(&OrderedFloat(b.1)))
            .then(b.2.cmp(&a.2))
    });

    let location = candidates[0].3;
    cache.insert(cache_key, location);
    Some(location)
}
