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
//! Shared test fixtures: record factories, an in-memory contact store, and
//! graph setup helpers.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tempfile::TempDir;

use crate::config::{ResolverConfig, WriteStrategy};
use crate::contacts::{ContactStore, NodeRole, ObservedPath, RepeaterRecord, StoreError};
use crate::graph::{EdgeStore, MeshGraph};
use crate::Prefix;

/// A deterministic 64-hex-digit key starting with `prefix`.
pub(crate) fn test_key(prefix: &str) -> String {
    prefix.to_ascii_lowercase().repeat(32)[..64].to_string()
}

/// A repeater in Seattle, heard just now.
pub(crate) fn test_repeater(prefix: &str, name: &str) -> RepeaterRecord {
    let now = Utc::now();
    RepeaterRecord {
        public_key: test_key(prefix),
        name: name.to_string(),
        role: NodeRole::Repeater,
        latitude: Some(47.6062),
        longitude: Some(-122.3321),
        city: Some("Seattle".to_string()),
        state: Some("WA".to_string()),
        country: Some("USA".to_string()),
        last_heard: Some(now),
        last_advert_timestamp: Some(now),
        advert_count: 1,
        signal_strength: None,
        snr: None,
        hop_count: None,
        is_starred: false,
        is_active: true,
    }
}

/// Batched writes with an hour-long interval: persistence only happens on
/// explicit flush or shutdown, which keeps in-memory assertions undisturbed.
pub(crate) fn batched_test_config() -> ResolverConfig {
    ResolverConfig {
        graph_write_strategy: WriteStrategy::Batched,
        graph_batch_interval_seconds: 3600,
        ..Default::default()
    }
}

pub(crate) fn immediate_test_config() -> ResolverConfig {
    ResolverConfig {
        graph_write_strategy: WriteStrategy::Immediate,
        ..Default::default()
    }
}

/// A fresh graph over a temporary database, with batched writes.
pub(crate) fn test_graph() -> (TempDir, std::sync::Arc<MeshGraph>) {
    let dir = tempfile::tempdir().unwrap();
    let store = EdgeStore::open(dir.path().join("graph.db")).unwrap();
    let graph = MeshGraph::new(store, &batched_test_config());
    (dir, graph)
}

pub(crate) fn parse_path(tokens: &[&str]) -> Vec<Prefix> {
    tokens.iter().map(|t| Prefix::parse(t).unwrap()).collect()
}

/// In-memory [`ContactStore`] mirroring the SQL query semantics.
#[derive(Default)]
pub(crate) struct StaticContacts {
    pub records: Vec<RepeaterRecord>,
    pub sender_locations: HashMap<String, (f64, f64)>,
    observed_paths: HashMap<String, Vec<ObservedPath>>,
}

impl StaticContacts {
    pub fn with_records(records: Vec<RepeaterRecord>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    pub fn add_observed_path(&mut self, public_key: &str, path_hex: &str, observations: u32) {
        self.observed_paths
            .entry(public_key.to_ascii_lowercase())
            .or_default()
            .push(ObservedPath {
                path_hex: path_hex.to_string(),
                observation_count: observations,
                last_seen: Some(Utc::now()),
            });
    }

    fn is_routing_role(record: &RepeaterRecord) -> bool {
        matches!(record.role, NodeRole::Repeater | NodeRole::Roomserver)
    }

    /// The SQL age filter: last_advert when present, last_heard otherwise.
    fn passes_age_filter(record: &RepeaterRecord, max_age_days: i64) -> bool {
        if max_age_days <= 0 {
            return true;
        }
        let cutoff = Utc::now() - Duration::days(max_age_days);
        match record.last_advert_timestamp.or(record.last_heard) {
            Some(t) => t >= cutoff,
            None => false,
        }
    }
}

#[async_trait]
impl ContactStore for StaticContacts {
    async fn repeaters_by_prefix(
        &self,
        prefix: Prefix,
        max_age_days: i64,
    ) -> Result<Vec<RepeaterRecord>, StoreError> {
        let mut matches: Vec<RepeaterRecord> = self
            .records
            .iter()
            .filter(|r| prefix.matches_key(&r.public_key))
            .filter(|r| Self::is_routing_role(r))
            .filter(|r| Self::passes_age_filter(r, max_age_days))
            .cloned()
            .collect();
        matches.sort_by_key(|r| {
            std::cmp::Reverse(r.last_advert_timestamp.or(r.last_heard))
        });
        Ok(matches)
    }

    async fn location_by_public_key(
        &self,
        public_key: &str,
    ) -> Result<Option<(f64, f64)>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.public_key.eq_ignore_ascii_case(public_key))
            .filter(|r| Self::is_routing_role(r))
            .find_map(|r| r.coordinates()))
    }

    async fn best_location_for_prefix(
        &self,
        prefix: Prefix,
        max_age_days: i64,
    ) -> Result<Option<(f64, f64)>, StoreError> {
        let mut candidates: Vec<&RepeaterRecord> = self
            .records
            .iter()
            .filter(|r| prefix.matches_key(&r.public_key))
            .filter(|r| Self::is_routing_role(r))
            .filter(|r| r.coordinates().is_some())
            .filter(|r| Self::passes_age_filter(r, max_age_days))
            .collect();
        candidates.sort_by_key(|r| {
            std::cmp::Reverse(r.last_advert_timestamp.or(r.last_heard))
        });
        candidates.sort_by_key(|r| std::cmp::Reverse(r.is_starred));
        Ok(candidates.first().and_then(|r| r.coordinates()))
    }

    async fn sender_location(&self, public_key: &str) -> Result<Option<(f64, f64)>, StoreError> {
        if let Some(location) = self.sender_locations.get(&public_key.to_ascii_lowercase()) {
            return Ok(Some(*location));
        }
        Ok(self
            .records
            .iter()
            .filter(|r| r.public_key.eq_ignore_ascii_case(public_key))
            .find_map(|r| r.coordinates()))
    }

    async fn observed_paths_for_key(
        &self,
        public_key: &str,
    ) -> Result<Vec<ObservedPath>, StoreError> {
        Ok(self
            .observed_paths
            .get(&public_key.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }
}
