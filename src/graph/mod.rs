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
//! The observed mesh graph.
//!
//! A directed multigraph of `(from_prefix -> to_prefix)` link observations,
//! learned passively from routing traces. The in-memory map is the source of
//! truth; SQLite persistence is an eventually-consistent projection driven by
//! the configured write strategy. Edges are keyed on the lossy one-byte
//! prefix on purpose: full public keys are often unknown at observation time
//! and are only learned opportunistically.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;

use crate::config::{ResolverConfig, WriteStrategy};
use crate::Prefix;

mod store;

pub use store::EdgeStore;

type EdgeKey = (Prefix, Prefix);

/// A directed link observation between two node prefixes.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshEdge {
    pub from_prefix: Prefix,
    pub to_prefix: Prefix,
    /// Full keys of the endpoints, when some observation knew them.
    /// The newest observation always wins.
    pub from_public_key: Option<String>,
    pub to_public_key: Option<String>,
    pub observation_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Running mean of the position (of the destination node) in the paths
    /// this edge was observed in.
    pub avg_hop_position: Option<f64>,
    /// Great-circle distance between the endpoints in km, when known.
    pub geographic_distance: Option<f64>,
}

impl MeshEdge {
    /// Confidence that this edge reflects a live link, from observation
    /// count (logarithmic) and recency (48 h half-life exponential decay).
    fn confidence(&self, now: DateTime<Utc>) -> f64 {
        let obs = self.observation_count as f64;
        let obs_confidence = (0.3 + 0.7 * (1.0 - 1.0 / (1.0 + obs / 10.0))).min(1.0);

        let hours_ago = ((now - self.last_seen).num_seconds() as f64 / 3600.0).max(0.0);
        let recency_confidence = if hours_ago < 1.0 {
            1.0
        } else {
            (2f64).powf(-hours_ago / 48.0).max(0.0)
        };

        obs_confidence * 0.6 + recency_confidence * 0.4
    }
}

/// Optional context attached to an edge observation.
#[derive(Debug, Clone, Default)]
pub struct EdgeObservation {
    pub from_public_key: Option<String>,
    pub to_public_key: Option<String>,
    /// Position of the destination node in the observed path (0-based).
    pub hop_position: Option<usize>,
    pub geographic_distance: Option<f64>,
}

struct WriterSignal {
    shutdown: Mutex<bool>,
    wakeup: Condvar,
}

/// Graph of observed mesh connections with configurable persistence.
///
/// `add_edge` may be called from any task while a decode is in flight; the
/// edge map and the pending-write set are each behind their own mutex, and
/// the batch writer runs on a dedicated joinable thread with its own
/// database connection per flush.
pub struct MeshGraph {
    store: EdgeStore,
    write_strategy: WriteStrategy,
    batch_interval: StdDuration,
    batch_max_pending: usize,
    edges: Mutex<BTreeMap<EdgeKey, MeshEdge>>,
    pending: Mutex<HashSet<EdgeKey>>,
    signal: Arc<WriterSignal>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl MeshGraph {
    /// Create the graph, rehydrating all persisted edges (optionally limited
    /// to the configured startup window) and starting the batch writer when
    /// the write strategy needs one. A failed load logs a warning and starts
    /// from an empty graph.
    pub fn new(store: EdgeStore, config: &ResolverConfig) -> Arc<Self> {
        let mut edges = BTreeMap::new();
        match store.load_edges(config.graph_startup_load_days) {
            Ok(loaded) => {
                let total: u64 = loaded.iter().map(|e| e.observation_count as u64).sum();
                log::info!("loaded {} graph edges from database", loaded.len());
                if !loaded.is_empty() {
                    log::info!(
                        "graph statistics: {} edges, {total} total observations",
                        loaded.len()
                    );
                }
                for edge in loaded {
                    edges.insert((edge.from_prefix, edge.to_prefix), edge);
                }
            }
            Err(e) => log::warn!("error loading graph from database: {e}"),
        }

        let graph = Arc::new(Self {
            store,
            write_strategy: config.graph_write_strategy,
            batch_interval: StdDuration::from_secs(config.graph_batch_interval_seconds.max(1)),
            batch_max_pending: config.graph_batch_max_pending.max(1),
            edges: Mutex::new(edges),
            pending: Mutex::new(HashSet::new()),
            signal: Arc::new(WriterSignal {
                shutdown: Mutex::new(false),
                wakeup: Condvar::new(),
            }),
            writer: Mutex::new(None),
        });

        if matches!(
            graph.write_strategy,
            WriteStrategy::Batched | WriteStrategy::Hybrid
        ) {
            let handle = Self::spawn_batch_writer(&graph);
            *graph.writer.lock().unwrap() = Some(handle);
        }

        graph
    }

    fn spawn_batch_writer(graph: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(graph);
        let signal = Arc::clone(&graph.signal);
        let interval = graph.batch_interval;
        std::thread::spawn(move || loop {
            let stop = signal.shutdown.lock().unwrap();
            let (stop, timeout) = signal
                .wakeup
                .wait_timeout_while(stop, interval, |stop| !*stop)
                .unwrap();
            if *stop {
                // final flush happens on the shutdown caller's thread
                return;
            }
            drop(stop);
            if timeout.timed_out() {
                match weak.upgrade() {
                    Some(graph) => graph.flush_pending(),
                    None => return,
                }
            }
        })
    }

    /// Record one observation of a directed link between two prefixes.
    /// Empty or malformed prefixes are rejected silently. Persistence is
    /// scheduled according to the configured write strategy.
    pub fn add_edge(&self, from_prefix: &str, to_prefix: &str, observation: EdgeObservation) {
        let (Some(from), Some(to)) = (Prefix::parse(from_prefix), Prefix::parse(to_prefix)) else {
            log::debug!("ignoring edge with invalid prefixes {from_prefix:?} -> {to_prefix:?}");
            return;
        };

        let key = (from, to);
        let now = Utc::now();

        let (snapshot, is_new) = {
            let mut edges = self.edges.lock().unwrap();
            match edges.get_mut(&key) {
                Some(edge) => {
                    edge.observation_count += 1;
                    edge.last_seen = now;
                    if let Some(position) = observation.hop_position {
                        let count = edge.observation_count as f64;
                        edge.avg_hop_position = Some(match edge.avg_hop_position {
                            Some(avg) => (avg * (count - 1.0) + position as f64) / count,
                            None => position as f64,
                        });
                    }
                    if observation.from_public_key.is_some() {
                        edge.from_public_key = observation.from_public_key;
                    }
                    if observation.to_public_key.is_some() {
                        edge.to_public_key = observation.to_public_key;
                    }
                    if observation.geographic_distance.is_some() {
                        edge.geographic_distance = observation.geographic_distance;
                    }
                    (edge.clone(), false)
                }
                None => {
                    let edge = MeshEdge {
                        from_prefix: from,
                        to_prefix: to,
                        from_public_key: observation.from_public_key,
                        to_public_key: observation.to_public_key,
                        observation_count: 1,
                        first_seen: now,
                        last_seen: now,
                        avg_hop_position: observation.hop_position.map(|p| p as f64),
                        geographic_distance: observation.geographic_distance,
                    };
                    edges.insert(key, edge.clone());
                    (edge, true)
                }
            }
        };

        log::debug!(
            "mesh graph: edge {from}->{to} new={is_new} strategy={}",
            self.write_strategy
        );
        match self.write_strategy {
            WriteStrategy::Immediate => self.write_through(snapshot, is_new),
            WriteStrategy::Batched => self.enqueue_pending(key),
            WriteStrategy::Hybrid => {
                if is_new {
                    self.write_through(snapshot, is_new);
                } else {
                    self.enqueue_pending(key);
                }
            }
        }
    }

    fn write_through(&self, mut snapshot: MeshEdge, is_new: bool) {
        match self.store.write_edge(&mut snapshot, is_new) {
            Ok(()) => self.apply_distance_correction(&snapshot),
            Err(e) => log::warn!(
                "error writing edge {}->{} to database: {e}",
                snapshot.from_prefix,
                snapshot.to_prefix
            ),
        }
    }

    /// Queue a key for the batch writer, flushing early once the soft cap of
    /// pending updates is reached. The flush runs after the lock is dropped.
    fn enqueue_pending(&self, key: EdgeKey) {
        let force_flush = {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(key);
            pending.len() >= self.batch_max_pending
        };
        if force_flush {
            self.flush_pending();
        }
    }

    /// Write all queued updates in one transaction. On failure the keys are
    /// re-queued and the error stays inside the persistence layer.
    pub fn flush_pending(&self) {
        let keys: Vec<EdgeKey> = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return;
            }
            pending.drain().collect()
        };

        let mut snapshots: Vec<MeshEdge> = {
            let edges = self.edges.lock().unwrap();
            keys.iter().filter_map(|k| edges.get(k).cloned()).collect()
        };

        match self.store.flush_edges(&mut snapshots) {
            Ok(written) => {
                for snapshot in &snapshots {
                    self.apply_distance_correction(snapshot);
                }
                log::debug!("flushed {written} pending graph edge updates");
            }
            Err(e) => {
                log::warn!("error flushing graph updates: {e}");
                let mut pending = self.pending.lock().unwrap();
                pending.extend(keys);
            }
        }
    }

    /// Carry a distance recomputed during persistence back into the live
    /// edge, so the resolver's distance penalty sees the corrected value.
    fn apply_distance_correction(&self, snapshot: &MeshEdge) {
        if snapshot.geographic_distance.is_none() {
            return;
        }
        let mut edges = self.edges.lock().unwrap();
        if let Some(edge) = edges.get_mut(&(snapshot.from_prefix, snapshot.to_prefix)) {
            if edge.geographic_distance != snapshot.geographic_distance {
                edge.geographic_distance = snapshot.geographic_distance;
            }
        }
    }

    pub fn has_edge(&self, from: Prefix, to: Prefix) -> bool {
        self.edges.lock().unwrap().contains_key(&(from, to))
    }

    pub fn get_edge(&self, from: Prefix, to: Prefix) -> Option<MeshEdge> {
        self.edges.lock().unwrap().get(&(from, to)).cloned()
    }

    /// All edges originating at `prefix`, in deterministic key order.
    pub fn outgoing_edges(&self, prefix: Prefix) -> Vec<MeshEdge> {
        self.edges
            .lock()
            .unwrap()
            .range((prefix, Prefix::parse("00").unwrap())..=(prefix, Prefix::parse("ff").unwrap()))
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// All edges ending at `prefix`, in deterministic key order.
    pub fn incoming_edges(&self, prefix: Prefix) -> Vec<MeshEdge> {
        self.edges
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.to_prefix == prefix)
            .cloned()
            .collect()
    }

    /// Number of edges and total observations, for statistics logging.
    pub fn stats(&self) -> (usize, u64) {
        let edges = self.edges.lock().unwrap();
        let total = edges.values().map(|e| e.observation_count as u64).sum();
        (edges.len(), total)
    }

    /// Validate one path segment. Returns `(valid, confidence)`; an edge
    /// below `min_observations` is invalid with confidence 0. With
    /// `check_bidirectional`, a qualifying reverse edge adds 0.15.
    pub fn validate_segment(
        &self,
        from: Prefix,
        to: Prefix,
        min_observations: u32,
        check_bidirectional: bool,
    ) -> (bool, f64) {
        let now = Utc::now();
        let edges = self.edges.lock().unwrap();

        let Some(edge) = edges.get(&(from, to)) else {
            return (false, 0.0);
        };
        if edge.observation_count < min_observations {
            return (false, 0.0);
        }

        let mut confidence = edge.confidence(now);

        if check_bidirectional {
            if let Some(reverse) = edges.get(&(to, from)) {
                if reverse.observation_count >= min_observations {
                    confidence = (confidence + 0.15).min(1.0);
                }
            }
        }

        (true, confidence)
    }

    /// Validate an entire path of prefixes. Single-node and empty paths are
    /// trivially valid; otherwise every segment must validate, and the
    /// result is the average segment confidence.
    pub fn validate_path(&self, path: &[Prefix], min_observations: u32) -> (bool, f64) {
        if path.len() < 2 {
            return (true, 1.0);
        }

        let mut confidences = Vec::with_capacity(path.len() - 1);
        for pair in path.windows(2) {
            let (valid, confidence) = self.validate_segment(pair[0], pair[1], min_observations, false);
            if !valid {
                return (false, 0.0);
            }
            confidences.push(confidence);
        }

        let avg = confidences.iter().sum::<f64>() / confidences.len() as f64;
        (true, avg)
    }

    /// Graph-based score for a candidate between its path neighbors.
    ///
    /// The base is the average confidence of the valid adjacent segments
    /// (0 when neither validates). A matching average hop position adds 0.1;
    /// a stored geographic distance on either edge adds 0.05.
    #[allow(clippy::too_many_arguments)]
    pub fn candidate_score(
        &self,
        candidate: Prefix,
        prev: Option<Prefix>,
        next: Option<Prefix>,
        min_observations: u32,
        hop_position: Option<usize>,
        use_bidirectional: bool,
        use_hop_position: bool,
    ) -> f64 {
        let mut confidences = Vec::with_capacity(2);

        if let Some(prev) = prev {
            let (valid, confidence) =
                self.validate_segment(prev, candidate, min_observations, use_bidirectional);
            if valid {
                confidences.push(confidence);
            }
        }
        if let Some(next) = next {
            let (valid, confidence) =
                self.validate_segment(candidate, next, min_observations, use_bidirectional);
            if valid {
                confidences.push(confidence);
            }
        }

        if confidences.is_empty() {
            return 0.0;
        }
        let mut score = confidences.iter().sum::<f64>() / confidences.len() as f64;

        if use_hop_position {
            if let Some(position) = hop_position {
                let mut position_matches = false;
                if let Some(prev) = prev {
                    if let Some(avg) = self
                        .get_edge(prev, candidate)
                        .and_then(|e| e.avg_hop_position)
                    {
                        position_matches = (position as f64 - avg).abs() <= 0.5;
                    }
                }
                if !position_matches {
                    if let Some(next) = next {
                        if let Some(avg) = self
                            .get_edge(candidate, next)
                            .and_then(|e| e.avg_hop_position)
                        {
                            // the candidate is the source of this edge, so the
                            // expected position is one before the stored mean
                            position_matches = (position as f64 - (avg - 1.0)).abs() <= 0.5;
                        }
                    }
                }
                if position_matches {
                    score = (score + 0.1).min(1.0);
                }
            }
        }

        // a stored distance marks a well-tracked edge
        let geographic_available = prev
            .and_then(|p| self.get_edge(p, candidate))
            .and_then(|e| e.geographic_distance)
            .is_some()
            || next
                .and_then(|n| self.get_edge(candidate, n))
                .and_then(|e| e.geographic_distance)
                .is_some();
        if geographic_available {
            score = (score + 0.05).min(1.0);
        }

        score
    }

    /// Find prefixes that plausibly sit between `from` and `to`, using
    /// 2-hop inference (and 3-hop as a fallback when allowed). Scores carry
    /// the weakest-link confidence, boosted for bidirectional links and
    /// reduced by 20% for 3-hop paths. Sorted best first; direct-edge
    /// destinations and trivial loops are excluded.
    pub fn find_intermediate_nodes(
        &self,
        from: Prefix,
        to: Prefix,
        min_observations: u32,
        max_hops: u8,
    ) -> Vec<(Prefix, f64)> {
        let mut candidates: BTreeMap<Prefix, f64> = BTreeMap::new();
        let outgoing = self.outgoing_edges(from);

        for edge in &outgoing {
            let intermediate = edge.to_prefix;
            if intermediate == to || intermediate == from {
                continue;
            }
            let connects = self
                .get_edge(intermediate, to)
                .map(|e| e.observation_count >= min_observations)
                .unwrap_or(false);
            if !connects {
                continue;
            }

            let (from_valid, from_confidence) =
                self.validate_segment(from, intermediate, min_observations, true);
            let (to_valid, to_confidence) =
                self.validate_segment(intermediate, to, min_observations, true);
            if !from_valid || !to_valid {
                continue;
            }

            // weakest link, then reward links confirmed in both directions
            let mut path_score = from_confidence.min(to_confidence);
            let reverse_from = self
                .get_edge(intermediate, from)
                .map(|e| e.observation_count >= min_observations)
                .unwrap_or(false);
            let reverse_to = self
                .get_edge(to, intermediate)
                .map(|e| e.observation_count >= min_observations)
                .unwrap_or(false);
            let bidirectional_factor = match (reverse_from, reverse_to) {
                (true, true) => 1.2,
                (true, false) | (false, true) => 1.1,
                (false, false) => 1.0,
            };
            path_score = (path_score * bidirectional_factor).min(1.0);

            let entry = candidates.entry(intermediate).or_insert(0.0);
            if path_score > *entry {
                *entry = path_score;
            }
        }

        if candidates.is_empty() && max_hops >= 3 {
            for edge1 in &outgoing {
                let intermediate1 = edge1.to_prefix;
                if intermediate1 == to {
                    continue;
                }
                for edge2 in self.outgoing_edges(intermediate1) {
                    let intermediate2 = edge2.to_prefix;
                    if intermediate2 == from || intermediate2 == intermediate1 {
                        continue;
                    }
                    let connects = self
                        .get_edge(intermediate2, to)
                        .map(|e| e.observation_count >= min_observations)
                        .unwrap_or(false);
                    if !connects {
                        continue;
                    }

                    let (valid1, conf1) =
                        self.validate_segment(from, intermediate1, min_observations, false);
                    let (valid2, conf2) =
                        self.validate_segment(intermediate1, intermediate2, min_observations, false);
                    let (valid3, conf3) =
                        self.validate_segment(intermediate2, to, min_observations, false);
                    if !(valid1 && valid2 && valid3) {
                        continue;
                    }

                    // three hops are less reliable than two
                    let path_score = conf1.min(conf2).min(conf3) * 0.8;
                    let entry = candidates.entry(intermediate2).or_insert(0.0);
                    if path_score > *entry {
                        *entry = path_score;
                    }
                }
            }
        }

        let mut sorted: Vec<(Prefix, f64)> = candidates.into_iter().collect();
        sorted.sort_by_key(|(_, score)| std::cmp::Reverse(OrderedFloat(*score)));
        sorted
    }

    /// Flush all pending writes and stop the batch writer. Idempotent.
    pub fn shutdown(&self) {
        log::info!("shutting down mesh graph, flushing pending writes...");

        {
            let mut stop = self.signal.shutdown.lock().unwrap();
            *stop = true;
        }
        self.signal.wakeup.notify_all();
        if let Some(handle) = self.writer.lock().unwrap().take() {
            if handle.join().is_err() {
                log::warn!("graph batch writer panicked");
            }
        }

        self.flush_pending();

        let (edge_count, total) = self.stats();
        if edge_count > 0 {
            log::info!("graph shutdown complete: {edge_count} edges, {total} total observations");
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::Duration;

    use super::*;
    use crate::testutil::{batched_test_config, test_graph, test_key};

    fn p(s: &str) -> Prefix {
        Prefix::parse(s).unwrap()
    }

    #[test]
    fn add_edge_creates_normalized_edge() {
        let (_dir, graph) = test_graph();
        graph.add_edge("7E", "01", EdgeObservation::default());

        let edge = graph.get_edge(p("7e"), p("01")).expect("edge should exist");
        assert_eq!(edge.observation_count, 1);
        assert_eq!(edge.from_prefix.as_str(), "7e");
        assert_eq!(edge.to_prefix.as_str(), "01");
        assert!(edge.first_seen <= edge.last_seen);
        assert!(graph.has_edge(p("7e"), p("01")));
        assert!(!graph.has_edge(p("01"), p("7e")));
    }

    #[test]
    fn add_edge_rejects_empty_prefixes() {
        let (_dir, graph) = test_graph();
        graph.add_edge("", "01", EdgeObservation::default());
        graph.add_edge("7e", "", EdgeObservation::default());
        assert_eq!(graph.stats().0, 0);
    }

    #[test]
    fn repeated_observations_accumulate() {
        let (_dir, graph) = test_graph();
        graph.add_edge("7e", "01", EdgeObservation::default());
        let created = graph.get_edge(p("7e"), p("01")).unwrap().first_seen;
        for _ in 0..4 {
            graph.add_edge("7e", "01", EdgeObservation::default());
        }
        let edge = graph.get_edge(p("7e"), p("01")).unwrap();
        assert_eq!(edge.observation_count, 5);
        assert_eq!(edge.first_seen, created);
        assert!(edge.first_seen <= edge.last_seen);
    }

    #[test]
    fn hop_positions_average_by_running_mean() {
        let (_dir, graph) = test_graph();
        for position in [1usize, 2, 3] {
            graph.add_edge(
                "7e",
                "01",
                EdgeObservation {
                    hop_position: Some(position),
                    ..Default::default()
                },
            );
        }
        let edge = graph.get_edge(p("7e"), p("01")).unwrap();
        assert!((edge.avg_hop_position.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn newer_public_keys_win_but_none_preserves() {
        let (_dir, graph) = test_graph();
        graph.add_edge(
            "7e",
            "01",
            EdgeObservation {
                to_public_key: Some(test_key("01")),
                ..Default::default()
            },
        );
        graph.add_edge("7e", "01", EdgeObservation::default());
        let edge = graph.get_edge(p("7e"), p("01")).unwrap();
        assert_eq!(edge.to_public_key, Some(test_key("01")));

        let newer = format!("01ff{}", "0".repeat(60));
        graph.add_edge(
            "7e",
            "01",
            EdgeObservation {
                to_public_key: Some(newer.clone()),
                ..Default::default()
            },
        );
        let edge = graph.get_edge(p("7e"), p("01")).unwrap();
        assert_eq!(edge.to_public_key, Some(newer));
    }

    #[test]
    fn validate_segment_requires_min_observations() {
        let (_dir, graph) = test_graph();
        graph.add_edge("7e", "01", EdgeObservation::default());

        let (valid, confidence) = graph.validate_segment(p("7e"), p("01"), 3, false);
        assert!(!valid);
        assert_eq!(confidence, 0.0);

        graph.add_edge("7e", "01", EdgeObservation::default());
        graph.add_edge("7e", "01", EdgeObservation::default());
        let (valid, confidence) = graph.validate_segment(p("7e"), p("01"), 3, false);
        assert!(valid);
        assert!(confidence > 0.0);
    }

    #[test]
    fn segment_confidence_grows_with_observations() {
        let (_dir, graph) = test_graph();
        graph.add_edge("7e", "01", EdgeObservation::default());
        let (_, few) = graph.validate_segment(p("7e"), p("01"), 1, false);
        for _ in 0..20 {
            graph.add_edge("7e", "01", EdgeObservation::default());
        }
        let (_, many) = graph.validate_segment(p("7e"), p("01"), 1, false);
        assert!(many > few);
    }

    #[test]
    fn segment_confidence_decays_with_age() {
        let (_dir, graph) = test_graph();
        graph.add_edge("7e", "01", EdgeObservation::default());
        let (_, fresh) = graph.validate_segment(p("7e"), p("01"), 1, false);

        {
            let mut edges = graph.edges.lock().unwrap();
            let edge = edges.get_mut(&(p("7e"), p("01"))).unwrap();
            edge.last_seen = Utc::now() - Duration::hours(72);
        }
        let (_, aged) = graph.validate_segment(p("7e"), p("01"), 1, false);
        assert!(aged < fresh);
    }

    #[test]
    fn bidirectional_bonus_is_fifteen_percent() {
        let (_dir, graph) = test_graph();
        graph.add_edge("7e", "01", EdgeObservation::default());
        let (_, unidirectional) = graph.validate_segment(p("7e"), p("01"), 1, true);

        graph.add_edge("01", "7e", EdgeObservation::default());
        let (_, bidirectional) = graph.validate_segment(p("7e"), p("01"), 1, true);
        assert!((bidirectional - (unidirectional + 0.15).min(1.0)).abs() < 1e-9);
    }

    #[test]
    fn short_paths_are_trivially_valid() {
        let (_dir, graph) = test_graph();
        assert_eq!(graph.validate_path(&[], 1), (true, 1.0));
        assert_eq!(graph.validate_path(&[p("7e")], 1), (true, 1.0));
    }

    #[test]
    fn validate_path_fails_on_missing_segment() {
        let (_dir, graph) = test_graph();
        graph.add_edge("01", "7e", EdgeObservation::default());
        let (valid, confidence) = graph.validate_path(&[p("01"), p("7e"), p("86")], 1);
        assert!(!valid);
        assert_eq!(confidence, 0.0);

        graph.add_edge("7e", "86", EdgeObservation::default());
        let (valid, confidence) = graph.validate_path(&[p("01"), p("7e"), p("86")], 1);
        assert!(valid);
        assert!(confidence > 0.0);
    }

    #[test]
    fn candidate_score_no_edges_is_zero() {
        let (_dir, graph) = test_graph();
        let score = graph.candidate_score(p("01"), None, None, 1, None, true, true);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn candidate_score_single_and_both_edges() {
        let (_dir, graph) = test_graph();
        graph.add_edge("7e", "01", EdgeObservation::default());
        let prev_only = graph.candidate_score(p("01"), Some(p("7e")), None, 1, None, true, true);
        assert!(prev_only > 0.0 && prev_only <= 1.0);

        graph.add_edge("01", "86", EdgeObservation::default());
        let both = graph.candidate_score(p("01"), Some(p("7e")), Some(p("86")), 1, None, true, true);
        assert!(both > 0.0 && both <= 1.0);
    }

    #[test]
    fn candidate_score_bidirectional_toggle() {
        let (_dir, graph) = test_graph();
        graph.add_edge("7e", "01", EdgeObservation::default());
        graph.add_edge("01", "7e", EdgeObservation::default());

        let enabled = graph.candidate_score(p("01"), Some(p("7e")), None, 1, None, true, false);
        let disabled = graph.candidate_score(p("01"), Some(p("7e")), None, 1, None, false, false);
        assert!(enabled > disabled);
    }

    #[test]
    fn candidate_score_hop_position_bonus() {
        let (_dir, graph) = test_graph();
        for _ in 0..2 {
            graph.add_edge(
                "7e",
                "01",
                EdgeObservation {
                    hop_position: Some(2),
                    ..Default::default()
                },
            );
        }

        let matching = graph.candidate_score(p("01"), Some(p("7e")), None, 1, Some(2), true, true);
        let mismatched = graph.candidate_score(p("01"), Some(p("7e")), None, 1, Some(5), true, true);
        assert!(matching > mismatched);

        // disabled hop position validation ignores the mismatch
        let ignored = graph.candidate_score(p("01"), Some(p("7e")), None, 1, Some(5), true, false);
        assert!(ignored > 0.0);
    }

    #[test]
    fn candidate_score_distance_data_bonus() {
        let (_dir, graph) = test_graph();
        graph.add_edge("7e", "01", EdgeObservation::default());
        let plain = graph.candidate_score(p("01"), Some(p("7e")), None, 1, None, false, false);

        graph.add_edge(
            "7e",
            "01",
            EdgeObservation {
                geographic_distance: Some(12.5),
                ..Default::default()
            },
        );
        let with_distance = graph.candidate_score(p("01"), Some(p("7e")), None, 1, None, false, false);
        assert!(with_distance > plain);
    }

    #[test]
    fn intermediate_nodes_two_hop() {
        let (_dir, graph) = test_graph();
        // 01 -> 7e -> 86, no direct 01 -> 86
        graph.add_edge("01", "7e", EdgeObservation::default());
        graph.add_edge("7e", "86", EdgeObservation::default());

        let found = graph.find_intermediate_nodes(p("01"), p("86"), 1, 2);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, p("7e"));
        assert!(found[0].1 > 0.0);
    }

    #[test]
    fn intermediate_nodes_never_return_endpoints() {
        let (_dir, graph) = test_graph();
        graph.add_edge("01", "01", EdgeObservation::default());
        graph.add_edge("01", "86", EdgeObservation::default());
        graph.add_edge("86", "86", EdgeObservation::default());

        for (candidate, _) in graph.find_intermediate_nodes(p("01"), p("86"), 1, 3) {
            assert_ne!(candidate, p("01"));
        }
    }

    #[test]
    fn intermediate_nodes_exclude_direct_destination() {
        let (_dir, graph) = test_graph();
        graph.add_edge("01", "86", EdgeObservation::default());
        graph.add_edge("86", "86", EdgeObservation::default());
        let found = graph.find_intermediate_nodes(p("01"), p("86"), 1, 2);
        assert!(found.is_empty());
    }

    #[test]
    fn intermediate_nodes_bidirectional_links_score_higher() {
        let (_dir, graph) = test_graph();
        // forward only through 7e
        graph.add_edge("01", "7e", EdgeObservation::default());
        graph.add_edge("7e", "86", EdgeObservation::default());
        let unidirectional = graph.find_intermediate_nodes(p("01"), p("86"), 1, 2)[0].1;

        // both reverse edges exist as well
        graph.add_edge("7e", "01", EdgeObservation::default());
        graph.add_edge("86", "7e", EdgeObservation::default());
        let bidirectional = graph.find_intermediate_nodes(p("01"), p("86"), 1, 2)[0].1;
        assert!(bidirectional > unidirectional);
    }

    #[test]
    fn intermediate_nodes_three_hop_fallback() {
        let (_dir, graph) = test_graph();
        // 01 -> aa -> bb -> 86, nothing shorter
        graph.add_edge("01", "aa", EdgeObservation::default());
        graph.add_edge("aa", "bb", EdgeObservation::default());
        graph.add_edge("bb", "86", EdgeObservation::default());

        assert!(graph.find_intermediate_nodes(p("01"), p("86"), 1, 2).is_empty());

        let found = graph.find_intermediate_nodes(p("01"), p("86"), 1, 3);
        assert_eq!(found.len(), 1);
        // the reported candidate is the hop before the destination
        assert_eq!(found[0].0, p("bb"));
        // 3-hop reliability penalty keeps the score below a 2-hop result
        assert!(found[0].1 < 0.8 + 1e-9);
    }

    #[test]
    fn batched_strategy_only_persists_on_flush() {
        let (dir, graph) = test_graph();
        graph.add_edge("01", "7e", EdgeObservation::default());

        let store = EdgeStore::open(dir.path().join("graph.db")).unwrap();
        assert_eq!(store.load_edges(0).unwrap().len(), 0);

        graph.flush_pending();
        let rows = store.load_edges(0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].observation_count, 1);
    }

    #[test]
    fn flush_failure_requeues_pending_updates() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("graph.db");
        let store = EdgeStore::open(&db).unwrap();
        let graph = MeshGraph::new(store, &batched_test_config());
        graph.add_edge("01", "7e", EdgeObservation::default());

        // break the schema underneath the store so the flush fails
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute_batch("DROP TABLE mesh_connections;").unwrap();
        drop(conn);
        graph.flush_pending();
        assert_eq!(graph.pending.lock().unwrap().len(), 1);
        graph.shutdown();
    }
}
