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
//! Per-hop candidate resolution.
//!
//! For one prefix at one position in a path, the resolver retrieves every
//! recent repeater sharing that prefix and picks one, weighing graph
//! evidence against geographic evidence. A lone recent candidate is returned
//! as-is (no choice was made, so no confidence is attached); an ambiguous
//! set that no method can decide with confidence ≥ 0.5 is reported as a
//! collision. Resolution is best-effort: store errors degrade to empty
//! candidate sets and never abort a decode.

use std::sync::Arc;

use chrono::Utc;
use ordered_float::OrderedFloat;

use crate::config::{ProximityMethod, ResolverConfig};
use crate::contacts::{ContactStore, LiveContacts, NodeRole, RepeaterRecord};
use crate::graph::MeshGraph;
use crate::scoring::{
    break_distance_tie, combined_score, distance_km, proximity_score, ratio_confidence,
    recency_score, score_confidence, MIN_RECENCY_SCORE, PROXIMITY_NORMALIZATION_KM,
};
use crate::Prefix;

/// How a disambiguated candidate was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SelectionMethod {
    Graph,
    GraphMultihop,
    Geographic,
    GraphGeographicCombined,
}

/// Result of resolving one prefix of a path.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// One repeater identity was determined. `method` and `confidence` are
    /// only present when a choice between several candidates was made.
    Found {
        record: RepeaterRecord,
        method: Option<SelectionMethod>,
        confidence: Option<f64>,
        /// The hit came from the radio's live contact list, not the store.
        from_live_contacts: bool,
    },
    /// Several recent repeaters share the prefix and no selection method
    /// reached the confidence floor.
    Collision {
        matches: usize,
        candidates: Vec<RepeaterRecord>,
    },
    /// No recent repeater is known under this prefix.
    NotFound,
}

/// Anchor of a single-reference proximity comparison. The sender (first hop)
/// and the bot (final hop) anchor on pure distance; path neighbors blend
/// distance with recency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProximityAnchor {
    Sender,
    Bot,
    Previous,
    Next,
}

impl ProximityAnchor {
    fn weights(self, config: &ResolverConfig) -> (f64, f64) {
        match self {
            // delivery endpoints care about distance above all else
            Self::Sender | Self::Bot => (0.0, 1.0),
            Self::Previous | Self::Next => (config.recency_weight, config.proximity_weight()),
        }
    }
}

/// Resolves one path position to a repeater identity.
pub struct CandidateResolver {
    config: ResolverConfig,
    contacts: Arc<dyn ContactStore>,
    graph: Option<Arc<MeshGraph>>,
    live_contacts: Option<Arc<dyn LiveContacts>>,
    bot_location: Option<(f64, f64)>,
}

impl CandidateResolver {
    pub fn new(
        config: ResolverConfig,
        contacts: Arc<dyn ContactStore>,
        graph: Option<Arc<MeshGraph>>,
    ) -> Self {
        let config = config.normalized();
        if config.bot_location_invalid() {
            log::warn!(
                "invalid bot coordinates in config: {:?}, {:?} - geographic guessing disabled",
                config.bot_latitude,
                config.bot_longitude
            );
        }
        let bot_location = config.bot_location();
        match bot_location {
            Some((lat, lon)) => {
                log::info!("geographic proximity guessing enabled with bot location {lat:.4}, {lon:.4}");
                log::info!("proximity method: {}", config.proximity_method);
            }
            None => log::info!("bot location not configured - geographic proximity guessing disabled"),
        }
        Self {
            config,
            contacts,
            graph,
            live_contacts: None,
            bot_location,
        }
    }

    /// Attach the radio's live contact list as a fallback source.
    pub fn with_live_contacts(mut self, live_contacts: Arc<dyn LiveContacts>) -> Self {
        self.live_contacts = Some(live_contacts);
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve the prefix at `index` of `path`. The full path provides the
    /// context for the first/last-hop policies and the graph neighborhood;
    /// `sender_public_key` (when known) anchors first-hop proximity.
    pub async fn resolve(
        &self,
        index: usize,
        path: &[Prefix],
        sender_public_key: Option<&str>,
    ) -> Resolution {
        let prefix = path[index];

        let records = match self
            .contacts
            .repeaters_by_prefix(prefix, self.config.max_repeater_age_days)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                log::warn!("error looking up repeaters for prefix {prefix}: {e}");
                Vec::new()
            }
        };

        if records.is_empty() {
            return self.resolve_from_live_contacts(prefix);
        }

        // drop candidates whose last sign of life is too old to matter;
        // this keeps stale entries from producing false collisions
        let now = Utc::now();
        let recent: Vec<RepeaterRecord> = records
            .into_iter()
            .filter(|r| {
                recency_score(
                    r.most_recent_activity(),
                    now,
                    self.config.recency_decay_half_life_hours,
                ) >= MIN_RECENCY_SCORE
            })
            .collect();

        match recent.len() {
            0 => Resolution::NotFound,
            1 => Resolution::Found {
                record: recent.into_iter().next().unwrap(),
                method: None,
                confidence: None,
                from_live_contacts: false,
            },
            _ => self.disambiguate(recent, index, path, sender_public_key).await,
        }
    }

    /// Pick one of several recent candidates, or report a collision.
    async fn disambiguate(
        &self,
        candidates: Vec<RepeaterRecord>,
        index: usize,
        path: &[Prefix],
        sender_public_key: Option<&str>,
    ) -> Resolution {
        let is_final_hop = index + 1 == path.len();

        let graph_choice = if self.config.graph_based_validation && self.graph.is_some() {
            self.select_by_graph(&candidates, index, path).await
        } else {
            None
        };

        let geo_choice = if self.bot_location.is_some() {
            let sender_location = match sender_public_key {
                Some(key) => self
                    .contacts
                    .sender_location(key)
                    .await
                    .unwrap_or_else(|e| {
                        log::debug!("error getting sender location: {e}");
                        None
                    }),
                None => None,
            };
            self.select_by_proximity(&candidates, index, path, sender_location)
                .await
        } else {
            None
        };

        let selected = self.combine_choices(graph_choice, geo_choice, is_final_hop);

        match selected {
            Some((record, confidence, method)) if confidence >= 0.5 => Resolution::Found {
                record,
                method: Some(method),
                confidence: Some(confidence),
                from_live_contacts: false,
            },
            _ => Resolution::Collision {
                matches: candidates.len(),
                candidates,
            },
        }
    }

    /// Apply the configured policy for combining the graph and geographic
    /// decisions (default: graph wins above its override threshold).
    fn combine_choices(
        &self,
        graph_choice: Option<(RepeaterRecord, f64, SelectionMethod)>,
        geo_choice: Option<(RepeaterRecord, f64)>,
        is_final_hop: bool,
    ) -> Option<(RepeaterRecord, f64, SelectionMethod)> {
        #[derive(Clone, Copy)]
        enum Pick {
            Graph,
            Geo,
            Combined(f64),
        }

        let pick = {
            let graph = graph_choice.as_ref();
            let geo = geo_choice.as_ref();

            // a graph pick without coordinates loses the final hop to a
            // located geographic pick: the hop next to the bot is the one
            // place where "where is it" beats "how often was it seen"
            let final_hop_prefers_geo = graph
                .map(|(record, _, _)| {
                    is_final_hop && record.coordinates().is_none() && geo.is_some()
                })
                .unwrap_or(false);

            if self.config.graph_geographic_combined && graph.is_some() && geo.is_some() {
                let (graph_record, graph_conf, _) = graph.unwrap();
                let (geo_record, geo_conf) = geo.unwrap();
                if graph_record.public_key.eq_ignore_ascii_case(&geo_record.public_key) {
                    let weight = self.config.graph_geographic_weight;
                    Some(Pick::Combined(graph_conf * weight + geo_conf * (1.0 - weight)))
                } else if final_hop_prefers_geo {
                    Some(Pick::Geo)
                } else if graph_conf > geo_conf {
                    Some(Pick::Graph)
                } else {
                    Some(Pick::Geo)
                }
            } else {
                let threshold = self.config.graph_confidence_override_threshold();
                match (graph, geo) {
                    (Some((_, graph_conf, _)), _) if *graph_conf >= threshold => {
                        if final_hop_prefers_geo {
                            Some(Pick::Geo)
                        } else {
                            Some(Pick::Graph)
                        }
                    }
                    (graph, Some((_, geo_conf)))
                        if graph.map(|(_, c, _)| geo_conf > c).unwrap_or(true) =>
                    {
                        Some(Pick::Geo)
                    }
                    (Some(_), _) => {
                        // graph confidence is below the threshold but still
                        // the best evidence available
                        if final_hop_prefers_geo {
                            Some(Pick::Geo)
                        } else {
                            Some(Pick::Graph)
                        }
                    }
                    (None, Some(_)) => Some(Pick::Geo),
                    (None, None) => None,
                }
            }
        };

        match pick? {
            Pick::Graph => graph_choice,
            Pick::Geo => geo_choice.map(|(record, confidence)| {
                (record, confidence, SelectionMethod::Geographic)
            }),
            Pick::Combined(confidence) => graph_choice.map(|(record, _, _)| {
                (record, confidence, SelectionMethod::GraphGeographicCombined)
            }),
        }
    }

    /// Score every candidate on graph evidence and pick the best.
    async fn select_by_graph(
        &self,
        candidates: &[RepeaterRecord],
        index: usize,
        path: &[Prefix],
    ) -> Option<(RepeaterRecord, f64, SelectionMethod)> {
        let graph = self.graph.as_ref()?;
        let config = &self.config;
        let prev = (index > 0).then(|| path[index - 1]);
        let next = (index + 1 < path.len()).then(|| path[index + 1]);

        let mut best: Option<(&RepeaterRecord, f64, SelectionMethod)> = None;

        for record in candidates {
            let Some(candidate_prefix) = record.prefix() else {
                continue;
            };
            let candidate_key = record.public_key.to_ascii_lowercase();

            let graph_score = graph.candidate_score(
                candidate_prefix,
                prev,
                next,
                config.min_edge_observations,
                config.graph_use_hop_position.then_some(index),
                config.graph_use_bidirectional,
                config.graph_use_hop_position,
            );

            // an adjacent edge that learned this exact public key is strong
            // evidence we are looking at the right twin
            let mut stored_key_bonus = 0.0f64;
            if config.graph_prefer_stored_keys {
                if let Some(prev) = prev {
                    if let Some(edge) = graph.get_edge(prev, candidate_prefix) {
                        if edge
                            .to_public_key
                            .map(|k| k.eq_ignore_ascii_case(&candidate_key))
                            .unwrap_or(false)
                        {
                            stored_key_bonus = stored_key_bonus.max(0.4);
                        }
                    }
                }
                if let Some(next) = next {
                    if let Some(edge) = graph.get_edge(candidate_prefix, next) {
                        if edge
                            .from_public_key
                            .map(|k| k.eq_ignore_ascii_case(&candidate_key))
                            .unwrap_or(false)
                        {
                            stored_key_bonus = stored_key_bonus.max(0.4);
                        }
                    }
                }
            }

            // direct-neighbor bonuses only count on top of graph evidence,
            // otherwise a zero-hop node with no edges would win everything
            let mut zero_hop_bonus = 0.0;
            if record.hop_count == Some(0) && graph_score > 0.0 {
                zero_hop_bonus = config.graph_zero_hop_bonus;
            }
            let mut snr_bonus = 0.0;
            if record.snr.is_some() && graph_score > 0.0 {
                // an SNR sample proves the link, stronger than the hop count
                snr_bonus = config.graph_zero_hop_bonus * 1.2;
            }

            let mut score =
                (graph_score + stored_key_bonus + zero_hop_bonus + snr_bonus).min(1.0);

            if path.len() > 1 && config.graph_path_validation_max_bonus > 0.0 {
                score = (score + self.path_history_bonus(&candidate_key, path).await).min(1.0);
            }

            // weak direct evidence: check whether the neighborhood connects
            // through this prefix over two (or three) hops instead
            let mut method = SelectionMethod::Graph;
            if config.graph_multi_hop_enabled && score < 0.6 {
                if let (Some(prev), Some(next)) = (prev, next) {
                    let intermediates = graph.find_intermediate_nodes(
                        prev,
                        next,
                        config.min_edge_observations,
                        config.graph_multi_hop_max_hops,
                    );
                    if let Some((_, multi_hop_score)) = intermediates
                        .into_iter()
                        .find(|(p, _)| *p == candidate_prefix)
                    {
                        if multi_hop_score > score {
                            score = multi_hop_score;
                            method = SelectionMethod::GraphMultihop;
                        }
                    }
                }
            }

            if config.graph_distance_penalty_enabled && next.is_some() {
                score = self.intermediate_distance_penalty(
                    graph,
                    record,
                    candidate_prefix,
                    prev,
                    next,
                    score,
                );
            }

            if next.is_none() && config.graph_final_hop_proximity_enabled {
                score = self.final_hop_adjustment(record, score);
            }

            if record.is_starred {
                // may push the score past 1.0; normalized to a confidence below
                score *= config.star_bias_multiplier;
            }

            if best.as_ref().map(|(_, s, _)| score > *s).unwrap_or(true) {
                best = Some((record, score, method));
            }
        }

        let (record, score, method) = best?;
        if score <= 0.0 {
            return None;
        }
        let confidence = if score <= 1.0 {
            score
        } else {
            // star bias overshoot compresses into (0.95, 1.0]
            0.95 + ((score - 1.0) / config.star_bias_multiplier).min(0.05)
        };
        Some((record.clone(), confidence, method))
    }

    /// Bonus for candidates whose historically observed advert paths share a
    /// leading token run with the path being decoded.
    async fn path_history_bonus(&self, candidate_key: &str, path: &[Prefix]) -> f64 {
        let stored_paths = match self.contacts.observed_paths_for_key(candidate_key).await {
            Ok(paths) => paths,
            Err(e) => {
                log::debug!("error checking path history for {candidate_key}: {e}");
                return 0.0;
            }
        };

        let max_bonus = self.config.graph_path_validation_max_bonus;
        let mut bonus = 0.0f64;
        for stored in stored_paths {
            let stored_nodes = stored.prefixes();
            let common = stored_nodes
                .iter()
                .zip(path)
                .take_while(|(a, b)| a == b)
                .count();
            if common < 2 {
                continue;
            }
            let segment_bonus = (0.05 * common as f64).min(0.2);
            let obs_bonus = (stored.observation_count as f64
                / self.config.graph_path_validation_obs_divisor)
                .min(0.15);
            bonus = (bonus.max(segment_bonus + obs_bonus)).min(max_bonus);
            if bonus >= max_bonus * 0.9 {
                break;
            }
        }
        bonus
    }

    /// Penalize intermediate hops whose adjacent edges carry unreasonably
    /// long stored distances (a LoRa hop rarely bridges tens of km). A
    /// softer penalty starts at 80% of the threshold to prefer short hops
    /// when the graph evidence is otherwise similar.
    fn intermediate_distance_penalty(
        &self,
        graph: &MeshGraph,
        record: &RepeaterRecord,
        candidate_prefix: Prefix,
        prev: Option<Prefix>,
        next: Option<Prefix>,
        score: f64,
    ) -> f64 {
        if record.latitude.is_none() || record.longitude.is_none() {
            return score;
        }

        let mut max_distance = 0.0f64;
        if let Some(prev) = prev {
            if let Some(distance) = graph
                .get_edge(prev, candidate_prefix)
                .and_then(|e| e.geographic_distance)
            {
                max_distance = max_distance.max(distance);
            }
        }
        if let Some(next) = next {
            if let Some(distance) = graph
                .get_edge(candidate_prefix, next)
                .and_then(|e| e.geographic_distance)
            {
                max_distance = max_distance.max(distance);
            }
        }

        let threshold = self.config.graph_max_reasonable_hop_distance_km();
        let strength = self.config.graph_distance_penalty_strength();
        if max_distance > threshold {
            let normalized_excess = ((max_distance - threshold) / threshold).min(1.0);
            let penalty = normalized_excess * strength;
            score * (1.0 - penalty)
        } else if max_distance > threshold * 0.8 {
            let small_penalty =
                (max_distance - threshold * 0.8) / (threshold * 0.2) * strength * 0.5;
            score * (1.0 - small_penalty)
        } else {
            score
        }
    }

    /// Final-hop adjustment: blend in proximity to the bot (ramping the
    /// weight up for close candidates), or halve the score of candidates
    /// that hide their location.
    fn final_hop_adjustment(&self, record: &RepeaterRecord, score: f64) -> f64 {
        let Some(bot) = self.bot_location else {
            return score;
        };
        let config = &self.config;

        match record.coordinates() {
            Some(location) => {
                let distance = distance_km(bot, location);
                if config.graph_final_hop_max_distance > 0.0
                    && distance > config.graph_final_hop_max_distance
                {
                    log::debug!(
                        "final hop candidate {} is {distance:.1} km from bot, beyond max distance",
                        record.name
                    );
                    return score;
                }
                let proximity = proximity_score(
                    distance,
                    config.graph_final_hop_proximity_normalization_km,
                );
                let mut weight = config.graph_final_hop_proximity_weight();
                if distance < config.graph_final_hop_very_close_threshold_km {
                    weight = (weight * 2.0).min(config.graph_final_hop_max_proximity_weight);
                } else if distance < config.graph_final_hop_close_threshold_km {
                    weight = (weight * 1.5).min(0.5);
                }
                score * (1.0 - weight) + proximity * weight
            }
            None => score * 0.5,
        }
    }

    /// Geographic selection entry point: location-filtered candidates go
    /// through the configured proximity calculator.
    async fn select_by_proximity(
        &self,
        candidates: &[RepeaterRecord],
        index: usize,
        path: &[Prefix],
        sender_location: Option<(f64, f64)>,
    ) -> Option<(RepeaterRecord, f64)> {
        self.bot_location?;

        let with_location: Vec<&RepeaterRecord> = candidates
            .iter()
            .filter(|r| r.coordinates().is_some())
            .collect();
        if with_location.is_empty() {
            return None;
        }

        match self.config.proximity_method {
            ProximityMethod::Path => {
                match self
                    .select_by_path_proximity(&with_location, index, path, sender_location)
                    .await
                {
                    Some(result) => Some(result),
                    None if self.config.path_proximity_fallback => {
                        self.select_by_simple_proximity(&with_location)
                    }
                    None => None,
                }
            }
            ProximityMethod::Simple => self.select_by_simple_proximity(&with_location),
        }
    }

    /// Distance to the bot, blended with recency; confidence from the
    /// margin over the runner-up, tie-broken deterministically.
    fn select_by_simple_proximity(
        &self,
        candidates: &[&RepeaterRecord],
    ) -> Option<(RepeaterRecord, f64)> {
        let bot = self.bot_location?;
        let config = &self.config;
        let now = Utc::now();

        let scored: Vec<(&RepeaterRecord, f64)> = candidates
            .iter()
            .map(|r| {
                (
                    *r,
                    recency_score(
                        r.most_recent_activity(),
                        now,
                        config.recency_decay_half_life_hours,
                    ),
                )
            })
            .filter(|(_, s)| *s >= MIN_RECENCY_SCORE)
            .collect();

        if scored.is_empty() {
            return None;
        }
        if scored.len() == 1 {
            let (record, recency) = scored[0];
            let distance = distance_km(bot, record.coordinates()?);
            if config.max_proximity_range > 0.0 && distance > config.max_proximity_range {
                return None;
            }
            return Some((record.clone(), score_confidence(recency)));
        }

        let mut combined: Vec<(f64, f64, &RepeaterRecord)> = Vec::with_capacity(scored.len());
        for (record, recency) in scored {
            let distance = distance_km(bot, record.coordinates()?);
            if config.max_proximity_range > 0.0 && distance > config.max_proximity_range {
                continue;
            }
            let proximity = proximity_score(distance, PROXIMITY_NORMALIZATION_KM);
            let mut score = combined_score(recency, proximity, config.recency_weight);
            if record.is_starred {
                score *= config.star_bias_multiplier;
            }
            if record.snr.is_some() {
                // direct neighbor: add 20% of the combined score
                score += score * 0.2;
            }
            combined.push((score, distance, record));
        }
        if combined.is_empty() {
            return None;
        }

        combined.sort_by_key(|(score, _, _)| std::cmp::Reverse(OrderedFloat(*score)));
        let (best_score, _, best_record) = combined[0];

        let confidence = if combined.len() == 1 {
            score_confidence(best_score)
        } else {
            match ratio_confidence(best_score, combined[1].0) {
                Some(confidence) => confidence,
                None => {
                    // too close to call on score alone
                    let distances: Vec<(f64, &RepeaterRecord)> =
                        combined.iter().map(|(_, d, r)| (*d, *r)).collect();
                    return break_distance_tie(&distances).map(|record| (record, 0.5));
                }
            }
        };
        Some((best_record.clone(), confidence))
    }

    /// Proximity against the adjacent path positions: the first hop anchors
    /// on the sender, the last on the bot, hops in between on their
    /// neighbors' best-known locations.
    async fn select_by_path_proximity(
        &self,
        candidates: &[&RepeaterRecord],
        index: usize,
        path: &[Prefix],
        sender_location: Option<(f64, f64)>,
    ) -> Option<(RepeaterRecord, f64)> {
        if index == 0 {
            if let Some(sender) = sender_location {
                log::debug!(
                    "using sender location for first-hop proximity: {:.4}, {:.4}",
                    sender.0,
                    sender.1
                );
                return self.select_by_single_proximity(candidates, sender, ProximityAnchor::Sender);
            }
        }

        if index + 1 == path.len() {
            if let Some(bot) = self.bot_location {
                log::debug!(
                    "using bot location for last-hop proximity: {:.4}, {:.4}",
                    bot.0,
                    bot.1
                );
                return self.select_by_single_proximity(candidates, bot, ProximityAnchor::Bot);
            }
        }

        let prev_location = match index.checked_sub(1).map(|i| path[i]) {
            Some(prev) => self.node_location(prev).await,
            None => None,
        };
        let next_location = match path.get(index + 1) {
            Some(next) => self.node_location(*next).await,
            None => None,
        };

        match (prev_location, next_location) {
            (Some(prev), Some(next)) => self.select_by_dual_proximity(candidates, prev, next),
            (Some(prev), None) => {
                self.select_by_single_proximity(candidates, prev, ProximityAnchor::Previous)
            }
            (None, Some(next)) => {
                self.select_by_single_proximity(candidates, next, ProximityAnchor::Next)
            }
            (None, None) => None,
        }
    }

    async fn node_location(&self, prefix: Prefix) -> Option<(f64, f64)> {
        self.contacts
            .best_location_for_prefix(prefix, self.config.max_repeater_age_days)
            .await
            .unwrap_or_else(|e| {
                log::warn!("error getting location for node {prefix}: {e}");
                None
            })
    }

    fn select_by_single_proximity(
        &self,
        candidates: &[&RepeaterRecord],
        reference: (f64, f64),
        anchor: ProximityAnchor,
    ) -> Option<(RepeaterRecord, f64)> {
        let config = &self.config;
        let (recency_weight, proximity_weight) = anchor.weights(config);
        let now = Utc::now();

        let mut best: Option<(f64, &RepeaterRecord)> = None;
        for &record in candidates {
            let recency = recency_score(
                record.most_recent_activity(),
                now,
                config.recency_decay_half_life_hours,
            );
            if recency < MIN_RECENCY_SCORE {
                continue;
            }
            let distance = distance_km(reference, record.coordinates()?);
            if config.max_proximity_range > 0.0 && distance > config.max_proximity_range {
                continue;
            }
            let proximity = proximity_score(distance, PROXIMITY_NORMALIZATION_KM);
            let mut score = recency * recency_weight + proximity * proximity_weight;
            if record.is_starred {
                score *= config.star_bias_multiplier;
            }
            if record.snr.is_some() {
                score += score * 0.2;
            }
            if best.map(|(s, _)| score > s).unwrap_or(true) {
                best = Some((score, record));
            }
        }

        let (score, record) = best?;
        Some((record.clone(), score_confidence(score)))
    }

    fn select_by_dual_proximity(
        &self,
        candidates: &[&RepeaterRecord],
        prev_location: (f64, f64),
        next_location: (f64, f64),
    ) -> Option<(RepeaterRecord, f64)> {
        let config = &self.config;
        let now = Utc::now();

        let mut best: Option<(f64, &RepeaterRecord)> = None;
        for &record in candidates {
            let recency = recency_score(
                record.most_recent_activity(),
                now,
                config.recency_decay_half_life_hours,
            );
            if recency < MIN_RECENCY_SCORE {
                continue;
            }
            let location = record.coordinates()?;
            let avg_distance =
                (distance_km(prev_location, location) + distance_km(next_location, location)) / 2.0;
            let proximity = proximity_score(avg_distance, PROXIMITY_NORMALIZATION_KM);
            let mut score = combined_score(recency, proximity, config.recency_weight);
            if record.is_starred {
                score *= config.star_bias_multiplier;
            }
            if record.snr.is_some() {
                score += score * 0.2;
            }
            if best.map(|(s, _)| score > s).unwrap_or(true) {
                best = Some((score, record));
            }
        }

        let (score, record) = best?;
        // the winner must sit within range of both neighbors
        if config.max_proximity_range > 0.0 {
            let location = record.coordinates()?;
            if distance_km(prev_location, location) > config.max_proximity_range
                || distance_km(next_location, location) > config.max_proximity_range
            {
                return None;
            }
        }
        Some((record.clone(), score_confidence(score)))
    }

    /// Fallback to the radio's live contact list when the store knows
    /// nothing under this prefix. Device rows carry no recency or location,
    /// so a single hit is an active single candidate and several hits are a
    /// collision without further scoring.
    fn resolve_from_live_contacts(&self, prefix: Prefix) -> Resolution {
        let Some(live_contacts) = &self.live_contacts else {
            return Resolution::NotFound;
        };
        let mut matches = live_contacts.repeaters_matching(prefix);
        match matches.len() {
            0 => Resolution::NotFound,
            1 => {
                let contact = matches.remove(0);
                Resolution::Found {
                    record: live_contact_record(contact.name, contact.public_key),
                    method: None,
                    confidence: None,
                    from_live_contacts: true,
                }
            }
            n => Resolution::Collision {
                matches: n,
                candidates: matches
                    .into_iter()
                    .map(|c| live_contact_record(c.name, c.public_key))
                    .collect(),
            },
        }
    }
}

fn live_contact_record(name: String, public_key: String) -> RepeaterRecord {
    RepeaterRecord {
        public_key,
        name,
        role: NodeRole::Repeater,
        latitude: None,
        longitude: None,
        city: None,
        state: None,
        country: None,
        last_heard: None,
        last_advert_timestamp: None,
        advert_count: 0,
        signal_strength: None,
        snr: None,
        hop_count: None,
        is_starred: false,
        is_active: true,
    }
}
