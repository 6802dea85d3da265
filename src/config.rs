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
//! Resolver configuration: selection presets, write strategies, and every
//! tunable the scoring pipeline reads. Immutable after construction.

use serde::{Deserialize, Serialize};

/// How graph edges are persisted.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WriteStrategy {
    /// Every insert or update writes through to the store.
    Immediate,
    /// All writes are queued and flushed by the background worker.
    Batched,
    /// New edges write through, updates are batched.
    Hybrid,
}

/// How geographic proximity is computed for a candidate.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProximityMethod {
    /// Distance from the bot's own location.
    Simple,
    /// Distance from the adjacent nodes in the path being decoded.
    Path,
}

/// Preset balancing graph evidence against geographic evidence. The preset
/// provides defaults for the four knobs below; explicit settings override.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SelectionPreset {
    Balanced,
    Graph,
    Geographic,
}

impl SelectionPreset {
    /// Graph confidence above which graph selection overrides geography.
    fn confidence_threshold(self) -> f64 {
        match self {
            Self::Geographic => 0.5,
            Self::Graph => 0.9,
            Self::Balanced => 0.7,
        }
    }

    /// Largest hop distance considered reasonable for a LoRa link (km).
    fn distance_threshold_km(self) -> f64 {
        match self {
            Self::Geographic => 30.0,
            Self::Graph => 50.0,
            Self::Balanced => 30.0,
        }
    }

    /// Strength of the penalty applied beyond the distance threshold.
    fn distance_penalty(self) -> f64 {
        match self {
            Self::Geographic => 0.5,
            Self::Graph => 0.2,
            Self::Balanced => 0.3,
        }
    }

    /// Base weight of bot proximity when scoring the final hop.
    fn final_hop_weight(self) -> f64 {
        match self {
            Self::Geographic => 0.4,
            Self::Graph => 0.15,
            Self::Balanced => 0.25,
        }
    }
}

/// All tunables of the path resolver and mesh graph.
///
/// Deserializes from a flat config section; any missing key takes its
/// default. Call [`ResolverConfig::normalized`] after loading to clamp the
/// numeric ranges the scoring math relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub proximity_method: ProximityMethod,
    /// Fall back to simple proximity when path proximity yields nothing.
    pub path_proximity_fallback: bool,
    /// Hard rejection radius for proximity candidates (km); 0 disables.
    pub max_proximity_range: f64,
    /// Recency floor for the candidate query (days); 0 disables.
    pub max_repeater_age_days: i64,
    /// Weight of recency in combined scores; the rest goes to proximity.
    pub recency_weight: f64,
    pub recency_decay_half_life_hours: f64,

    pub path_selection_preset: SelectionPreset,

    pub graph_based_validation: bool,
    pub min_edge_observations: u32,
    pub graph_use_bidirectional: bool,
    pub graph_use_hop_position: bool,
    pub graph_multi_hop_enabled: bool,
    pub graph_multi_hop_max_hops: u8,
    /// Combine graph and geographic confidences instead of picking one.
    pub graph_geographic_combined: bool,
    /// Weight of the graph confidence in combined mode.
    pub graph_geographic_weight: f64,
    pub(crate) graph_confidence_override_threshold: Option<f64>,
    pub graph_distance_penalty_enabled: bool,
    pub(crate) graph_max_reasonable_hop_distance_km: Option<f64>,
    pub(crate) graph_distance_penalty_strength: Option<f64>,
    pub graph_zero_hop_bonus: f64,
    pub graph_prefer_stored_keys: bool,

    pub graph_final_hop_proximity_enabled: bool,
    pub(crate) graph_final_hop_proximity_weight: Option<f64>,
    /// Candidates farther than this from the bot get no final-hop bonus;
    /// 0 disables the limit.
    pub graph_final_hop_max_distance: f64,
    pub graph_final_hop_proximity_normalization_km: f64,
    pub graph_final_hop_very_close_threshold_km: f64,
    pub graph_final_hop_close_threshold_km: f64,
    pub graph_final_hop_max_proximity_weight: f64,

    pub graph_path_validation_max_bonus: f64,
    pub graph_path_validation_obs_divisor: f64,

    /// Multiplier applied to starred repeaters' scores; at least 1.
    pub star_bias_multiplier: f64,

    pub graph_write_strategy: WriteStrategy,
    pub graph_batch_interval_seconds: u64,
    pub graph_batch_max_pending: usize,
    /// Only load edges seen within this many days on startup; 0 loads all.
    pub graph_startup_load_days: i64,

    pub bot_latitude: Option<f64>,
    pub bot_longitude: Option<f64>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            proximity_method: ProximityMethod::Simple,
            path_proximity_fallback: true,
            max_proximity_range: 200.0,
            max_repeater_age_days: 14,
            recency_weight: 0.4,
            recency_decay_half_life_hours: 12.0,
            path_selection_preset: SelectionPreset::Balanced,
            graph_based_validation: true,
            min_edge_observations: 3,
            graph_use_bidirectional: true,
            graph_use_hop_position: true,
            graph_multi_hop_enabled: true,
            graph_multi_hop_max_hops: 2,
            graph_geographic_combined: false,
            graph_geographic_weight: 0.7,
            graph_confidence_override_threshold: None,
            graph_distance_penalty_enabled: true,
            graph_max_reasonable_hop_distance_km: None,
            graph_distance_penalty_strength: None,
            graph_zero_hop_bonus: 0.4,
            graph_prefer_stored_keys: true,
            graph_final_hop_proximity_enabled: true,
            graph_final_hop_proximity_weight: None,
            graph_final_hop_max_distance: 0.0,
            graph_final_hop_proximity_normalization_km: 200.0,
            graph_final_hop_very_close_threshold_km: 10.0,
            graph_final_hop_close_threshold_km: 30.0,
            graph_final_hop_max_proximity_weight: 0.6,
            graph_path_validation_max_bonus: 0.3,
            graph_path_validation_obs_divisor: 50.0,
            star_bias_multiplier: 2.5,
            graph_write_strategy: WriteStrategy::Hybrid,
            graph_batch_interval_seconds: 30,
            graph_batch_max_pending: 100,
            graph_startup_load_days: 0,
            bot_latitude: None,
            bot_longitude: None,
        }
    }
}

impl ResolverConfig {
    /// Clamp all weights and factors into the ranges the scoring math
    /// assumes. Returns the adjusted configuration.
    pub fn normalized(mut self) -> Self {
        self.recency_weight = self.recency_weight.clamp(0.0, 1.0);
        self.graph_geographic_weight = self.graph_geographic_weight.clamp(0.0, 1.0);
        self.graph_confidence_override_threshold = self
            .graph_confidence_override_threshold
            .map(|v| v.clamp(0.0, 1.0));
        self.graph_distance_penalty_strength = self
            .graph_distance_penalty_strength
            .map(|v| v.clamp(0.0, 1.0));
        self.graph_zero_hop_bonus = self.graph_zero_hop_bonus.clamp(0.0, 1.0);
        self.graph_final_hop_proximity_weight = self
            .graph_final_hop_proximity_weight
            .map(|v| v.clamp(0.0, 1.0));
        self.graph_final_hop_max_proximity_weight =
            self.graph_final_hop_max_proximity_weight.clamp(0.0, 1.0);
        self.graph_path_validation_max_bonus =
            self.graph_path_validation_max_bonus.clamp(0.0, 1.0);
        self.star_bias_multiplier = self.star_bias_multiplier.max(1.0);
        self
    }

    /// Graph confidence above which graph selection overrides geography.
    pub fn graph_confidence_override_threshold(&self) -> f64 {
        self.graph_confidence_override_threshold
            .unwrap_or_else(|| self.path_selection_preset.confidence_threshold())
    }

    /// Largest hop distance considered reasonable for a LoRa link (km).
    pub fn graph_max_reasonable_hop_distance_km(&self) -> f64 {
        self.graph_max_reasonable_hop_distance_km
            .unwrap_or_else(|| self.path_selection_preset.distance_threshold_km())
    }

    /// Strength of the penalty applied beyond the distance threshold.
    pub fn graph_distance_penalty_strength(&self) -> f64 {
        self.graph_distance_penalty_strength
            .unwrap_or_else(|| self.path_selection_preset.distance_penalty())
    }

    /// Base weight of bot proximity when scoring the final hop.
    pub fn graph_final_hop_proximity_weight(&self) -> f64 {
        self.graph_final_hop_proximity_weight
            .unwrap_or_else(|| self.path_selection_preset.final_hop_weight())
    }

    /// Weight of proximity in combined scores.
    pub fn proximity_weight(&self) -> f64 {
        1.0 - self.recency_weight
    }

    /// The bot's own coordinates, if configured and within range. Out-of-range
    /// coordinates disable geographic guessing and are reported once by the
    /// caller constructing the resolver.
    pub fn bot_location(&self) -> Option<(f64, f64)> {
        let (lat, lon) = (self.bot_latitude?, self.bot_longitude?);
        if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) {
            Some((lat, lon))
        } else {
            None
        }
    }

    /// Whether coordinates were configured but rejected as invalid.
    pub fn bot_location_invalid(&self) -> bool {
        self.bot_latitude.is_some() && self.bot_longitude.is_some() && self.bot_location().is_none()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_follow_balanced_preset() {
        let cfg = ResolverConfig::default();
        assert_eq!(cfg.graph_confidence_override_threshold(), 0.7);
        assert_eq!(cfg.graph_max_reasonable_hop_distance_km(), 30.0);
        assert_eq!(cfg.graph_distance_penalty_strength(), 0.3);
        assert_eq!(cfg.graph_final_hop_proximity_weight(), 0.25);
    }

    #[test]
    fn preset_can_be_overridden_per_knob() {
        let cfg: ResolverConfig = serde_json::from_str(
            r#"{"path_selection_preset": "graph", "graph_confidence_override_threshold": 0.65}"#,
        )
        .unwrap();
        assert_eq!(cfg.graph_confidence_override_threshold(), 0.65);
        // the untouched knobs still come from the graph preset
        assert_eq!(cfg.graph_max_reasonable_hop_distance_km(), 50.0);
        assert_eq!(cfg.graph_final_hop_proximity_weight(), 0.15);
    }

    #[test]
    fn normalization_clamps_weights() {
        let cfg = ResolverConfig {
            recency_weight: 1.7,
            star_bias_multiplier: 0.2,
            ..Default::default()
        }
        .normalized();
        assert_eq!(cfg.recency_weight, 1.0);
        assert_eq!(cfg.star_bias_multiplier, 1.0);
    }

    #[test]
    fn invalid_bot_coordinates_disable_geography() {
        let cfg = ResolverConfig {
            bot_latitude: Some(95.0),
            bot_longitude: Some(8.5),
            ..Default::default()
        };
        assert!(cfg.bot_location().is_none());
        assert!(cfg.bot_location_invalid());

        let cfg = ResolverConfig {
            bot_latitude: Some(47.4),
            bot_longitude: Some(8.5),
            ..Default::default()
        };
        assert_eq!(cfg.bot_location(), Some((47.4, 8.5)));
    }

    #[test]
    fn write_strategy_round_trips_through_strings() {
        use std::str::FromStr;
        assert_eq!(WriteStrategy::from_str("hybrid").unwrap(), WriteStrategy::Hybrid);
        assert_eq!(WriteStrategy::Batched.to_string(), "batched");
    }
}
