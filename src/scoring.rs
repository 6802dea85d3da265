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
//! Pure scoring primitives shared by the graph and the candidate resolver.

use chrono::{DateTime, Utc};
use geoutils::Location;
use ordered_float::OrderedFloat;

use crate::contacts::RepeaterRecord;

/// Minimum recency score a candidate must reach to be considered at all.
/// With the default 12 h half-life this keeps roughly the last 55 hours.
pub const MIN_RECENCY_SCORE: f64 = 0.01;

/// Distance used to normalize proximity scores between path nodes (km).
pub const PROXIMITY_NORMALIZATION_KM: f64 = 1000.0;

/// Great-circle distance between two `(latitude, longitude)` pairs in km.
pub fn distance_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let a = Location::new(a.0, a.1);
    let b = Location::new(b.0, b.1);
    a.distance_to(&b)
        .unwrap_or_else(|_| a.haversine_distance_to(&b))
        .meters()
        / 1000.0
}

/// Valid coordinates, treating `(0.0, 0.0)` as "location withheld".
pub fn valid_coordinates(lat: Option<f64>, lon: Option<f64>) -> Option<(f64, f64)> {
    match (lat, lon) {
        (Some(lat), Some(lon)) if !(lat == 0.0 && lon == 0.0) => Some((lat, lon)),
        _ => None,
    }
}

/// Exponential recency decay: `e^(-hours / half_life)`, clamped to `[0, 1]`.
///
/// A record with no usable timestamp scores a flat 0.1 so that it survives
/// the [`MIN_RECENCY_SCORE`] filter but loses against anything heard recently.
pub fn recency_score(
    most_recent: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    half_life_hours: f64,
) -> f64 {
    let Some(t) = most_recent else {
        return 0.1;
    };
    let hours_ago = (now - t).num_seconds() as f64 / 3600.0;
    (-hours_ago / half_life_hours).exp().clamp(0.0, 1.0)
}

/// Proximity score from a distance: closer is higher, zero beyond `norm_km`.
pub fn proximity_score(distance_km: f64, norm_km: f64) -> f64 {
    1.0 - (distance_km / norm_km).min(1.0)
}

/// Blend of recency and proximity with the configured recency weight.
pub fn combined_score(recency: f64, proximity: f64, recency_weight: f64) -> f64 {
    recency * recency_weight + proximity * (1.0 - recency_weight)
}

/// Confidence derived from a combined score: `0.4 + 0.5 * score`, clamped.
pub fn score_confidence(score: f64) -> f64 {
    (0.4 + score * 0.5).clamp(0.0, 1.0)
}

/// Confidence from the margin between the best and second-best score.
/// `None` means the scores are too close and a tie-breaker must decide.
pub fn ratio_confidence(best: f64, second: f64) -> Option<f64> {
    let ratio = if second > 0.0 { best / second } else { 1.0 };
    if ratio > 1.5 {
        Some(0.9)
    } else if ratio > 1.2 {
        Some(0.8)
    } else if ratio > 1.1 {
        Some(0.7)
    } else {
        None
    }
}

/// Deterministic tie-breaking among repeaters at the same distance.
///
/// Order of criteria: active status, most recent observed activity, higher
/// advert count, and finally the name (so the result never depends on query
/// order). `distances` pairs each repeater with its reference distance; only
/// the ones sharing the minimum distance take part.
pub fn break_distance_tie(distances: &[(f64, &RepeaterRecord)]) -> Option<RepeaterRecord> {
    let min_distance = distances
        .iter()
        .map(|(d, _)| OrderedFloat(*d))
        .min()?
        .into_inner();
    let mut tied: Vec<&RepeaterRecord> = distances
        .iter()
        .filter(|(d, _)| *d == min_distance)
        .map(|(_, r)| *r)
        .collect();

    let active: Vec<&RepeaterRecord> = tied.iter().copied().filter(|r| r.is_active).collect();
    if active.len() == 1 {
        return Some(active[0].clone());
    } else if !active.is_empty() {
        tied = active;
    }

    tied.sort_by_key(|r| r.name.clone());
    tied.sort_by_key(|r| std::cmp::Reverse(r.advert_count));
    tied.sort_by_key(|r| {
        std::cmp::Reverse(r.most_recent_activity().unwrap_or(DateTime::<Utc>::MIN_UTC))
    });

    tied.first().map(|r| (*r).clone())
}
