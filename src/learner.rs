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
//! Graph learning hook for the passive path observer.
//!
//! Whoever watches received packets (advertisement handler, trace sniffer)
//! hands complete routing traces to [`PathLearner::learn_path`]; the learner
//! inserts one edge per consecutive pair, enriched with whatever identities
//! and coordinates the contact store knows. It never runs inside the
//! decoder.

use std::sync::Arc;

use crate::contacts::ContactStore;
use crate::graph::{EdgeObservation, MeshGraph};
use crate::scoring::distance_km;
use crate::Prefix;

/// One hop of an observed routing trace. The prefix always comes off the
/// wire; the full key is only known for special positions (e.g. the
/// advertising node at the end of an advert path).
#[derive(Debug, Clone)]
pub struct ObservedHop {
    pub prefix: String,
    pub public_key: Option<String>,
}

impl ObservedHop {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            public_key: None,
        }
    }

    /// A hop whose full public key is known; the prefix is derived from it.
    pub fn keyed(public_key: impl Into<String>) -> Self {
        let public_key = public_key.into();
        Self {
            prefix: public_key.chars().take(2).collect::<String>().to_ascii_lowercase(),
            public_key: Some(public_key),
        }
    }
}

/// Feeds observed paths into the mesh graph.
pub struct PathLearner {
    graph: Arc<MeshGraph>,
    contacts: Arc<dyn ContactStore>,
    max_age_days: i64,
}

impl PathLearner {
    pub fn new(graph: Arc<MeshGraph>, contacts: Arc<dyn ContactStore>, max_age_days: i64) -> Self {
        Self {
            graph,
            contacts,
            max_age_days,
        }
    }

    /// Record every consecutive pair of `hops` as a directed edge. The hop
    /// position stored with each edge is the path index of its destination;
    /// the distance is computed when both endpoints have a known location.
    /// Lookup failures degrade to edges without distance.
    pub async fn learn_path(&self, hops: &[ObservedHop]) {
        if hops.len() < 2 {
            return;
        }

        // resolve each hop's location once up front
        let mut locations = Vec::with_capacity(hops.len());
        for hop in hops {
            locations.push(self.hop_location(hop).await);
        }

        for (index, pair) in hops.windows(2).enumerate() {
            let (from, to) = (&pair[0], &pair[1]);
            let geographic_distance = match (locations[index], locations[index + 1]) {
                (Some(a), Some(b)) => Some(distance_km(a, b)),
                _ => None,
            };
            self.graph.add_edge(
                &from.prefix,
                &to.prefix,
                EdgeObservation {
                    from_public_key: from.public_key.clone(),
                    to_public_key: to.public_key.clone(),
                    hop_position: Some(index + 1),
                    geographic_distance,
                },
            );
        }
    }

    async fn hop_location(&self, hop: &ObservedHop) -> Option<(f64, f64)> {
        if let Some(key) = &hop.public_key {
            match self.contacts.location_by_public_key(key).await {
                Ok(Some(location)) => return Some(location),
                Ok(None) => {}
                Err(e) => log::debug!("error looking up location for key {key}: {e}"),
            }
        }
        let prefix = Prefix::parse(&hop.prefix)?;
        match self
            .contacts
            .best_location_for_prefix(prefix, self.max_age_days)
            .await
        {
            Ok(location) => location,
            Err(e) => {
                log::debug!("error looking up location for prefix {prefix}: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{batched_test_config, test_graph, test_key, test_repeater, StaticContacts};
    use crate::Prefix;

    fn p(s: &str) -> Prefix {
        Prefix::parse(s).unwrap()
    }

    #[tokio::test]
    async fn learns_consecutive_edges_with_positions() {
        let (_dir, graph) = test_graph();
        let learner = PathLearner::new(
            graph.clone(),
            std::sync::Arc::new(StaticContacts::default()),
            batched_test_config().max_repeater_age_days,
        );

        let hops = vec![
            ObservedHop::new("01"),
            ObservedHop::new("7e"),
            ObservedHop::keyed(test_key("86")),
        ];
        learner.learn_path(&hops).await;

        let first = graph.get_edge(p("01"), p("7e")).expect("first edge");
        assert_eq!(first.observation_count, 1);
        assert_eq!(first.avg_hop_position, Some(1.0));

        let second = graph.get_edge(p("7e"), p("86")).expect("second edge");
        assert_eq!(second.avg_hop_position, Some(2.0));
        assert_eq!(second.to_public_key, Some(test_key("86")));
    }

    #[tokio::test]
    async fn learns_distances_from_known_locations() {
        let (_dir, graph) = test_graph();

        let mut seattle = test_repeater("01", "Seattle");
        seattle.latitude = Some(47.6062);
        seattle.longitude = Some(-122.3321);
        let mut portland = test_repeater("7e", "Portland");
        portland.latitude = Some(45.5152);
        portland.longitude = Some(-122.6784);
        let contacts = StaticContacts::with_records(vec![seattle, portland]);

        let learner = PathLearner::new(graph.clone(), std::sync::Arc::new(contacts), 14);
        learner
            .learn_path(&[ObservedHop::new("01"), ObservedHop::new("7e")])
            .await;

        let edge = graph.get_edge(p("01"), p("7e")).unwrap();
        let distance = edge.geographic_distance.expect("distance learned");
        assert!((200.0..280.0).contains(&distance), "got {distance} km");
    }

    #[tokio::test]
    async fn short_or_malformed_traces_are_ignored() {
        let (_dir, graph) = test_graph();
        let learner = PathLearner::new(
            graph.clone(),
            std::sync::Arc::new(StaticContacts::default()),
            14,
        );

        learner.learn_path(&[ObservedHop::new("01")]).await;
        assert_eq!(graph.stats().0, 0);

        // the invalid middle prefix drops both adjacent edges silently
        learner
            .learn_path(&[
                ObservedHop::new("01"),
                ObservedHop::new(""),
                ObservedHop::new("7e"),
            ])
            .await;
        assert_eq!(graph.stats().0, 0);
    }
}
