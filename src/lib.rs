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
//! Library for resolving observed mesh routing traces into repeater identities.
//!
//! A received packet carries its route as a sequence of one-byte node prefixes.
//! Prefixes are not unique, so the resolver combines three sources of evidence
//! to pick one repeater per hop: a persistent graph of observed links between
//! prefixes, geographic proximity to the surrounding hops (and to the bot
//! itself on the final hop), and how recently each candidate advertised.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod contacts;
pub mod decoder;
pub mod graph;
pub mod learner;
pub mod resolver;
pub mod scoring;

#[cfg(test)]
pub(crate) mod testutil;

/// A node prefix: the first byte of a public key, as two lowercase hex digits.
///
/// Mesh routing traces identify nodes only by this byte, so several repeaters
/// may share one prefix. Everything keyed on `Prefix` has to cope with that.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Prefix([u8; 2]);

impl Prefix {
    /// Parse the leading two hex digits of `s`, normalized to lowercase.
    /// Returns `None` for empty or non-hex input.
    pub fn parse(s: &str) -> Option<Self> {
        let mut digits = [0u8; 2];
        let mut chars = s.chars();
        for d in digits.iter_mut() {
            let c = chars.next()?.to_ascii_lowercase();
            if !c.is_ascii_hexdigit() {
                return None;
            }
            *d = c as u8;
        }
        Some(Self(digits))
    }

    /// The prefix of a full public key (its first byte).
    pub fn of_key(public_key: &str) -> Option<Self> {
        Self::parse(public_key)
    }

    /// Lowercase form used for lookups and persistence.
    pub fn as_str(&self) -> &str {
        // only constructed from ascii hex digits
        std::str::from_utf8(&self.0).unwrap()
    }

    /// Uppercase form used when displaying decoded paths.
    pub fn display_upper(&self) -> String {
        self.as_str().to_ascii_uppercase()
    }

    /// Whether `public_key` starts with this prefix (case-insensitive).
    pub fn matches_key(&self, public_key: &str) -> bool {
        Prefix::of_key(public_key) == Some(*self)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Prefix({})", self.as_str())
    }
}

impl TryFrom<String> for Prefix {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Prefix::parse(&s).ok_or_else(|| format!("invalid node prefix: {s:?}"))
    }
}

impl From<Prefix> for String {
    fn from(p: Prefix) -> String {
        p.as_str().to_string()
    }
}

pub mod prelude {
    pub use super::{
        config::{ProximityMethod, ResolverConfig, SelectionPreset, WriteStrategy},
        contacts::{ContactStore, RepeaterRecord, SqliteContactStore},
        decoder::{DecodedHop, PathDecoder},
        graph::MeshGraph,
        learner::PathLearner,
        resolver::{CandidateResolver, Resolution, SelectionMethod},
        Prefix,
    };
}
