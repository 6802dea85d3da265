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
//! Path decoding: turn a textual routing trace into per-hop resolutions.
//!
//! Accepts comma-, colon-, space-separated or plain concatenated hex and
//! preserves the hop order throughout. Each token is resolved independently;
//! one unknown or ambiguous hop never fails the rest of the path.

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::resolver::{CandidateResolver, Resolution};
use crate::Prefix;

lazy_static! {
    static ref HEX_TOKEN: Regex = Regex::new(r"[0-9a-fA-F]{2}").unwrap();
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no valid hex node identifiers found in path input")]
    NoHexTokens,
}

/// One resolved position of a decoded path.
#[derive(Debug)]
pub struct DecodedHop {
    /// The prefix as received, uppercased for display.
    pub token: String,
    pub prefix: Prefix,
    pub resolution: Resolution,
}

/// Decodes whole routing traces via a [`CandidateResolver`].
pub struct PathDecoder {
    resolver: CandidateResolver,
}

impl PathDecoder {
    pub fn new(resolver: CandidateResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &CandidateResolver {
        &self.resolver
    }

    /// Extract the two-digit hex tokens of a path input, in order.
    pub fn parse_tokens(input: &str) -> Result<Vec<Prefix>, DecodeError> {
        let normalized = input.replace([',', ':'], " ");
        let tokens: Vec<Prefix> = HEX_TOKEN
            .find_iter(&normalized)
            .filter_map(|m| Prefix::parse(m.as_str()))
            .collect();
        if tokens.is_empty() {
            return Err(DecodeError::NoHexTokens);
        }
        Ok(tokens)
    }

    /// Decode a path, resolving every hop in order. `sender_public_key`
    /// (when the trace came attached to a message) anchors the first hop.
    pub async fn decode(
        &self,
        input: &str,
        sender_public_key: Option<&str>,
    ) -> Result<Vec<DecodedHop>, DecodeError> {
        let path = Self::parse_tokens(input)?;
        log::info!(
            "decoding path with {} nodes: {}",
            path.len(),
            path.iter().map(|p| p.display_upper()).join(",")
        );

        let mut hops = Vec::with_capacity(path.len());
        for (index, prefix) in path.iter().enumerate() {
            let resolution = self.resolver.resolve(index, &path, sender_public_key).await;
            hops.push(DecodedHop {
                token: prefix.display_upper(),
                prefix: *prefix,
                resolution,
            });
        }
        Ok(hops)
    }
}
