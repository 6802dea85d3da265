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
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use meshpath::decoder::DecodedHop;
use meshpath::graph::EdgeStore;
use meshpath::learner::{ObservedHop, PathLearner};
use meshpath::prelude::*;
use meshpath::resolver::Resolution;

/// Decode a mesh routing trace into repeater identities.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Hex routing trace, e.g. "11,98,a4", "11 98 a4" or "1198a4"
    path: String,

    /// SQLite database holding the contact table and the mesh graph
    #[arg(long, default_value = "meshpath.db")]
    db: PathBuf,

    /// JSON file with the resolver configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Full public key of the message sender, anchoring the first hop
    #[arg(long)]
    sender: Option<String>,

    /// Record the trace as a graph observation before decoding it
    #[arg(long)]
    learn: bool,
}

fn format_hop(hop: &DecodedHop) -> String {
    match &hop.resolution {
        Resolution::Found {
            record,
            method,
            confidence,
            ..
        } => match (method, confidence) {
            (Some(method), Some(confidence)) => {
                format!("{}: {} ({method}, {confidence:.2})", hop.token, record.name)
            }
            _ => format!("{}: {}", hop.token, record.name),
        },
        Resolution::Collision { matches, .. } => {
            format!("{}: {matches} known repeaters share this prefix", hop.token)
        }
        Resolution::NotFound => format!("{}: unknown repeater", hop.token),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let config: ResolverConfig = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => ResolverConfig::default(),
    };
    let config = config.normalized();

    let contacts = Arc::new(SqliteContactStore::open(&args.db)?);
    let store = EdgeStore::open(&args.db)?;
    let graph = MeshGraph::new(store, &config);

    if args.learn {
        let hops: Vec<ObservedHop> = PathDecoder::parse_tokens(&args.path)?
            .iter()
            .map(|p| ObservedHop::new(p.as_str()))
            .collect();
        PathLearner::new(graph.clone(), contacts.clone(), config.max_repeater_age_days)
            .learn_path(&hops)
            .await;
    }

    let decoder = PathDecoder::new(CandidateResolver::new(
        config,
        contacts,
        Some(graph.clone()),
    ));
    let hops = decoder.decode(&args.path, args.sender.as_deref()).await?;
    for hop in &hops {
        println!("{}", format_hop(hop));
    }

    graph.shutdown();
    Ok(())
}
