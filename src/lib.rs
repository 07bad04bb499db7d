//! Fleet-internal BitTorrent swarm for distributing model artifacts between
//! co-located pods (§1, §2). Peer identity comes exclusively from cluster
//! DNS; there are no external trackers and no DHT.
//!
//! The public contract is [`distributor::Distributor`] (component G, §4.7):
//! construct one from a validated [`config::Config`] and a
//! [`swarm::SwarmClient`], then call `try_p2p_download`, `seed_model`,
//! `stop_seeding`, or `has_peers`. [`server::router`] mounts the companion
//! HTTP surface (component E, §4.6) that lets peer pods answer each other's
//! metainfo requests.

pub mod client;
pub mod config;
pub mod discovery;
pub mod distributor;
pub mod error;
pub mod hasher;
pub mod metainfo;
pub mod metrics;
pub mod server;
pub mod swarm;
pub mod types;
