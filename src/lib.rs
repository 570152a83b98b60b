//! # Memory Defrag
//!
//! Finds near-duplicate records in an embedding-backed memory store,
//! synthesizes one consolidated record per group, and commits approved
//! merges with a checksummed backup and an all-or-nothing write.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//! │    Store    │──▶│  Clustering │──▶│  Synthesis  │
//! │ SQLite/Coll │   │ seed growth │   │ merge text  │
//! └──────▲──────┘   └─────────────┘   └──────┬──────┘
//!        │                                   │ approval
//!        │          ┌─────────────┐   ┌──────▼──────┐
//!        └──────────│   Backup    │◀──│  Optimize   │
//!          commit   │ gzip / zip  │   │ validate +  │
//!                   └─────────────┘   │   commit    │
//!                                     └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! memdefrag --store ./data/memory.db analyze
//! memdefrag --store ./data/memory.db preview --all
//! memdefrag --store ./data/memory.db optimize --all
//! memdefrag --store ./data/memory.db backup list
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`similarity`] | Cosine similarity and embedding codecs |
//! | [`cluster`] | Near-duplicate clustering |
//! | [`synthesize`] | Merged content and metadata |
//! | [`recommend`] | Advisory recommendations |
//! | [`optimize`] | Validation, planning and commit of merges |
//! | [`backup`] | Compressed, checksummed store snapshots |
//! | [`catalog`] | Backup catalog persistence |
//! | [`store`] | Store adapters (SQLite, collection, in-memory) |
//! | [`bridge`] | Out-of-process collection bridge |
//! | [`session`] | One open store and the operations on it |
//! | [`progress`] | Analysis progress reporting |
//! | [`stats`] | Store statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod backup;
pub mod bridge;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod db;
pub mod error;
pub mod migrate;
pub mod models;
pub mod optimize;
pub mod progress;
pub mod recommend;
pub mod session;
pub mod similarity;
pub mod stats;
pub mod store;
pub mod synthesize;
