//! Orchestration around the index core: shard directories and the federated
//! query coordinator.
//!
//! `ShardPublisher` owns a shard directory (`src/` + `idx/` + published full
//! indexes): it indexes unpacked packages with bounded concurrency, merges
//! package indexes into a fresh full index (at most one merge at a time) and
//! garbage-collects packages. `Coordinator` fans a regex query out to shard
//! backends over TCP, streams their JSON results into per-backend spill
//! files, keeps a running top-10, and packages the sorted results into page
//! files once every backend has reported completion.

mod backend;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod shard;
pub mod spill;
pub mod stringpool;

pub use config::{load_coordinator_config, ConfigOverrides, CoordinatorConfig};
pub use coordinator::{Coordinator, QueryState, QueryStats, VersionCmp};
pub use events::{ErrorKind, Event};
pub use shard::ShardPublisher;
pub use spill::ResultPointer;
pub use stringpool::StringPool;
