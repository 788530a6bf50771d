//! Local-first publishing for planets: owned sites built into static trees
//! and published under IPNS names, followed sites mirrored from remote
//! manifests and feeds, and aggregation between the two.

pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod guard;
pub mod ipfs;
pub mod media;
pub mod model;
pub mod reconcile;
pub mod registry;
pub mod render;
pub mod scheduler;
pub mod store;
pub mod syndication;
pub mod wire;

pub use engine::{Services, Settings};
pub use error::{PlanetError, Result};
pub use registry::SiteRegistry;
pub use scheduler::Scheduler;
