#![doc = include_str!("../README.md")]

pub mod bridge;
pub mod cache;
pub mod cascade;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod identity;
pub mod normalize;
pub mod store;
pub mod types;

// Re-exports for convenient access
pub use bridge::{Injection, InjectionBridge};
pub use cache::StatusCache;
pub use cascade::{CascadeOutcome, EndpointCascade, FetchError, FetchStrategy, HttpStrategy};
pub use config::EngineConfig;
pub use engine::{EngineHandle, EntitlementEngine};
pub use error::Error;
pub use host::{HostRuntime, HostSignal, NullHost};
pub use identity::IdentityResolver;
pub use normalize::{NormalizeError, normalize};
pub use store::{ClientStore, MemoryStore};
pub use types::{
    AttemptOutcome, CacheEntry, CascadeAttempt, EndpointKind, EntitlementStatus,
    IdentitySourceRecord, Quota, SourceKind, StatusProvenance, StatusView, UserId,
};
