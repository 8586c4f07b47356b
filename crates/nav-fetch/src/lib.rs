//! Fetch orchestration and wire formats for the client prefetch cache.
//!
//! This crate provides:
//! - `Transport` / `PayloadDecoder` - network and decoding seams
//! - wire structs for both route formats and segment payloads
//! - converters between the wire formats and the route tree
//! - `PrefetchFetcher` - the orchestration that issues prefetch requests
//!   and writes results into the store
//!
//! Orchestration entry points never surface errors: failures reject the
//! target cache entry with a fixed retry backoff and callers re-poll.

mod convert;
mod decode;
mod error;
mod fetcher;
mod protocol;
mod route;
mod segment;
mod transport;
mod wire;

pub use convert::*;
pub use decode::*;
pub use error::FetchError;
pub use fetcher::*;
pub use protocol::*;
pub use segment::SpawnedEntries;
pub use transport::*;
pub use wire::*;
