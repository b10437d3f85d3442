//! cachefilesd — userspace culling and consistency-checking daemon for the
//! CacheFiles kernel cache.
//!
//! The kernel stores arbitrary network/filesystem objects as regular files
//! under a cache root; when disk occupancy crosses a threshold it asks this
//! daemon to select and delete least-recently-used objects. This crate
//! holds the pieces that cooperate to do that: a bounded LRU [`queue`] of
//! culling candidates, a two-pass [`fsck`] for the on-disk index files, a
//! [`reaper`] for the graveyard directory the kernel moves culled objects
//! into, and the [`control`] loop that ties them together over the
//! [`channel`] to the kernel.

#![warn(rust_2018_idioms, unreachable_pub)]

pub mod channel;
pub mod config;
pub mod control;
pub mod error;
pub mod fsck;
pub mod handle;
pub mod index_io;
pub mod logging;
pub mod queue;
pub mod reaper;
pub mod record;
pub mod signals;
pub mod state;
pub mod xattr;

pub use error::{Error, Result};
