//! # Beak - deduplicating snapshot archives as virtual tar trees
//!
//! A backup engine that presents a live directory tree as a **virtual
//! archive file system**: a synthetic tree of tar-formatted segments whose
//! names encode content fingerprints, sizes, timestamps and part numbers.
//! Unchanged subtrees produce byte-identical segments on every run, which
//! is what makes pushing to a remote store cheap: the remote is diffed by
//! segment name alone.
//!
//! ## Overview
//!
//! The engine works in two directions:
//!
//! - **Forward**: [`Packer`] walks an origin tree and groups it into
//!   payload segments plus one index segment per directory; [`ForwardFs`]
//!   serves that synthetic tree through FUSE-style callbacks, synthesizing
//!   tar bytes on the fly for any `(path, offset, size)`; no tar file is
//!   ever materialized unless you ask for it.
//! - **Reverse**: [`ReverseFs`] reads a storage full of segments, discovers
//!   the **points in time** anchored by top-level index segments, and
//!   reconstructs the origin tree read-only, lazily fetching and
//!   decompressing segments through [`CacheFs`].
//!
//! Between the two sits the storage layer ([`storage`]): a uniform
//! list/push/fetch contract over a local directory, an rsync-class tool or
//! an rclone-class tool, driven entirely by parsing remote listings and
//! diffing segment names.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use beak::{ChunkingPolicy, ForwardFs, Packer, Storage};
//! use std::path::Path;
//!
//! # fn main() -> beak::Result<()> {
//! // Pack a directory into a virtual segment tree.
//! let tree = Packer::new(ChunkingPolicy::default()).pack(Path::new("/home/me/work"))?;
//! let fs = ForwardFs::new(tree);
//!
//! // Materialize it locally, then push only what the remote is missing.
//! fs.store_to(Path::new("/backups/work"))?;
//! beak::storage::sync(
//!     Path::new("/backups/work"),
//!     &Storage::rclone("remote:work"),
//!     &mut |file| println!("pushed {file}"),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! Browsing history back out:
//!
//! ```rust,no_run
//! use beak::{BeakConfig, CacheFs, ReverseFs, Storage, TreePath};
//! use beak::vfs::FuseOps;
//!
//! # fn main() -> beak::Result<()> {
//! let config = BeakConfig::load()?;
//! let storage = Storage::rclone("remote:work");
//! let cache = CacheFs::new(storage.clone(), config.cache_dir_for(&storage)?)?;
//! // `@0` is the newest snapshot, `@3` three snapshots back.
//! let mount = ReverseFs::mount(cache, Some("@0"))?;
//! let readme = mount.read(&TreePath::lookup("/README.md"), 0, 4096)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module organization
//!
//! - [`path`]: interned tree paths with a depth-first total order
//! - [`tar`]: ustar + GNU long-name codec, bit-exact
//! - [`naming`]: segment file name bijection
//! - [`index`]: per-directory index block codec
//! - [`pack`]: the forward packer and its chunking policy
//! - [`vfs`]: FUSE-style callbacks over the synthetic tree
//! - [`reverse`]: point-in-time discovery and lazy reverse mounting
//! - [`storage`]: list/push/fetch over local, rsync-like, rclone-like
//! - [`cache`]: read-only cached view of a remote storage
//! - [`config`], [`shutdown`], [`stats`]: per-user config, signal-driven
//!   shutdown, progress accounting
//!
//! ## Error handling
//!
//! Everything returns [`Result<T>`](Result) with [`BeakError`] covering
//! I/O, parse, integrity, subprocess, not-found and unsupported failures;
//! each kind maps to a stable process exit code.

pub mod cache;
pub mod config;
pub mod error;
pub mod index;
pub mod naming;
pub mod pack;
pub mod path;
pub mod reverse;
pub mod shutdown;
pub mod stats;
pub mod storage;
pub mod tar;
pub mod types;
pub mod vfs;

mod collections;

// Re-export main types for convenience
pub use cache::CacheFs;
pub use config::BeakConfig;
pub use error::{BeakError, Result};
pub use naming::{SegmentKind, SegmentName};
pub use pack::{Packer, SegmentTree};
pub use path::TreePath;
pub use reverse::{PointInTime, ReverseFs};
pub use shutdown::Shutdown;
pub use stats::{ProgressTicker, StoreStatistics};
pub use storage::{Listing, Storage, StorageBackend};
pub use types::{ChunkingPolicy, DiskUpdate, FileKind, FileStat, Timespec};
pub use vfs::{ForwardFs, FuseOps};

#[cfg(test)]
mod tests;
