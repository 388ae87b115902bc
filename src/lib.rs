//! `tux3-core`: the on-disk core of a versioning filesystem engine — a
//! buffer cache, a copy-on-write B-tree with pluggable leaf formats, a
//! write-ahead log, a delta commit loop, and a content-defined dedup
//! index.
//!
//! Mount/format front-ends, the command-line harness, and directory/xattr
//! syntax live above this crate; see each module's doc comment for the
//! component it implements and what it is grounded on.

pub mod bitmap;
pub mod btree;
pub mod bucket;
pub mod buffer;
pub mod codec;
pub mod commit;
pub mod config;
pub mod dedup;
pub mod device;
pub mod dleaf;
pub mod error;
pub mod hleaf;
pub mod ileaf;
pub mod log;
pub mod sb;

pub use config::EngineConfig;
pub use error::{Error, ErrorKind, Result};
pub use sb::{Layout, Superblock};
