//! Transactional storage core: disk manager, write-ahead log, ARIES
//! recovery, two-phase commit.
//!
//! The crate is organized the way the on-disk state is layered: [`disk`]
//! owns volume headers and allocation bitmaps, [`log`] owns the active log
//! file, its page buffer and the archives, [`tran`] owns the transaction
//! table, and [`recovery`] stitches them back together after a crash.
//! Everything above this crate (heap, b-tree, SQL) talks to it through
//! [`engine::Engine`].

pub mod checkpoint;
pub mod config;
pub mod disk;
pub mod engine;
pub mod error;
pub mod io;
pub mod log;
pub mod lsa;
pub mod record;
pub mod recovery;
pub mod tran;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use lsa::Lsa;
