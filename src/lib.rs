//! Catalog synchronization engine for an offline content library.
//!
//! The engine keeps a local SQLite catalog of downloadable content packages
//! in line with a remote OPDS feed, and propagates catalog writes made by
//! any cooperating process into each process's query cache through a
//! durable change log.

pub mod config;
pub mod feed;
pub mod storage;
pub mod sync;
pub mod util;
