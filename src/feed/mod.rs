//! Remote catalog feed access.
//!
//! - [`parser`] - OPDS/Atom catalog parsing into entry drafts
//! - [`fetcher`] - size-capped HTTP retrieval of the feed
//! - [`favicon`] - background icon downloads for catalog entries

pub mod favicon;
pub mod fetcher;
pub mod parser;

pub use favicon::FaviconFetcher;
pub use fetcher::{build_client, fetch_feed, FetchError, MAX_FEED_SIZE};
pub use parser::{parse_catalog, EntryError, ParseError, ParseResult};
