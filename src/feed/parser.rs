//! OPDS catalog feed parsing.
//!
//! The catalog feed is an Atom document whose `<entry>` elements describe
//! content packages. Parsing is streaming (quick-xml events) and tolerant at
//! the entry level: an entry with missing or invalid fields is skipped and
//! counted, while a broken document structure fails the whole parse.

use chrono::DateTime;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use url::Url;

use crate::storage::CatalogEntryDraft;

const REL_THUMBNAIL: &str = "http://opds-spec.org/image/thumbnail";
const REL_ACQUISITION: &str = "http://opds-spec.org/acquisition/open-access";

/// Maximum element nesting accepted before the document is rejected.
/// Prevents stack and memory abuse from maliciously deep documents.
const MAX_DEPTH: usize = 64;

/// Fatal feed-level parse failures. No drafts are returned when one occurs.
#[derive(Debug, Error)]
pub enum ParseError {
    /// XML syntax error (mismatched tags, bad attribute quoting, ...)
    #[error("XML parse error at byte {position}: {message}")]
    Xml { position: u64, message: String },

    /// The root element is not an Atom `<feed>`
    #[error("unexpected root element <{0}>, expected <feed>")]
    UnexpectedRoot(String),

    /// The document has no root element at all (empty or plain text)
    #[error("document contains no root element")]
    MissingRoot,

    /// The document ended while elements were still open
    #[error("document ended inside an open element")]
    Truncated,

    #[error("nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),
}

/// Why a single entry was skipped. Never surfaced beyond the parser.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntryError {
    #[error("missing required element {0}")]
    MissingField(&'static str),

    #[error("{field} is not a non-negative integer: '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    #[error("invalid creation date '{0}'")]
    InvalidDate(String),

    #[error("invalid link '{0}'")]
    InvalidUrl(String),

    /// Text or attribute content that failed to unescape
    #[error("unreadable content in <{0}>")]
    Unreadable(String),
}

/// Outcome of parsing a catalog feed
#[derive(Debug, Clone, Default)]
pub struct ParseResult {
    /// Well-formed entries in document order
    pub drafts: Vec<CatalogEntryDraft>,
    /// Number of entries skipped because they were malformed
    pub skipped: usize,
}

/// Parse a catalog feed into entry drafts.
///
/// Relative links (icons, downloads) are resolved against `base`, normally
/// the URL the feed was fetched from.
///
/// # Errors
///
/// Returns [`ParseError`] when the document is not well-formed XML, has no
/// `<feed>` root, or ends early. Malformed entries are not errors; they are
/// counted in [`ParseResult::skipped`].
pub fn parse_catalog(bytes: &[u8], base: &Url) -> Result<ParseResult, ParseError> {
    // quick-xml (0.37) never expands <!ENTITY> declarations; only the five XML
    // builtins are resolved by unescape(). Custom entities fail the entry.
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut scanner = Scanner::new(base);
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ParseError::Xml {
                position: reader.buffer_position(),
                message: e.to_string(),
            })?;

        match event {
            Event::Start(e) => scanner.start(&e, &reader)?,
            Event::Empty(e) => scanner.empty(&e, &reader)?,
            Event::End(_) => scanner.end(),
            Event::Text(t) => match t.unescape() {
                Ok(text) => scanner.text(&text),
                Err(_) => scanner.unreadable_text(),
            },
            Event::CData(t) => scanner.text(&String::from_utf8_lossy(&t)),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let result = scanner.finish()?;
    tracing::debug!(
        entries = result.drafts.len(),
        skipped = result.skipped,
        "Parsed catalog feed"
    );
    Ok(result)
}

// ============================================================================
// Event Scanner
// ============================================================================

/// Parser state between quick-xml events
struct Scanner<'a> {
    base: &'a Url,
    result: ParseResult,
    root_seen: bool,
    /// Number of currently open elements
    depth: usize,
    /// Entry being collected and the depth of its `<entry>` element
    entry: Option<(RawEntry, usize)>,
    /// Local name of the direct entry child whose text is being read
    text_target: Option<Vec<u8>>,
}

impl<'a> Scanner<'a> {
    fn new(base: &'a Url) -> Self {
        Self {
            base,
            result: ParseResult::default(),
            root_seen: false,
            depth: 0,
            entry: None,
            text_target: None,
        }
    }

    fn start(&mut self, e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ParseError::MaxDepthExceeded(MAX_DEPTH));
        }
        if !self.root_seen {
            return self.root(e);
        }

        let local = e.local_name();
        if self.entry.is_none() {
            if self.depth == 2 && local.as_ref() == b"entry" {
                self.entry = Some((RawEntry::default(), self.depth));
            }
            return Ok(());
        }
        let Some((raw, entry_depth)) = &mut self.entry else {
            return Ok(());
        };

        if self.depth == *entry_depth + 1 {
            if local.as_ref() == b"link" {
                raw.take_link(e, reader);
            }
            if let Some(slot) = raw.text_slot(local.as_ref()) {
                *slot = Some(String::new());
            }
            self.text_target = Some(local.as_ref().to_vec());
        }
        Ok(())
    }

    fn empty(&mut self, e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<(), ParseError> {
        if !self.root_seen {
            // `<feed/>`: a valid document without entries
            return self.root(e);
        }

        let local = e.local_name();
        if let Some((raw, entry_depth)) = &mut self.entry {
            if self.depth == *entry_depth {
                if local.as_ref() == b"link" {
                    raw.take_link(e, reader);
                } else if let Some(slot) = raw.text_slot(local.as_ref()) {
                    *slot = Some(String::new());
                }
            }
        }
        Ok(())
    }

    fn root(&mut self, e: &BytesStart<'_>) -> Result<(), ParseError> {
        let local = e.local_name();
        if local.as_ref() != b"feed" {
            return Err(ParseError::UnexpectedRoot(
                String::from_utf8_lossy(local.as_ref()).into_owned(),
            ));
        }
        self.root_seen = true;
        Ok(())
    }

    fn end(&mut self) {
        if let Some(entry_depth) = self.entry.as_ref().map(|(_, depth)| *depth) {
            if self.depth == entry_depth {
                if let Some((raw, _)) = self.entry.take() {
                    self.finish_entry(raw);
                }
                self.text_target = None;
            } else if self.depth == entry_depth + 1 {
                self.text_target = None;
            }
        }
        self.depth = self.depth.saturating_sub(1);
    }

    fn text(&mut self, text: &str) {
        let (Some((raw, _)), Some(target)) = (&mut self.entry, &self.text_target) else {
            return;
        };
        if let Some(slot) = raw.text_slot(target) {
            slot.get_or_insert_with(String::new).push_str(text);
        }
    }

    fn unreadable_text(&mut self) {
        if let (Some((raw, _)), Some(target)) = (&mut self.entry, &self.text_target) {
            raw.unreadable = Some(String::from_utf8_lossy(target).into_owned());
        }
    }

    fn finish_entry(&mut self, raw: RawEntry) {
        match raw.into_draft(self.base) {
            Ok(draft) => self.result.drafts.push(draft),
            Err(e) => {
                self.result.skipped += 1;
                tracing::debug!(error = %e, "Skipping malformed catalog entry");
            }
        }
    }

    fn finish(self) -> Result<ParseResult, ParseError> {
        if !self.root_seen {
            return Err(ParseError::MissingRoot);
        }
        if self.depth > 0 {
            return Err(ParseError::Truncated);
        }
        Ok(self.result)
    }
}

// ============================================================================
// Raw Entry
// ============================================================================

/// Text collected for one `<entry>` before validation
#[derive(Debug, Default)]
struct RawEntry {
    id: Option<String>,
    title: Option<String>,
    summary: Option<String>,
    language: Option<String>,
    name: Option<String>,
    flavour: Option<String>,
    category: Option<String>,
    tags: Option<String>,
    article_count: Option<String>,
    media_count: Option<String>,
    issued: Option<String>,
    updated: Option<String>,
    thumbnail_href: Option<String>,
    acquisition_href: Option<String>,
    acquisition_length: Option<String>,
    unreadable: Option<String>,
}

impl RawEntry {
    fn text_slot(&mut self, local: &[u8]) -> Option<&mut Option<String>> {
        match local {
            b"id" => Some(&mut self.id),
            b"title" => Some(&mut self.title),
            b"summary" => Some(&mut self.summary),
            b"language" => Some(&mut self.language),
            b"name" => Some(&mut self.name),
            b"flavour" => Some(&mut self.flavour),
            b"category" => Some(&mut self.category),
            b"tags" => Some(&mut self.tags),
            b"articleCount" => Some(&mut self.article_count),
            b"mediaCount" => Some(&mut self.media_count),
            b"issued" => Some(&mut self.issued),
            b"updated" => Some(&mut self.updated),
            _ => None,
        }
    }

    fn take_link(&mut self, e: &BytesStart<'_>, reader: &Reader<&[u8]>) {
        let mut rel = None;
        let mut href = None;
        let mut length = None;

        for attr_result in e.attributes() {
            let attr = match attr_result {
                Ok(attr) => attr,
                Err(_) => {
                    self.unreadable = Some("link".to_string());
                    return;
                }
            };
            let value = match attr.decode_and_unescape_value(reader.decoder()) {
                Ok(value) => value.into_owned(),
                Err(_) => {
                    self.unreadable = Some("link".to_string());
                    return;
                }
            };
            match attr.key.as_ref() {
                b"rel" => rel = Some(value),
                b"href" => href = Some(value),
                b"length" => length = Some(value),
                _ => {}
            }
        }

        match rel.as_deref() {
            Some(REL_THUMBNAIL) => self.thumbnail_href = href,
            Some(REL_ACQUISITION) => {
                self.acquisition_href = href;
                self.acquisition_length = length;
            }
            _ => {}
        }
    }

    fn into_draft(self, base: &Url) -> Result<CatalogEntryDraft, EntryError> {
        if let Some(element) = self.unreadable {
            return Err(EntryError::Unreadable(element));
        }

        let id = self
            .id
            .as_deref()
            .and_then(normalize_id)
            .ok_or(EntryError::MissingField("<id>"))?;
        let name = non_empty(self.title).ok_or(EntryError::MissingField("<title>"))?;
        let description = self.summary.ok_or(EntryError::MissingField("<summary>"))?;
        let language_code =
            non_empty(self.language).ok_or(EntryError::MissingField("<language>"))?;
        let category = self.category.ok_or(EntryError::MissingField("<category>"))?;
        let flavor = self.flavour.ok_or(EntryError::MissingField("<flavour>"))?;

        let article_count = parse_count(
            "<articleCount>",
            self.article_count
                .ok_or(EntryError::MissingField("<articleCount>"))?,
        )?;
        let media_count = parse_count(
            "<mediaCount>",
            self.media_count
                .ok_or(EntryError::MissingField("<mediaCount>"))?,
        )?;

        let created_raw = non_empty(self.issued)
            .or_else(|| non_empty(self.updated))
            .ok_or(EntryError::MissingField("<dc:issued>"))?;
        let created_at = DateTime::parse_from_rfc3339(created_raw.trim())
            .map_err(|_| EntryError::InvalidDate(created_raw.clone()))?
            .timestamp();

        let thumbnail = non_empty(self.thumbnail_href)
            .ok_or(EntryError::MissingField("thumbnail <link>"))?;
        let favicon_url = resolve(base, &thumbnail)?;

        let size_bytes = parse_count(
            "acquisition length",
            self.acquisition_length
                .ok_or(EntryError::MissingField("acquisition <link length>"))?,
        )?;
        let download_url = non_empty(self.acquisition_href)
            .map(|href| resolve(base, &href))
            .transpose()?;

        let flags = ContentFlags::from_tags(self.tags.as_deref().unwrap_or_default());
        let category = if category.trim().is_empty() {
            "other".to_string()
        } else {
            category
        };

        Ok(CatalogEntryDraft {
            id,
            name,
            description,
            language_code,
            category,
            flavor,
            group_id: non_empty(self.name),
            size_bytes,
            article_count,
            media_count,
            created_at,
            favicon_url: Some(favicon_url),
            download_url,
            has_details: flags.details,
            has_pictures: flags.pictures,
            has_videos: flags.videos,
            requires_service_workers: flags.service_workers,
        })
    }
}

/// Feature flags carried in the `;`-separated `<tags>` list
#[derive(Debug, Default, PartialEq, Eq)]
struct ContentFlags {
    details: bool,
    pictures: bool,
    videos: bool,
    service_workers: bool,
}

impl ContentFlags {
    fn from_tags(tags: &str) -> Self {
        let mut flags = Self::default();
        for tag in tags.split(';') {
            let Some((key, value)) = tag.trim().split_once(':') else {
                continue;
            };
            let on = value.trim().eq_ignore_ascii_case("yes");
            match key.trim() {
                "_details" => flags.details = on,
                "_pictures" => flags.pictures = on,
                "_videos" => flags.videos = on,
                "_sw" => flags.service_workers = on,
                _ => {}
            }
        }
        flags
    }
}

/// `urn:uuid:6F1D...` -> `6f1d...`
fn normalize_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let id = match trimmed.get(..9) {
        Some(prefix) if prefix.eq_ignore_ascii_case("urn:uuid:") => &trimmed[9..],
        _ => trimmed,
    };
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_lowercase())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_count(field: &'static str, value: String) -> Result<i64, EntryError> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| i64::try_from(n).ok())
        .ok_or(EntryError::InvalidNumber { field, value })
}

fn resolve(base: &Url, href: &str) -> Result<String, EntryError> {
    base.join(href.trim())
        .map(String::from)
        .map_err(|_| EntryError::InvalidUrl(href.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BASE: &str = "https://library.kiwix.org/catalog/v2/entries?count=-1";

    fn base() -> Url {
        Url::parse(BASE).unwrap()
    }

    fn entry(id: &str, title: &str) -> String {
        format!(
            r#"<entry>
    <id>urn:uuid:{id}</id>
    <title>{title}</title>
    <updated>2023-01-07T00:00:00Z</updated>
    <summary>A selection of the best 50,000 Wikipedia articles</summary>
    <language>eng</language>
    <name>wikipedia_en_top</name>
    <flavour>maxi</flavour>
    <category>wikipedia</category>
    <tags>wikipedia;_category:wikipedia;_pictures:yes;_videos:no;_details:yes;_ftindex:yes</tags>
    <articleCount>50001</articleCount>
    <mediaCount>566835</mediaCount>
    <link rel="http://opds-spec.org/image/thumbnail"
          href="/catalog/v2/illustration/1ec90eab-5724-492b-9529-893959520de4/"
          type="image/png;width=48;height=48;scale=1"/>
    <link type="text/html" href="/content/wikipedia_en_top_maxi_2023-01"/>
    <author><name>Wikipedia</name></author>
    <publisher><name>Kiwix</name></publisher>
    <dc:issued>2023-01-07T00:00:00Z</dc:issued>
    <link rel="http://opds-spec.org/acquisition/open-access" type="application/x-zim"
      href="https://download.kiwix.org/zim/wikipedia/wikipedia_en_top_maxi_2023-01.zim.meta4" length="6515656704"/>
  </entry>"#
        )
    }

    fn feed(entries: &[String]) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom"
      xmlns:dc="http://purl.org/dc/terms/"
      xmlns:opds="http://opds-spec.org/2010/catalog">
  <id>5b1c8bdb-2fa3-4e4d-9ad2-18e2b0b7dbe4</id>
  <title>All zims</title>
  <updated>2023-01-08T00:00:00Z</updated>
  {}
</feed>"#,
            entries.join("\n")
        )
    }

    #[test]
    fn test_parse_entry_fields() {
        let xml = feed(&[entry("1EC90EAB-5724-492B-9529-893959520DE4", "Best of Wikipedia")]);
        let result = parse_catalog(xml.as_bytes(), &base()).unwrap();

        assert_eq!(result.skipped, 0);
        assert_eq!(result.drafts.len(), 1);
        let draft = &result.drafts[0];
        assert_eq!(draft.id, "1ec90eab-5724-492b-9529-893959520de4");
        assert_eq!(draft.name, "Best of Wikipedia");
        assert_eq!(
            draft.description,
            "A selection of the best 50,000 Wikipedia articles"
        );
        assert_eq!(draft.language_code, "eng");
        assert_eq!(draft.category, "wikipedia");
        assert_eq!(draft.flavor, "maxi");
        assert_eq!(draft.group_id.as_deref(), Some("wikipedia_en_top"));
        assert_eq!(draft.article_count, 50001);
        assert_eq!(draft.media_count, 566835);
        assert_eq!(draft.size_bytes, 6515656704);
        assert_eq!(draft.created_at, 1673049600);
        assert_eq!(
            draft.favicon_url.as_deref(),
            Some("https://library.kiwix.org/catalog/v2/illustration/1ec90eab-5724-492b-9529-893959520de4/")
        );
        assert_eq!(
            draft.download_url.as_deref(),
            Some("https://download.kiwix.org/zim/wikipedia/wikipedia_en_top_maxi_2023-01.zim.meta4")
        );
        assert!(draft.has_details);
        assert!(draft.has_pictures);
        assert!(!draft.has_videos);
        assert!(!draft.requires_service_workers);
    }

    #[test]
    fn test_entries_keep_document_order() {
        let xml = feed(&[entry("b", "Second"), entry("a", "First")]);
        let result = parse_catalog(xml.as_bytes(), &base()).unwrap();
        let ids: Vec<&str> = result.drafts.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_malformed_entry_is_skipped_and_counted() {
        let broken = entry("c", "Broken").replace("<mediaCount>566835</mediaCount>", "<mediaCount>lots</mediaCount>");
        let missing_id = entry("d", "No id").replace("<id>urn:uuid:d</id>", "");
        let xml = feed(&[entry("a", "A"), broken, entry("b", "B"), missing_id]);

        let result = parse_catalog(xml.as_bytes(), &base()).unwrap();
        assert_eq!(result.drafts.len(), 2);
        assert_eq!(result.skipped, 2);
    }

    #[test]
    fn test_author_name_is_not_group_id() {
        let without_group = entry("a", "A").replace("<name>wikipedia_en_top</name>", "");
        let result = parse_catalog(feed(&[without_group]).as_bytes(), &base()).unwrap();
        assert_eq!(result.drafts[0].group_id, None);
    }

    #[test]
    fn test_created_falls_back_to_updated() {
        let xml = entry("a", "A").replace("<dc:issued>2023-01-07T00:00:00Z</dc:issued>", "");
        let xml = xml.replace(
            "<updated>2023-01-07T00:00:00Z</updated>",
            "<updated>2023-01-08T00:00:00Z</updated>",
        );
        let result = parse_catalog(feed(&[xml]).as_bytes(), &base()).unwrap();
        assert_eq!(result.drafts[0].created_at, 1673136000);
    }

    #[test]
    fn test_missing_acquisition_link_skips_entry() {
        let xml = entry("a", "A").replace("http://opds-spec.org/acquisition/open-access", "alternate");
        let result = parse_catalog(feed(&[xml]).as_bytes(), &base()).unwrap();
        assert_eq!(result.skipped, 1);
        assert!(result.drafts.is_empty());
    }

    #[test]
    fn test_empty_summary_is_allowed() {
        let xml = entry("a", "A").replace(
            "<summary>A selection of the best 50,000 Wikipedia articles</summary>",
            "<summary></summary>",
        );
        let result = parse_catalog(feed(&[xml]).as_bytes(), &base()).unwrap();
        assert_eq!(result.drafts[0].description, "");
    }

    #[test]
    fn test_escaped_text_is_unescaped() {
        let xml = entry("a", "Tom &amp; Jerry");
        let result = parse_catalog(feed(&[xml]).as_bytes(), &base()).unwrap();
        assert_eq!(result.drafts[0].name, "Tom & Jerry");
    }

    #[test]
    fn test_unknown_entity_skips_entry() {
        let xml = entry("a", "Bad &xxe; entity");
        let result = parse_catalog(feed(&[xml, entry("b", "B")]).as_bytes(), &base()).unwrap();
        assert_eq!(result.skipped, 1);
        assert_eq!(result.drafts.len(), 1);
    }

    #[test]
    fn test_service_worker_tag() {
        let flags = ContentFlags::from_tags("_sw:yes;_pictures:no; _videos:YES ;junk");
        assert_eq!(
            flags,
            ContentFlags {
                details: false,
                pictures: false,
                videos: true,
                service_workers: true,
            }
        );
    }

    #[test]
    fn test_empty_feed() {
        let result = parse_catalog(feed(&[]).as_bytes(), &base()).unwrap();
        assert!(result.drafts.is_empty());
        assert_eq!(result.skipped, 0);

        let result = parse_catalog(b"<feed/>", &base()).unwrap();
        assert!(result.drafts.is_empty());
    }

    #[test]
    fn test_plain_text_is_unreadable() {
        let err = parse_catalog(b"Invalid OPDS Data", &base()).unwrap_err();
        assert!(matches!(err, ParseError::MissingRoot));

        let err = parse_catalog(b"", &base()).unwrap_err();
        assert!(matches!(err, ParseError::MissingRoot));
    }

    #[test]
    fn test_wrong_root_is_unreadable() {
        let err = parse_catalog(b"<html><body>maintenance</body></html>", &base()).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedRoot(ref r) if r == "html"));
    }

    #[test]
    fn test_mismatched_tags_are_unreadable() {
        let err = parse_catalog(b"<feed><entry></feed>", &base()).unwrap_err();
        assert!(matches!(err, ParseError::Xml { .. }));
    }

    #[test]
    fn test_truncated_document_is_unreadable() {
        let xml = feed(&[entry("a", "A")]);
        let cut = &xml.as_bytes()[..xml.len() / 2];
        let err = parse_catalog(cut, &base()).unwrap_err();
        assert!(matches!(
            err,
            ParseError::Truncated | ParseError::Xml { .. }
        ));
    }

    #[test]
    fn test_excessive_nesting_rejected() {
        let xml = format!("<feed>{}", "<x>".repeat(MAX_DEPTH + 1));
        let err = parse_catalog(xml.as_bytes(), &base()).unwrap_err();
        assert!(matches!(err, ParseError::MaxDepthExceeded(_)));
    }

    #[test]
    fn test_normalize_id() {
        assert_eq!(normalize_id("urn:uuid:ABC").as_deref(), Some("abc"));
        assert_eq!(normalize_id("URN:UUID:abc").as_deref(), Some("abc"));
        assert_eq!(normalize_id("  plain-id ").as_deref(), Some("plain-id"));
        assert_eq!(normalize_id("urn:uuid:"), None);
    }
}
