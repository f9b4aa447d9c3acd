//! RFC-5988 `Link` header pagination.
//!
//! History, stats, and presence queries return pages linked by relation
//! (`first`, `next`, `previous`, `current`). Each relation is parsed into a
//! request descriptor preserving every query pair; fetching a relation
//! re-issues the HTTP request and decodes items through the codec again.

use std::collections::HashMap;

use tracing::warn;

use crate::error::Error;
use crate::rest::{PageContext, PageItem, Rest};

/// The default page size when a parsed request carries no usable `limit`.
pub const DEFAULT_PAGE_LIMIT: u32 = 100;

/// A re-issuable page request: path plus every query pair from the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub path: String,
    pub params: Vec<(String, String)>,
}

impl PageRequest {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The page size, falling back to the default when absent or unparsable.
    pub fn limit(&self) -> u32 {
        self.param("limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PAGE_LIMIT)
    }
}

/// Parse one `Link` header value (possibly several comma-joined entries) into
/// `(relation, request)` pairs. Malformed entries are skipped.
pub fn parse_link_header(value: &str) -> Vec<(String, PageRequest)> {
    let mut relations = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        let Some(target) = part
            .find('<')
            .and_then(|start| part[start..].find('>').map(|end| &part[start + 1..start + end]))
        else {
            warn!(link = part, "malformed link entry");
            continue;
        };
        let Some(rel) = part
            .split(';')
            .skip(1)
            .map(str::trim)
            .find_map(|attr| attr.strip_prefix("rel=\"").and_then(|r| r.strip_suffix('"')))
        else {
            warn!(link = part, "link entry without rel");
            continue;
        };
        relations.push((rel.to_owned(), parse_target(target)));
    }
    relations
}

/// Split a link target like `./history?limit=100&direction=forwards` into a
/// path and decoded query pairs.
fn parse_target(target: &str) -> PageRequest {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    let path = path.trim_start_matches("./").to_owned();
    let mut params = Vec::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key).map_or_else(|_| key.to_owned(), |d| d.into_owned());
        let value =
            urlencoding::decode(value).map_or_else(|_| value.to_owned(), |d| d.into_owned());
        params.push((key, value));
    }
    PageRequest { path, params }
}

/// One page of results plus descriptors for the linked pages.
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    relations: HashMap<String, PageRequest>,
    rest: Rest,
    context: PageContext,
}

impl<T: PageItem> PaginatedResult<T> {
    pub(crate) fn new(
        items: Vec<T>,
        relations: HashMap<String, PageRequest>,
        rest: Rest,
        context: PageContext,
    ) -> Self {
        PaginatedResult {
            items,
            relations,
            rest,
            context,
        }
    }

    /// The parsed request descriptor for a relation, when the broker sent one.
    pub fn relation(&self, rel: &str) -> Option<&PageRequest> {
        self.relations.get(rel)
    }

    pub fn has_next(&self) -> bool {
        self.relations.contains_key("next")
    }

    /// Fetch the `next` page; `Ok(None)` when this is the last page.
    pub async fn next(&self) -> Result<Option<PaginatedResult<T>>, Error> {
        self.fetch_relation("next").await
    }

    /// Fetch the `first` page.
    pub async fn first(&self) -> Result<Option<PaginatedResult<T>>, Error> {
        self.fetch_relation("first").await
    }

    /// Fetch the `previous` page.
    pub async fn previous(&self) -> Result<Option<PaginatedResult<T>>, Error> {
        self.fetch_relation("previous").await
    }

    /// Re-fetch the current page.
    pub async fn current(&self) -> Result<Option<PaginatedResult<T>>, Error> {
        self.fetch_relation("current").await
    }

    async fn fetch_relation(&self, rel: &str) -> Result<Option<PaginatedResult<T>>, Error> {
        let Some(request) = self.relations.get(rel) else {
            return Ok(None);
        };
        let page = self
            .rest
            .fetch_page(request.clone(), self.context.clone())
            .await?;
        Ok(Some(page))
    }
}
