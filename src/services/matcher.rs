//! Identity matching of chart entries against the library index
//!
//! Matching is exact on external ids only: TMDB first, then IMDb. Titles are
//! never compared, so a remake or a same-named film can't be mistaken for a
//! library item.

use tracing::debug;

use super::library::LibraryIndex;
use crate::types::{BoxOfficeEntry, ExternalId, MatchMethod, MatchResult};

/// Resolve one entry
pub fn match_entry(entry: &BoxOfficeEntry, index: &LibraryIndex) -> MatchResult {
    let by_primary = entry
        .ids
        .primary
        .and_then(|id| index.get(&ExternalId::Tmdb(id)))
        .map(|item| (item, MatchMethod::Primary));

    let found = by_primary.or_else(|| {
        entry
            .ids
            .secondary
            .as_ref()
            .and_then(|id| index.get(&ExternalId::Imdb(id.clone())))
            .map(|item| (item, MatchMethod::Secondary))
    });

    match found {
        Some((item, method)) => {
            debug!(rank = entry.rank, title = %entry.title, item_id = item.id, method = ?method, "Matched entry");
            MatchResult {
                rank: entry.rank,
                item: Some(item.clone()),
                method,
            }
        }
        None => MatchResult {
            rank: entry.rank,
            item: None,
            method: MatchMethod::None,
        },
    }
}

/// Resolve every entry, preserving input order
pub fn match_entries(entries: &[BoxOfficeEntry], index: &LibraryIndex) -> Vec<MatchResult> {
    entries.iter().map(|entry| match_entry(entry, index)).collect()
}
