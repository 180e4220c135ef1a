//! What to write when the wanted filters for a (subscription, relay) pair change.

use nostr::Filter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterChange {
    /// Open or replace the subscription with these filters.
    Open(Vec<Filter>),
    /// The relay no longer takes part in the subscription.
    Close,
    Unchanged,
}

/// Compare the filters last sent to a relay with the ones now wanted.
pub fn diff(sent: Option<&[Filter]>, wanted: Option<&[Filter]>) -> FilterChange {
    let sent = sent.filter(|filters| !filters.is_empty());
    let wanted = wanted.filter(|filters| !filters.is_empty());

    match (sent, wanted) {
        (Some(_), None) => FilterChange::Close,
        (None, None) => FilterChange::Unchanged,
        (None, Some(wanted)) => FilterChange::Open(wanted.to_vec()),
        (Some(sent), Some(wanted)) if sent != wanted => FilterChange::Open(wanted.to_vec()),
        (Some(_), Some(_)) => FilterChange::Unchanged,
    }
}
