//! Table module: the contract shared by every filter table.
//!
//! Tables map filters to caller data. Implementations only say which filters match; the single
//! and multi-result queries are provided here, so every table reports ambiguity the same way.

use crate::filter::{FilterId, MessageFilter};
use crate::message::Message;
use crate::{Result, WirequeryError};
use std::collections::BTreeMap;

pub trait FilterTable<T: Clone> {
    /// Registers `filter` with `data`. Fails if the filter is already registered or the table
    /// does not handle its kind.
    fn add(&mut self, filter: MessageFilter, data: T) -> Result<()>;

    fn remove(&mut self, filter: &MessageFilter) -> Option<T>;

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn get(&self, filter: &MessageFilter) -> Option<&T>;

    /// Registered filters in registration order.
    fn filters(&self) -> Vec<MessageFilter>;

    /// Appends every filter matching `message` to `out`.
    fn collect_matches(&self, message: &Message, out: &mut Vec<MessageFilter>) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, filter: &MessageFilter) -> bool {
        self.get(filter).is_some()
    }

    /// Whether exactly one filter matches; several matches are an error.
    fn is_match(&self, message: &Message) -> Result<bool> {
        Ok(self.get_matching_filter(message)?.is_some())
    }

    fn get_matching_filter(&self, message: &Message) -> Result<Option<MessageFilter>> {
        let mut matches = Vec::new();
        self.collect_matches(message, &mut matches)?;
        single_match(matches)
    }

    /// Appends all matching filters to `results`; returns whether any matched.
    fn get_matching_filters(&self, message: &Message, results: &mut Vec<MessageFilter>) -> Result<bool> {
        let before = results.len();
        self.collect_matches(message, results)?;
        Ok(results.len() > before)
    }

    fn get_matching_value(&self, message: &Message) -> Result<Option<T>> {
        Ok(self.get_matching_filter(message)?.and_then(|filter| self.get(&filter).cloned()))
    }

    fn get_matching_values(&self, message: &Message, results: &mut Vec<T>) -> Result<bool> {
        let mut matches = Vec::new();
        self.collect_matches(message, &mut matches)?;
        results.extend(matches.iter().filter_map(|filter| self.get(filter).cloned()));
        Ok(!matches.is_empty())
    }
}

pub(crate) fn single_match(mut matches: Vec<MessageFilter>) -> Result<Option<MessageFilter>> {
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        _ => Err(WirequeryError::MultipleFilterMatches(matches)),
    }
}

/// Filter to data storage behind the indexed tables. Ids grow monotonically, so iteration
/// follows filter creation order.
#[derive(Debug, Clone)]
pub(crate) struct FilterEntries<T> {
    entries: BTreeMap<FilterId, (MessageFilter, T)>,
}

impl<T> Default for FilterEntries<T> {
    fn default() -> Self {
        Self { entries: BTreeMap::new() }
    }
}

impl<T> FilterEntries<T> {
    pub fn insert(&mut self, filter: MessageFilter, data: T) -> Result<()> {
        let id = filter.id();
        if self.entries.contains_key(&id) {
            return Err(WirequeryError::DuplicateFilter(id));
        }
        self.entries.insert(id, (filter, data));
        Ok(())
    }

    pub fn ensure_absent(&self, filter: &MessageFilter) -> Result<()> {
        if self.entries.contains_key(&filter.id()) {
            return Err(WirequeryError::DuplicateFilter(filter.id()));
        }
        Ok(())
    }

    pub fn remove(&mut self, filter: &MessageFilter) -> Option<(MessageFilter, T)> {
        self.entries.remove(&filter.id())
    }

    pub fn get(&self, filter: &MessageFilter) -> Option<&T> {
        self.entries.get(&filter.id()).map(|(_, data)| data)
    }

    pub fn filter(&self, id: FilterId) -> Option<&MessageFilter> {
        self.entries.get(&id).map(|(filter, _)| filter)
    }

    pub fn filters(&self) -> Vec<MessageFilter> {
        self.entries.values().map(|(filter, _)| filter.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(MessageFilter, T)> + '_ {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
