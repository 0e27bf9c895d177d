//! Action table: filters bucketed by message action.

use crate::filter::{FilterKind, MessageFilter};
use crate::message::Message;
use crate::table::{FilterEntries, FilterTable};
use crate::{Result, WirequeryError};
use log::debug;
use rustc_hash::FxHashMap;

/// Indexes action filters by action string; action-agnostic filters live in a separate list
/// that applies to every message.
#[derive(Debug, Clone)]
pub struct ActionFilterTable<T> {
    entries: FilterEntries<T>,
    by_action: FxHashMap<String, Vec<MessageFilter>>,
    always: Vec<MessageFilter>,
}

impl<T> Default for ActionFilterTable<T> {
    fn default() -> Self {
        Self { entries: FilterEntries::default(), by_action: FxHashMap::default(), always: Vec::new() }
    }
}

impl<T> ActionFilterTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct actions indexed.
    pub fn action_count(&self) -> usize {
        self.by_action.len()
    }
}

impl<T: Clone> FilterTable<T> for ActionFilterTable<T> {
    fn add(&mut self, filter: MessageFilter, data: T) -> Result<()> {
        let actions = match filter.kind() {
            FilterKind::Action(actions) => actions.clone(),
            _ => return Err(WirequeryError::UnsupportedFilter { table: "ActionFilterTable", kind: filter.kind_name() }),
        };
        self.entries.insert(filter.clone(), data)?;
        if actions.is_empty() {
            self.always.push(filter);
        } else {
            for action in actions {
                self.by_action.entry(action).or_default().push(filter.clone());
            }
        }
        Ok(())
    }

    fn remove(&mut self, filter: &MessageFilter) -> Option<T> {
        let (filter, data) = self.entries.remove(filter)?;
        self.always.retain(|f| f != &filter);
        self.by_action.retain(|_, bucket| {
            bucket.retain(|f| f != &filter);
            !bucket.is_empty()
        });
        debug!("removed action filter {}", filter.id());
        Some(data)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.by_action.clear();
        self.always.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, filter: &MessageFilter) -> Option<&T> {
        self.entries.get(filter)
    }

    fn filters(&self) -> Vec<MessageFilter> {
        self.entries.filters()
    }

    fn collect_matches(&self, message: &Message, out: &mut Vec<MessageFilter>) -> Result<()> {
        if let Some(bucket) = message.action().and_then(|action| self.by_action.get(action)) {
            out.extend(bucket.iter().cloned());
        }
        out.extend(self.always.iter().cloned());
        Ok(())
    }
}
