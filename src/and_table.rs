//! And table: conjunction filters narrowed by an index over their first operand.

use crate::config::EngineConfig;
use crate::filter::{FilterId, FilterKind, MessageFilter};
use crate::filter_table::MessageFilterTable;
use crate::message::Message;
use crate::table::{FilterEntries, FilterTable};
use crate::{Result, WirequeryError};
use rustc_hash::FxHashMap;

/// First operands go into a nested MessageFilterTable, so they are matched through whatever
/// index suits their kind. Second operands are only evaluated for conjunctions whose first
/// operand matched.
#[derive(Debug)]
pub struct AndFilterTable<T> {
    entries: FilterEntries<T>,
    first: Box<MessageFilterTable<()>>,
    groups: FxHashMap<FilterId, Vec<MessageFilter>>,
}

impl<T> Default for AndFilterTable<T> {
    fn default() -> Self {
        Self { entries: FilterEntries::default(), first: Box::default(), groups: FxHashMap::default() }
    }
}

impl<T> AndFilterTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            entries: FilterEntries::default(),
            first: Box::new(MessageFilterTable::with_config(config.clone())?),
            groups: FxHashMap::default(),
        })
    }
}

fn operands(filter: &MessageFilter) -> Option<(&MessageFilter, &MessageFilter)> {
    match filter.kind() {
        FilterKind::And(first, second) => Some((first, second)),
        _ => None,
    }
}

impl<T: Clone> FilterTable<T> for AndFilterTable<T> {
    fn add(&mut self, filter: MessageFilter, data: T) -> Result<()> {
        let Some((first, _)) = operands(&filter) else {
            return Err(WirequeryError::UnsupportedFilter { table: "AndFilterTable", kind: filter.kind_name() });
        };
        self.entries.ensure_absent(&filter)?;
        let first = first.clone();
        if !self.groups.contains_key(&first.id()) {
            self.first.add(first.clone(), ())?;
        }
        self.entries.insert(filter.clone(), data)?;
        self.groups.entry(first.id()).or_default().push(filter);
        Ok(())
    }

    fn remove(&mut self, filter: &MessageFilter) -> Option<T> {
        let (filter, data) = self.entries.remove(filter)?;
        if let Some((first, _)) = operands(&filter) {
            if let Some(group) = self.groups.get_mut(&first.id()) {
                group.retain(|f| f != &filter);
                if group.is_empty() {
                    self.groups.remove(&first.id());
                    self.first.remove(first);
                }
            }
        }
        Some(data)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.first.clear();
        self.groups.clear();
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
        let mut firsts = Vec::new();
        self.first.collect_matches(message, &mut firsts)?;
        for first in firsts {
            for filter in self.groups.get(&first.id()).into_iter().flatten() {
                if let Some((_, second)) = operands(filter) {
                    if second.matches(message)? {
                        out.push(filter.clone());
                    }
                }
            }
        }
        Ok(())
    }
}
