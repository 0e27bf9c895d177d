//! XPath table: XPath filters merged into one shared opcode tree.

use crate::config::EngineConfig;
use crate::filter::{FilterKind, MessageFilter};
use crate::matcher::QueryMatcher;
use crate::message::Message;
use crate::table::{FilterEntries, FilterTable};
use crate::{Result, WirequeryError};

#[derive(Debug)]
pub struct XPathFilterTable<T> {
    entries: FilterEntries<T>,
    matcher: QueryMatcher,
}

impl<T> Default for XPathFilterTable<T> {
    fn default() -> Self {
        Self { entries: FilterEntries::default(), matcher: QueryMatcher::new() }
    }
}

impl<T> XPathFilterTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        Ok(Self { entries: FilterEntries::default(), matcher: QueryMatcher::with_config(config)? })
    }

    /// The shared tree engine, for inspecting the merged opcode graph.
    pub fn matcher(&self) -> &QueryMatcher {
        &self.matcher
    }
}

impl<T: Clone> FilterTable<T> for XPathFilterTable<T> {
    fn add(&mut self, filter: MessageFilter, data: T) -> Result<()> {
        let FilterKind::XPath(xpath) = filter.kind() else {
            return Err(WirequeryError::UnsupportedFilter { table: "XPathFilterTable", kind: filter.kind_name() });
        };
        self.entries.ensure_absent(&filter)?;
        self.matcher.add(filter.id(), xpath.expr())?;
        self.entries.insert(filter, data)
    }

    fn remove(&mut self, filter: &MessageFilter) -> Option<T> {
        let (filter, data) = self.entries.remove(filter)?;
        if let Err(e) = self.matcher.remove(filter.id()) {
            log::warn!("filter {} was registered without a tree entry: {}", filter.id(), e);
        }
        Some(data)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.matcher.clear();
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
        for id in self.matcher.match_ids(message)? {
            if let Some(filter) = self.entries.filter(id) {
                out.push(filter.clone());
            }
        }
        Ok(())
    }
}
