//! MessageFilterTable: priority levels of kind-specific tables.
//!
//! Each filter lands in the sub-table for its kind at its priority level. Matching walks levels
//! from the highest priority down and stops at the first level with any match, so a higher
//! priority filter shadows lower ones and ambiguity is judged within one level.

use crate::action_table::ActionFilterTable;
use crate::and_table::AndFilterTable;
use crate::config::EngineConfig;
use crate::endpoint_table::{EndpointAddressFilterTable, PrefixEndpointAddressFilterTable};
use crate::filter::{FilterId, FilterKind, MessageFilter};
use crate::message::Message;
use crate::sequential::SequentialFilterTable;
use crate::table::FilterTable;
use crate::xpath_table::XPathFilterTable;
use crate::{Result, WirequeryError};
use log::debug;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Action,
    Endpoint,
    Prefix,
    XPath,
    And,
    Sequential,
}

fn route(filter: &MessageFilter) -> Route {
    match filter.kind() {
        FilterKind::Action(_) => Route::Action,
        FilterKind::EndpointAddress { .. } => Route::Endpoint,
        FilterKind::PrefixEndpointAddress { .. } => Route::Prefix,
        FilterKind::XPath(_) => Route::XPath,
        FilterKind::And(..) => Route::And,
        FilterKind::MatchAll | FilterKind::MatchNone => Route::Sequential,
    }
}

#[derive(Debug)]
enum SubTable<T> {
    Action(ActionFilterTable<T>),
    Endpoint(EndpointAddressFilterTable<T>),
    Prefix(PrefixEndpointAddressFilterTable<T>),
    XPath(XPathFilterTable<T>),
    And(AndFilterTable<T>),
    Sequential(SequentialFilterTable<T>),
}

impl<T: Clone> SubTable<T> {
    fn new(route: Route, config: &EngineConfig) -> Result<Self> {
        Ok(match route {
            Route::Action => SubTable::Action(ActionFilterTable::new()),
            Route::Endpoint => SubTable::Endpoint(EndpointAddressFilterTable::with_config(config)),
            Route::Prefix => SubTable::Prefix(PrefixEndpointAddressFilterTable::with_config(config)),
            Route::XPath => SubTable::XPath(XPathFilterTable::with_config(config.clone())?),
            Route::And => SubTable::And(AndFilterTable::with_config(config)?),
            Route::Sequential => SubTable::Sequential(SequentialFilterTable::new()),
        })
    }

    fn table(&self) -> &dyn FilterTable<T> {
        match self {
            SubTable::Action(t) => t,
            SubTable::Endpoint(t) => t,
            SubTable::Prefix(t) => t,
            SubTable::XPath(t) => t,
            SubTable::And(t) => t,
            SubTable::Sequential(t) => t,
        }
    }

    fn table_mut(&mut self) -> &mut dyn FilterTable<T> {
        match self {
            SubTable::Action(t) => t,
            SubTable::Endpoint(t) => t,
            SubTable::Prefix(t) => t,
            SubTable::XPath(t) => t,
            SubTable::And(t) => t,
            SubTable::Sequential(t) => t,
        }
    }
}

type Level<T> = Vec<(Route, SubTable<T>)>;

#[derive(Debug)]
pub struct MessageFilterTable<T> {
    levels: BTreeMap<i32, Level<T>>,
    priorities: FxHashMap<FilterId, i32>,
    config: EngineConfig,
}

impl<T> Default for MessageFilterTable<T> {
    fn default() -> Self {
        Self { levels: BTreeMap::new(), priorities: FxHashMap::default(), config: EngineConfig::default() }
    }
}

impl<T: Clone> MessageFilterTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { levels: BTreeMap::new(), priorities: FxHashMap::default(), config })
    }

    pub fn add_with_priority(&mut self, filter: MessageFilter, data: T, priority: i32) -> Result<()> {
        if self.priorities.contains_key(&filter.id()) {
            return Err(WirequeryError::DuplicateFilter(filter.id()));
        }
        let route = route(&filter);
        let level = self.levels.entry(priority).or_default();
        let index = match level.iter().position(|(r, _)| *r == route) {
            Some(index) => index,
            None => {
                level.push((route, SubTable::new(route, &self.config)?));
                level.len() - 1
            }
        };
        let id = filter.id();
        if let Err(e) = level[index].1.table_mut().add(filter, data) {
            if level[index].1.table().is_empty() {
                level.remove(index);
            }
            if level.is_empty() {
                self.levels.remove(&priority);
            }
            return Err(e);
        }
        self.priorities.insert(id, priority);
        debug!("added filter {} at priority {} ({:?})", id, priority, route);
        Ok(())
    }

    pub fn priority_of(&self, filter: &MessageFilter) -> Option<i32> {
        self.priorities.get(&filter.id()).copied()
    }

    /// Number of distinct priority levels in use.
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }
}

impl<T: Clone> FilterTable<T> for MessageFilterTable<T> {
    fn add(&mut self, filter: MessageFilter, data: T) -> Result<()> {
        self.add_with_priority(filter, data, 0)
    }

    fn remove(&mut self, filter: &MessageFilter) -> Option<T> {
        let priority = self.priorities.remove(&filter.id())?;
        let level = self.levels.get_mut(&priority)?;
        let index = level.iter().position(|(r, _)| *r == route(filter))?;
        let data = level[index].1.table_mut().remove(filter);
        if level[index].1.table().is_empty() {
            level.remove(index);
        }
        if level.is_empty() {
            self.levels.remove(&priority);
        }
        data
    }

    fn clear(&mut self) {
        self.levels.clear();
        self.priorities.clear();
    }

    fn len(&self) -> usize {
        self.priorities.len()
    }

    fn get(&self, filter: &MessageFilter) -> Option<&T> {
        let priority = self.priorities.get(&filter.id())?;
        self.levels.get(priority)?.iter().find_map(|(_, table)| table.table().get(filter))
    }

    fn filters(&self) -> Vec<MessageFilter> {
        let mut filters: Vec<MessageFilter> = self
            .levels
            .values()
            .flat_map(|level| level.iter().flat_map(|(_, table)| table.table().filters()))
            .collect();
        filters.sort_by_key(MessageFilter::id);
        filters
    }

    fn collect_matches(&self, message: &Message, out: &mut Vec<MessageFilter>) -> Result<()> {
        for level in self.levels.values().rev() {
            let before = out.len();
            for (_, table) in level {
                table.table().collect_matches(message, out)?;
            }
            if out.len() > before {
                break;
            }
        }
        Ok(())
    }
}
