//! Thread-safe wrapper: one lock around every table operation.

use crate::filter::MessageFilter;
use crate::filter_table::MessageFilterTable;
use crate::message::Message;
use crate::table::FilterTable;
use crate::Result;
use parking_lot::Mutex;
use std::marker::PhantomData;

/// Serializes mutation and matching of the wrapped table. The tables themselves carry no
/// internal synchronization.
pub struct ThreadSafeFilterTable<T, Tbl = MessageFilterTable<T>> {
    table: Mutex<Tbl>,
    _data: PhantomData<fn() -> T>,
}

impl<T, Tbl: Default> Default for ThreadSafeFilterTable<T, Tbl> {
    fn default() -> Self {
        Self::new(Tbl::default())
    }
}

impl<T, Tbl> ThreadSafeFilterTable<T, Tbl> {
    pub fn new(table: Tbl) -> Self {
        Self { table: Mutex::new(table), _data: PhantomData }
    }

    pub fn into_inner(self) -> Tbl {
        self.table.into_inner()
    }

    /// Runs `f` with the table locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut Tbl) -> R) -> R {
        f(&mut self.table.lock())
    }
}

impl<T: Clone, Tbl: FilterTable<T>> ThreadSafeFilterTable<T, Tbl> {
    pub fn add(&self, filter: MessageFilter, data: T) -> Result<()> {
        self.table.lock().add(filter, data)
    }

    pub fn remove(&self, filter: &MessageFilter) -> Option<T> {
        self.table.lock().remove(filter)
    }

    pub fn clear(&self) {
        self.table.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    pub fn contains(&self, filter: &MessageFilter) -> bool {
        self.table.lock().contains(filter)
    }

    pub fn get(&self, filter: &MessageFilter) -> Option<T> {
        self.table.lock().get(filter).cloned()
    }

    pub fn filters(&self) -> Vec<MessageFilter> {
        self.table.lock().filters()
    }

    pub fn is_match(&self, message: &Message) -> Result<bool> {
        self.table.lock().is_match(message)
    }

    pub fn get_matching_filter(&self, message: &Message) -> Result<Option<MessageFilter>> {
        self.table.lock().get_matching_filter(message)
    }

    pub fn get_matching_filters(&self, message: &Message, results: &mut Vec<MessageFilter>) -> Result<bool> {
        self.table.lock().get_matching_filters(message, results)
    }

    pub fn get_matching_value(&self, message: &Message) -> Result<Option<T>> {
        self.table.lock().get_matching_value(message)
    }

    pub fn get_matching_values(&self, message: &Message, results: &mut Vec<T>) -> Result<bool> {
        self.table.lock().get_matching_values(message, results)
    }
}

impl<T, Tbl: std::fmt::Debug> std::fmt::Debug for ThreadSafeFilterTable<T, Tbl> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSafeFilterTable").field("table", &self.table).finish()
    }
}
