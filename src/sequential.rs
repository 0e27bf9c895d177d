//! Sequential table: evaluates every filter against every message.

use crate::filter::MessageFilter;
use crate::message::Message;
use crate::table::{FilterEntries, FilterTable};
use crate::Result;

/// Accepts any filter kind. Matching is linear in the number of filters, which makes this the
/// fallback for kinds without an index and the reference the indexed tables are checked against.
#[derive(Debug, Clone)]
pub struct SequentialFilterTable<T> {
    entries: FilterEntries<T>,
}

impl<T> Default for SequentialFilterTable<T> {
    fn default() -> Self {
        Self { entries: FilterEntries::default() }
    }
}

impl<T> SequentialFilterTable<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T: Clone> FilterTable<T> for SequentialFilterTable<T> {
    fn add(&mut self, filter: MessageFilter, data: T) -> Result<()> {
        self.entries.insert(filter, data)
    }

    fn remove(&mut self, filter: &MessageFilter) -> Option<T> {
        self.entries.remove(filter).map(|(_, data)| data)
    }

    fn clear(&mut self) {
        self.entries.clear();
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
        for (filter, _) in self.entries.iter() {
            if filter.matches(message)? {
                out.push(filter.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EnvelopeVersion;

    #[test]
    fn test_mixed_kinds() {
        let mut table = SequentialFilterTable::new();
        let action = MessageFilter::action("urn:a");
        let xpath = MessageFilter::xpath("/s12:Envelope/s12:Body/order").unwrap();
        table.add(action.clone(), 1).unwrap();
        table.add(xpath.clone(), 2).unwrap();
        table.add(MessageFilter::match_none(), 3).unwrap();

        let msg = Message::builder(EnvelopeVersion::Soap12).action("urn:a").body("<order/>").build().unwrap();
        let mut filters = Vec::new();
        assert!(table.get_matching_filters(&msg, &mut filters).unwrap());
        assert_eq!(filters, vec![action.clone(), xpath]);
        assert!(table.get_matching_filter(&msg).unwrap_err().is_ambiguity());

        let other = Message::builder(EnvelopeVersion::Soap12).action("urn:a").build().unwrap();
        assert_eq!(table.get_matching_value(&other).unwrap(), Some(1));
        assert_eq!(table.remove(&action), Some(1));
        assert!(!table.is_match(&other).unwrap());
    }
}
