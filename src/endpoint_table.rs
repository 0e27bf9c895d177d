//! Endpoint address tables: filters indexed by destination URI and required headers.
//!
//! Each distinct required header (by canonical form) owns one bit. A candidate keeps the mask of
//! the headers it requires; a message yields the mask of the known headers it carries, and a
//! candidate matches when its mask is a subset of the message mask. Message masks are built in
//! pooled scratch buffers.

use crate::config::EngineConfig;
use crate::filter::{message_to, prefix_keys, uri_key, EndpointAddress, FilterKind, MessageFilter};
use crate::message::Message;
use crate::pool::ObjectPool;
use crate::table::{FilterEntries, FilterTable};
use crate::{Result, WirequeryError};
use log::debug;
use rustc_hash::FxHashMap;

type HeaderMask = Vec<u64>;

fn set_bit(mask: &mut HeaderMask, bit: usize) {
    let word = bit / 64;
    if mask.len() <= word {
        mask.resize(word + 1, 0);
    }
    mask[word] |= 1 << (bit % 64);
}

fn is_subset(required: &HeaderMask, present: &HeaderMask) -> bool {
    required
        .iter()
        .enumerate()
        .all(|(i, word)| word & !present.get(i).copied().unwrap_or(0) == 0)
}

#[derive(Debug, Clone)]
struct Candidate {
    filter: MessageFilter,
    mask: HeaderMask,
}

/// URI buckets plus header bit allocation, shared by the exact and prefix tables.
#[derive(Debug)]
struct AddressIndex {
    with_host: FxHashMap<String, Vec<Candidate>>,
    without_host: FxHashMap<String, Vec<Candidate>>,
    header_bits: FxHashMap<String, usize>,
    bit_refs: Vec<usize>,
    free_bits: Vec<usize>,
    processors: ObjectPool<HeaderMask>,
}

impl AddressIndex {
    fn new(config: &EngineConfig) -> Self {
        Self {
            with_host: FxHashMap::default(),
            without_host: FxHashMap::default(),
            header_bits: FxHashMap::default(),
            bit_refs: Vec::new(),
            free_bits: Vec::new(),
            processors: ObjectPool::new(config.processor_pool_capacity, Vec::new),
        }
    }

    fn bucket_map(&mut self, include_host: bool) -> &mut FxHashMap<String, Vec<Candidate>> {
        if include_host {
            &mut self.with_host
        } else {
            &mut self.without_host
        }
    }

    fn acquire_bit(&mut self, canonical: &str) -> usize {
        if let Some(&bit) = self.header_bits.get(canonical) {
            self.bit_refs[bit] += 1;
            return bit;
        }
        let bit = match self.free_bits.pop() {
            Some(bit) => {
                self.bit_refs[bit] = 1;
                bit
            }
            None => {
                self.bit_refs.push(1);
                self.bit_refs.len() - 1
            }
        };
        self.header_bits.insert(canonical.to_string(), bit);
        bit
    }

    fn release_bit(&mut self, canonical: &str) {
        let Some(&bit) = self.header_bits.get(canonical) else {
            return;
        };
        self.bit_refs[bit] -= 1;
        if self.bit_refs[bit] == 0 {
            self.header_bits.remove(canonical);
            self.free_bits.push(bit);
        }
    }

    fn insert(&mut self, filter: MessageFilter, address: &EndpointAddress, include_host: bool) {
        let mut mask = HeaderMask::new();
        for header in address.headers() {
            let bit = self.acquire_bit(header.canonical());
            set_bit(&mut mask, bit);
        }
        let key = address.uri_key(include_host);
        debug!("indexed endpoint filter {} under {}", filter.id(), key);
        self.bucket_map(include_host).entry(key).or_default().push(Candidate { filter, mask });
    }

    fn remove(&mut self, filter: &MessageFilter, address: &EndpointAddress, include_host: bool) {
        let key = address.uri_key(include_host);
        let buckets = self.bucket_map(include_host);
        if let Some(bucket) = buckets.get_mut(&key) {
            bucket.retain(|c| &c.filter != filter);
            if bucket.is_empty() {
                buckets.remove(&key);
            }
        }
        for header in address.headers() {
            self.release_bit(header.canonical());
        }
    }

    fn clear(&mut self) {
        self.with_host.clear();
        self.without_host.clear();
        self.header_bits.clear();
        self.bit_refs.clear();
        self.free_bits.clear();
    }

    /// Bits of the known headers present in the message.
    fn message_mask(&self, message: &Message, mask: &mut HeaderMask) {
        mask.clear();
        if self.header_bits.is_empty() {
            return;
        }
        let doc = message.document();
        for &header in message.headers() {
            if let Some(&bit) = self.header_bits.get(&doc.canonical_form(header)) {
                set_bit(mask, bit);
            }
        }
    }

    fn collect_level(&self, hosted: &str, hostless: &str, mask: &HeaderMask, out: &mut Vec<MessageFilter>) -> bool {
        let before = out.len();
        for (buckets, key) in [(&self.with_host, hosted), (&self.without_host, hostless)] {
            if let Some(bucket) = buckets.get(key) {
                out.extend(bucket.iter().filter(|c| is_subset(&c.mask, mask)).map(|c| c.filter.clone()));
            }
        }
        out.len() > before
    }

    fn collect_exact(&self, message: &Message, out: &mut Vec<MessageFilter>) {
        let Some(to) = message_to(message) else {
            return;
        };
        let mut mask = self.processors.checkout();
        self.message_mask(message, &mut mask);
        self.collect_level(&uri_key(&to, true), &uri_key(&to, false), &mask, out);
    }

    /// Walks from the longest path prefix to the shortest and stops at the first level with a
    /// candidate whose headers are present.
    fn collect_prefix(&self, message: &Message, out: &mut Vec<MessageFilter>) {
        let Some(to) = message_to(message) else {
            return;
        };
        let mut mask = self.processors.checkout();
        self.message_mask(message, &mut mask);
        let hosted = prefix_keys(&to, true);
        let hostless = prefix_keys(&to, false);
        for (with_host, without_host) in hosted.iter().zip(hostless.iter()) {
            if self.collect_level(with_host, without_host, &mask, out) {
                return;
            }
        }
    }
}

fn address_of(filter: &MessageFilter, prefix: bool, table: &'static str) -> Result<(EndpointAddress, bool)> {
    match (filter.kind(), prefix) {
        (FilterKind::EndpointAddress { address, include_host }, false)
        | (FilterKind::PrefixEndpointAddress { address, include_host }, true) => Ok((address.clone(), *include_host)),
        _ => Err(WirequeryError::UnsupportedFilter { table, kind: filter.kind_name() }),
    }
}

macro_rules! address_table {
    ($(#[$meta:meta])* $name:ident, $prefix:expr, $collect:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name<T> {
            entries: FilterEntries<T>,
            index: AddressIndex,
        }

        impl<T> Default for $name<T> {
            fn default() -> Self {
                Self::with_config(&EngineConfig::default())
            }
        }

        impl<T> $name<T> {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn with_config(config: &EngineConfig) -> Self {
                Self { entries: FilterEntries::default(), index: AddressIndex::new(config) }
            }

            /// Distinct required headers currently holding a bit.
            pub fn header_count(&self) -> usize {
                self.index.header_bits.len()
            }
        }

        impl<T: Clone> FilterTable<T> for $name<T> {
            fn add(&mut self, filter: MessageFilter, data: T) -> Result<()> {
                let (address, include_host) = address_of(&filter, $prefix, stringify!($name))?;
                self.entries.insert(filter.clone(), data)?;
                self.index.insert(filter, &address, include_host);
                Ok(())
            }

            fn remove(&mut self, filter: &MessageFilter) -> Option<T> {
                let (filter, data) = self.entries.remove(filter)?;
                if let Ok((address, include_host)) = address_of(&filter, $prefix, stringify!($name)) {
                    self.index.remove(&filter, &address, include_host);
                }
                Some(data)
            }

            fn clear(&mut self) {
                self.entries.clear();
                self.index.clear();
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
                if !self.entries.is_empty() {
                    self.index.$collect(message, out);
                }
                Ok(())
            }
        }
    };
}

address_table!(
    /// Filters whose address URI equals the message's `To` URI.
    EndpointAddressFilterTable,
    false,
    collect_exact
);

address_table!(
    /// Filters whose address URI is a segment prefix of the message's `To` URI. Only the longest
    /// matching prefix level contributes matches.
    PrefixEndpointAddressFilterTable,
    true,
    collect_prefix
);
