// ABOUTME: Process-wide interned symbol cache with pointer-equality symbols

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// A 32-bit FNV-1a hash, used for symbols and for structural value hashing.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[derive(Debug)]
struct SymbolData {
    name: Box<str>,
    hash: u32,
}

/// An interned, immutable identifier. Two symbols with the same name are the
/// same allocation, so equality is a pointer comparison and the hash is
/// computed once at intern time.
#[derive(Debug, Clone)]
pub struct Symbol(Arc<SymbolData>);

impl Symbol {
    /// Intern a name in the process-wide cache.
    pub fn intern(name: &str) -> Symbol {
        cache().lock().expect("symbol cache poisoned").intern(name)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn hash32(&self) -> u32 {
        self.0.hash
    }

    /// Identity check without going through `Eq`.
    pub fn same(&self, other: &Symbol) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Interning makes the byte hash consistent with pointer equality.
        state.write_u32(self.0.hash);
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

// ============================================================================
// Cache
// ============================================================================
//
// Open-addressed table with tombstones. Entries hold weak references so a
// symbol with no remaining users frees itself; its slot turns into a
// tombstone the next time a probe walks over it.

enum Entry {
    Empty,
    Deleted,
    Live(Weak<SymbolData>),
}

struct Cache {
    entries: Vec<Entry>,
    count: usize,
    deleted: usize,
}

const INITIAL_CAPACITY: usize = 128;

fn cache() -> &'static Mutex<Cache> {
    static CACHE: OnceLock<Mutex<Cache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(Cache::with_capacity(INITIAL_CAPACITY)))
}

impl Cache {
    fn with_capacity(capacity: usize) -> Cache {
        debug_assert!(capacity.is_power_of_two());
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || Entry::Empty);
        Cache {
            entries,
            count: 0,
            deleted: 0,
        }
    }

    fn intern(&mut self, name: &str) -> Symbol {
        let hash = hash_bytes(name.as_bytes());
        if let Some(sym) = self.find(name, hash) {
            return sym;
        }
        if 2 * (self.count + self.deleted) >= self.entries.len() {
            self.resize(self.entries.len() * 2);
        }
        let data = Arc::new(SymbolData {
            name: name.into(),
            hash,
        });
        let at = self
            .insertion_slot(hash)
            .expect("symbol cache invariant: a free slot always exists");
        if matches!(self.entries[at], Entry::Deleted) {
            self.deleted -= 1;
        }
        self.entries[at] = Entry::Live(Arc::downgrade(&data));
        self.count += 1;
        Symbol(data)
    }

    /// Probe the two ranges [index, cap) and [0, index), upgrading live hits
    /// and turning dropped entries into tombstones along the way.
    fn find(&mut self, name: &str, hash: u32) -> Option<Symbol> {
        let cap = self.entries.len();
        let index = hash as usize & (cap - 1);
        for i in (index..cap).chain(0..index) {
            match &self.entries[i] {
                Entry::Empty => return None,
                Entry::Deleted => continue,
                Entry::Live(weak) => match weak.upgrade() {
                    Some(data) => {
                        if data.hash == hash && &*data.name == name {
                            return Some(Symbol(data));
                        }
                    }
                    None => {
                        self.entries[i] = Entry::Deleted;
                        self.count -= 1;
                        self.deleted += 1;
                    }
                },
            }
        }
        None
    }

    /// First reusable slot (tombstone or empty) for a fresh symbol.
    fn insertion_slot(&self, hash: u32) -> Option<usize> {
        let cap = self.entries.len();
        let index = hash as usize & (cap - 1);
        (index..cap)
            .chain(0..index)
            .find(|&i| !matches!(self.entries[i], Entry::Live(_)))
    }

    fn resize(&mut self, capacity: usize) {
        let old = std::mem::replace(self, Cache::with_capacity(capacity));
        for entry in old.entries {
            if let Entry::Live(weak) = entry {
                if let Some(data) = weak.upgrade() {
                    let at = self
                        .insertion_slot(data.hash)
                        .expect("resized symbol cache has free slots");
                    self.entries[at] = Entry::Live(Arc::downgrade(&data));
                    self.count += 1;
                }
            }
        }
    }

    fn live_count(&mut self) -> usize {
        let mut n = 0;
        for i in 0..self.entries.len() {
            if let Entry::Live(weak) = &self.entries[i] {
                if weak.strong_count() > 0 {
                    n += 1;
                } else {
                    self.entries[i] = Entry::Deleted;
                    self.count -= 1;
                    self.deleted += 1;
                }
            }
        }
        n
    }
}

/// Number of live symbols in the cache. Exposed for tests and diagnostics.
pub fn cache_live_count() -> usize {
    cache().lock().expect("symbol cache poisoned").live_count()
}
