// =============================================================================
// Symbol Cache: injectable per-symbol map with single-writer-per-key use
// =============================================================================
//
// A manager owns an `Arc<SymbolCache>` and only the task serving a symbol
// writes that symbol's entry; readers take cheap clones.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

/// Thread-safe map keyed by exchange symbol.
pub struct SymbolCache<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V: Clone> SymbolCache<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<V> {
        self.entries.read().get(symbol).cloned()
    }

    pub fn insert(&self, symbol: &str, value: V) {
        self.entries.write().insert(symbol.to_string(), value);
    }

    /// Drop the entry for `symbol`, e.g. on explicit invalidation or when its
    /// subscription is torn down.
    pub fn invalidate(&self, symbol: &str) -> Option<V> {
        self.entries.write().remove(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entries.read().contains_key(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<V: Clone> Default for SymbolCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_invalidate() {
        let cache: SymbolCache<u32> = SymbolCache::new();
        assert!(cache.is_empty());

        cache.insert("BTCUSDT", 2);
        cache.insert("ETHUSDT", 4);
        assert_eq!(cache.get("BTCUSDT"), Some(2));
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.invalidate("BTCUSDT"), Some(2));
        assert!(!cache.contains("BTCUSDT"));
        assert_eq!(cache.symbols(), vec!["ETHUSDT".to_string()]);
    }
}
