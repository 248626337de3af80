//! Process-global numeric counters, one named set per log.
//!
//! Each set carries the fixed storage fields plus any extras the
//! embedding application registers. Cells are independent atomics;
//! there is no cross-field consistency and none is needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

pub const OFFSET: &str = "offset";
pub const FIRST_OFFSET: &str = "first_offset";
pub const FIRST_TIMESTAMP: &str = "first_timestamp";
pub const CHUNKS: &str = "chunks";
pub const SEGMENTS: &str = "segments";

const FIXED_FIELDS: &[&str] = &[OFFSET, FIRST_OFFSET, FIRST_TIMESTAMP, CHUNKS, SEGMENTS];

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<String, Arc<CounterSet>>> = Mutex::new(HashMap::new());
}

#[derive(Debug)]
pub struct CounterSet {
    fields: HashMap<String, AtomicI64>,
}

impl CounterSet {
    pub fn put(&self, field: &str, value: i64) {
        if let Some(cell) = self.fields.get(field) {
            cell.store(value, Ordering::Release);
        }
    }

    pub fn add(&self, field: &str, value: i64) {
        if let Some(cell) = self.fields.get(field) {
            cell.fetch_add(value, Ordering::AcqRel);
        }
    }

    pub fn get(&self, field: &str) -> i64 {
        self.fields
            .get(field)
            .map(|cell| cell.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// Register (or look up) the counter set for `name` with the fixed
/// storage fields plus `extra_fields`.
pub fn new(name: &str, extra_fields: &[String]) -> Arc<CounterSet> {
    let mut registry = REGISTRY.lock().unwrap();
    if let Some(existing) = registry.get(name) {
        return Arc::clone(existing);
    }
    let mut fields = HashMap::new();
    for field in FIXED_FIELDS {
        fields.insert((*field).to_string(), AtomicI64::new(0));
    }
    for field in extra_fields {
        fields.insert(field.clone(), AtomicI64::new(0));
    }
    let set = Arc::new(CounterSet { fields });
    registry.insert(name.to_string(), Arc::clone(&set));
    set
}

/// Drop the registration for `name`. The set stays alive for existing
/// holders of the `Arc`.
pub fn remove(name: &str) {
    REGISTRY.lock().unwrap().remove(name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_put_add_get() {
        let counters = new("counters-test", &["custom".to_string()]);
        counters.put(OFFSET, 41);
        counters.add(OFFSET, 1);
        counters.add("custom", 5);
        assert_eq!(counters.get(OFFSET), 42);
        assert_eq!(counters.get("custom"), 5);
        assert_eq!(counters.get("unknown"), 0);

        // re-registration returns the same set
        let again = new("counters-test", &[]);
        assert_eq!(again.get(OFFSET), 42);
        remove("counters-test");
    }
}
