//! The state machine applied to: a plain string-to-string map, mutated
//! exclusively by applying committed `put` entries in index order.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Kv {
    map: HashMap<String, String>,
}

impl Kv {
    pub fn new() -> Self {
        Kv { map: HashMap::new() }
    }

    pub fn get(&self, key: &str) -> String {
        self.map.get(key).cloned().unwrap_or_default()
    }

    pub fn put(&mut self, key: String, value: String) {
        self.map.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_reads_as_empty_string() {
        let kv = Kv::new();
        assert_eq!(kv.get("x"), "");
    }

    #[test]
    fn put_then_get_returns_last_value() {
        let mut kv = Kv::new();
        kv.put("x".into(), "1".into());
        kv.put("x".into(), "2".into());
        assert_eq!(kv.get("x"), "2");
    }
}
