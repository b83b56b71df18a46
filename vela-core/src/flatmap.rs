//! Flatmap - Flat string encoding of nested attributes
//!
//! Recorded states persist attributes as a flat string map: lists become
//! `name.#` counts with `name.<index>.<field>` entries, nested maps use
//! dotted paths. State migrations operate directly on this encoding.

use std::collections::BTreeMap;

/// Flat attribute map as persisted in recorded state
pub type FlatMap = BTreeMap<String, String>;

/// Read the `name.#` count entry, if present and numeric
pub fn list_len(attrs: &FlatMap, name: &str) -> Option<usize> {
    attrs.get(&format!("{}.#", name))?.parse().ok()
}

/// Write the `name.#` count entry
pub fn set_list_len(attrs: &mut FlatMap, name: &str, len: usize) {
    attrs.insert(format!("{}.#", name), len.to_string());
}

/// Remove and return every entry whose key starts with `prefix`
///
/// Entries come back in key order. `prefix` should include the trailing
/// dot when stripping a block (e.g. `"disk."`), which also captures the
/// `disk.#` count entry.
pub fn take_prefixed(attrs: &mut FlatMap, prefix: &str) -> Vec<(String, String)> {
    let keys: Vec<String> = attrs
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect();

    keys.into_iter()
        .filter_map(|k| attrs.remove(&k).map(|v| (k, v)))
        .collect()
}

/// Value of a flat entry, "" when absent
pub fn get<'a>(attrs: &'a FlatMap, key: &str) -> &'a str {
    attrs.get(key).map(String::as_str).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FlatMap {
        let mut attrs = FlatMap::new();
        attrs.insert("disk.#".to_string(), "2".to_string());
        attrs.insert("disk.0.size".to_string(), "100".to_string());
        attrs.insert("disk.1.size".to_string(), "200".to_string());
        attrs.insert("name".to_string(), "vm-1".to_string());
        attrs
    }

    #[test]
    fn list_len_parses_count_entry() {
        let attrs = sample();
        assert_eq!(list_len(&attrs, "disk"), Some(2));
        assert_eq!(list_len(&attrs, "tags"), None);
    }

    #[test]
    fn take_prefixed_removes_block_entries() {
        let mut attrs = sample();
        let taken = take_prefixed(&mut attrs, "disk.");

        assert_eq!(taken.len(), 3);
        assert_eq!(taken[0].0, "disk.#");
        assert!(attrs.keys().all(|k| !k.starts_with("disk.")));
        assert_eq!(get(&attrs, "name"), "vm-1");
    }

    #[test]
    fn get_defaults_to_empty() {
        let attrs = sample();
        assert_eq!(get(&attrs, "zone"), "");
        assert_eq!(get(&attrs, "disk.0.size"), "100");
    }
}
