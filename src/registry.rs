//! A string-keyed hash index, parameterized by a size hint, used for each
//! entity kind's registry (§4.2). The "flexible trailing name region" of
//! the original C records becomes a plain `name` field on each stored
//! record; the registry itself does not duplicate it as a separate owned
//! key beyond the `Arc<str>` both the map key and the record's name field
//! share.

use std::collections::HashMap;
use std::sync::Arc;

/// An open hash table of name -> record, pre-sized from a size hint the
/// caller obtained out-of-band (e.g. the aggregator's `/<kind>/_info`
/// endpoint, §4.2). Lookup-or-insert returns the existing record or a
/// freshly inserted one; deletions are explicit.
///
/// Keyed by `Arc<str>` rather than `Rc<str>` so a `Registry` can sit behind
/// the `Send`-bound state the aggregator's HTTP surface needs (axum's
/// `serve` spawns a task per connection regardless of runtime flavor).
#[derive(Debug)]
pub struct Registry<T> {
    entries: HashMap<Arc<str>, T>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Registry {
            entries: HashMap::new(),
        }
    }

    /// Reserves capacity for at least `additional` more entries, from a
    /// hint obtained out-of-band after construction (e.g. a cluster's
    /// `/clus/<name>/_info` response, §4.2) — the registry itself is
    /// created before any upstream round trip can supply a hint, so sizing
    /// happens by reservation against the live table rather than at
    /// construction. `0` is a valid "no hint" no-op.
    pub fn reserve(&mut self, additional: usize) {
        self.entries.reserve(additional);
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.entries.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<T> {
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(k, v)| (k.as_ref(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_ref())
    }

    /// Returns the existing record for `name`, or inserts one built by
    /// `make` and returns that. Two lookups of the same name always yield
    /// the same record (§3 invariant: entity names are unique within their
    /// kind).
    pub fn lookup_or_insert_with(
        &mut self,
        name: &str,
        make: impl FnOnce() -> T,
    ) -> &mut T {
        if !self.entries.contains_key(name) {
            self.entries.insert(Arc::from(name), make());
        }
        self.entries.get_mut(name).expect("just inserted")
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses an `/<kind>/_info` response body's `x_nr:`/`x_nr_hint:` lines,
/// taking the larger of the two when both are present (§4.2).
pub fn parse_size_hint(body: &str) -> usize {
    let mut hint = 0usize;

    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = format!("{}:", key.trim());
        if key == "x_nr:" || key == "x_nr_hint:" {
            if let Ok(n) = value.trim().parse::<usize>() {
                hint = hint.max(n);
            }
        }
    }

    hint
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_or_insert_returns_same_record() {
        let mut reg: Registry<Vec<i32>> = Registry::new();
        reg.lookup_or_insert_with("a", Vec::new).push(1);
        reg.lookup_or_insert_with("a", Vec::new).push(2);

        assert_eq!(reg.get("a").unwrap(), &[1, 2]);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reserve_does_not_disturb_existing_entries() {
        let mut reg: Registry<Vec<i32>> = Registry::new();
        reg.lookup_or_insert_with("a", Vec::new).push(1);
        reg.reserve(64);

        assert_eq!(reg.get("a").unwrap(), &[1]);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn size_hint_takes_larger_of_the_two_keys() {
        let body = "x_nr: 10\nx_nr_hint: 25\nother: garbage\n";
        assert_eq!(parse_size_hint(body), 25);
    }

    #[test]
    fn size_hint_defaults_to_zero() {
        assert_eq!(parse_size_hint("interval: 30\n"), 0);
    }
}
