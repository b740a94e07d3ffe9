//! Type-indexed handler tables shared by every dispatching component.
//!
//! Aggregates, processors, projections, and the buses each build a
//! [`HandlerMap`] once at registration time and never mutate it afterwards.
//! Resolution is O(1) on the message's `TypeId`: exact match first, then an
//! optional fallback handler (the open-ended base registration). Whether a
//! miss is an error is the caller's policy: the command and query buses are
//! strict, event routing is permissive.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Boxed future used throughout the handler tables.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An immutable-after-build table of handlers keyed by message `TypeId`.
///
/// Duplicate insertions are recorded rather than rejected so that
/// `configure` hooks stay infallible; the application builder surfaces the
/// recorded duplicates as build errors.
pub struct HandlerMap<H> {
    exact: HashMap<TypeId, Registered<H>>,
    fallback: Option<H>,
    duplicates: Vec<String>,
}

struct Registered<H> {
    name: &'static str,
    handler: H,
}

impl<H> Default for HandlerMap<H> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            fallback: None,
            duplicates: Vec::new(),
        }
    }
}

impl<H> HandlerMap<H> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an exact message type.
    ///
    /// A second registration for the same type keeps the first handler and
    /// records the duplicate for build-time validation.
    pub fn insert(&mut self, type_id: TypeId, name: &'static str, handler: H) {
        if self.exact.contains_key(&type_id) {
            self.duplicates.push(name.to_owned());
            return;
        }
        self.exact.insert(type_id, Registered { name, handler });
    }

    /// Register the fallback handler invoked when no exact type matches.
    ///
    /// This is the open-ended base registration: a middleware intercepting
    /// every command, or a processor with a catch-all event handler.
    pub fn set_fallback(&mut self, handler: H) {
        if self.fallback.is_some() {
            self.duplicates.push("<fallback>".to_owned());
            return;
        }
        self.fallback = Some(handler);
    }

    /// Resolve a handler for a message type: exact match, then fallback.
    pub fn resolve(&self, type_id: TypeId) -> Option<&H> {
        self.exact
            .get(&type_id)
            .map(|r| &r.handler)
            .or(self.fallback.as_ref())
    }

    /// Resolve strictly by exact type, ignoring the fallback.
    pub fn resolve_exact(&self, type_id: TypeId) -> Option<&H> {
        self.exact.get(&type_id).map(|r| &r.handler)
    }

    /// The registered name for a type, if any.
    pub fn name_of(&self, type_id: TypeId) -> Option<&'static str> {
        self.exact.get(&type_id).map(|r| r.name)
    }

    /// All registered `(TypeId, name)` pairs, exact registrations only.
    pub fn registered(&self) -> impl Iterator<Item = (TypeId, &'static str)> + '_ {
        self.exact.iter().map(|(id, r)| (*id, r.name))
    }

    /// Message names that were registered more than once.
    pub fn duplicates(&self) -> &[String] {
        &self.duplicates
    }

    /// Number of exact registrations.
    pub fn len(&self) -> usize {
        self.exact.len()
    }

    /// Whether the table has no exact registrations.
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }
}

impl<H> fmt::Debug for HandlerMap<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.exact.values().map(|r| r.name).collect();
        names.sort_unstable();
        f.debug_struct("HandlerMap")
            .field("registered", &names)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct A;
    struct B;
    struct C;

    #[test]
    fn exact_match_wins_over_fallback() {
        let mut map = HandlerMap::new();
        map.insert(TypeId::of::<A>(), "A", "exact");
        map.set_fallback("fallback");

        assert_eq!(map.resolve(TypeId::of::<A>()), Some(&"exact"));
        assert_eq!(map.resolve(TypeId::of::<B>()), Some(&"fallback"));
    }

    #[test]
    fn miss_without_fallback_is_none() {
        let mut map = HandlerMap::new();
        map.insert(TypeId::of::<A>(), "A", 1u8);
        assert_eq!(map.resolve(TypeId::of::<C>()), None);
    }

    #[test]
    fn resolve_exact_ignores_fallback() {
        let mut map = HandlerMap::new();
        map.set_fallback("fallback");
        assert_eq!(map.resolve_exact(TypeId::of::<A>()), None);
    }

    #[test]
    fn duplicate_registration_keeps_first_and_records() {
        let mut map = HandlerMap::new();
        map.insert(TypeId::of::<A>(), "A", "first");
        map.insert(TypeId::of::<A>(), "A", "second");

        assert_eq!(map.resolve(TypeId::of::<A>()), Some(&"first"));
        assert_eq!(map.duplicates(), &["A".to_owned()]);
    }

    #[test]
    fn duplicate_fallback_is_recorded() {
        let mut map = HandlerMap::new();
        map.set_fallback(1u8);
        map.set_fallback(2u8);
        assert_eq!(map.resolve(TypeId::of::<A>()), Some(&1));
        assert_eq!(map.duplicates(), &["<fallback>".to_owned()]);
    }

    #[test]
    fn registered_lists_names() {
        let mut map = HandlerMap::new();
        map.insert(TypeId::of::<A>(), "A", ());
        map.insert(TypeId::of::<B>(), "B", ());
        let mut names: Vec<_> = map.registered().map(|(_, n)| n).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(map.len(), 2);
        assert!(!map.is_empty());
    }
}
