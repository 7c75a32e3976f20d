//! Online identities on the room channel.

use std::collections::BTreeSet;

/// The set of identities currently present on the room channel.
///
/// Holds `snapshot ∪ joins − leaves` since the last seed. Every new room
/// subscription reseeds it, so nothing leaks across reconnects.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PresenceTracker {
    online: BTreeSet<String>,
}

impl PresenceTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole set with a fresh snapshot.
    pub fn seed(&mut self, identities: impl IntoIterator<Item = String>) {
        self.online = identities.into_iter().collect();
    }

    /// Adds `identity`. Returns `true` if it was not already present.
    pub fn join(&mut self, identity: &str) -> bool {
        self.online.insert(identity.to_string())
    }

    /// Removes `identity`. Returns `true` if it was present.
    pub fn leave(&mut self, identity: &str) -> bool {
        self.online.remove(identity)
    }

    /// Whether `identity` is online.
    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.online.contains(identity)
    }

    /// Number of online identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.online.len()
    }

    /// Whether nobody is online.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }

    /// The online identities, sorted.
    #[must_use]
    pub const fn members(&self) -> &BTreeSet<String> {
        &self.online
    }

    /// Empties the set.
    pub fn clear(&mut self) {
        self.online.clear();
    }
}
