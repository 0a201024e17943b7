//! Staleness protection for visual ids
//!
//! Tokens version a visual id across unregister cycles so queued work can be
//! checked against the current version. Tombstones keep a just-removed id
//! inert for a short window so late physics publishes cannot revive it.

use rustc_hash::FxHashMap;

use super::{Tick, VisualId};

/// Version stamp carried by queued packets and tasks
pub type Token = u64;

/// Per-visual version counter
#[derive(Debug, Default)]
pub struct VisualTokenService {
    tokens: FxHashMap<VisualId, Token>,
}

impl VisualTokenService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version; ids never unregistered are at 0
    #[inline]
    pub fn current(&self, id: VisualId) -> Token {
        self.tokens.get(&id).copied().unwrap_or(0)
    }

    /// Advance the version of `id` and return the new value
    pub fn bump(&mut self, id: VisualId) -> Token {
        let token = self.tokens.entry(id).or_insert(0);
        *token += 1;
        *token
    }

    #[inline]
    pub fn is_current(&self, id: VisualId, token: Token) -> bool {
        self.current(id) == token
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }
}

/// Expiry tick per recently unregistered id
#[derive(Debug, Default)]
pub struct VisualTombstoneService {
    expiries: FxHashMap<VisualId, Tick>,
}

impl VisualTombstoneService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, id: VisualId, expires_at: Tick) {
        self.expiries.insert(id, expires_at);
    }

    pub fn clear_tombstone(&mut self, id: VisualId) {
        self.expiries.remove(&id);
    }

    /// True while `tick` is before the expiry; expired entries are removed
    pub fn is_tombstoned(&mut self, id: VisualId, tick: Tick) -> bool {
        match self.expiries.get(&id) {
            Some(&expires_at) if tick < expires_at => true,
            Some(_) => {
                self.expiries.remove(&id);
                false
            }
            None => false,
        }
    }

    /// Drop every tombstone whose window has closed
    pub fn prune_expired(&mut self, tick: Tick) -> usize {
        let before = self.expiries.len();
        self.expiries.retain(|_, expires_at| tick < *expires_at);
        before - self.expiries.len()
    }

    pub fn len(&self) -> usize {
        self.expiries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expiries.is_empty()
    }

    pub fn clear(&mut self) {
        self.expiries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_starts_at_zero() {
        let tokens = VisualTokenService::new();
        assert_eq!(tokens.current(42), 0);
        assert!(tokens.is_current(42, 0));
    }

    #[test]
    fn test_bump_is_strictly_increasing() {
        let mut tokens = VisualTokenService::new();
        let initial = tokens.current(1);
        for n in 1..=5 {
            assert_eq!(tokens.bump(1), initial + n);
        }
        assert!(!tokens.is_current(1, initial));
        assert_eq!(tokens.current(2), 0, "Other ids are unaffected");
    }

    #[test]
    fn test_tombstone_window() {
        let mut tombstones = VisualTombstoneService::new();
        tombstones.mark(9, 10);

        assert!(tombstones.is_tombstoned(9, 5));
        assert!(tombstones.is_tombstoned(9, 9));
        assert!(!tombstones.is_tombstoned(9, 10));
        assert!(tombstones.is_empty(), "Expired lookup self-prunes");
    }

    #[test]
    fn test_prune_expired() {
        let mut tombstones = VisualTombstoneService::new();
        tombstones.mark(1, 5);
        tombstones.mark(2, 15);

        assert_eq!(tombstones.prune_expired(10), 1);
        assert_eq!(tombstones.len(), 1);
        assert!(tombstones.is_tombstoned(2, 10));
    }

    #[test]
    fn test_clear_tombstone() {
        let mut tombstones = VisualTombstoneService::new();
        tombstones.mark(3, 100);
        tombstones.clear_tombstone(3);
        assert!(!tombstones.is_tombstoned(3, 0));
    }
}
