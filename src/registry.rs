//! Correlation of platform round-trips.
//!
//! The platform answers permission prompts and activity launches on its own
//! schedule, identified only by the integer request code it was handed. The
//! registry hands out those codes and gives the stored continuation back
//! exactly once when the answer arrives.

use std::{
   collections::HashMap,
   sync::atomic::{AtomicI32, Ordering},
};

use log::warn;
use parking_lot::Mutex;

/// Token space and pending continuations for one kind of round-trip.
///
/// Tokens increase monotonically for the lifetime of the registry and wrap
/// at `i32::MAX`. A continuation whose answer never arrives stays pending
/// forever.
pub struct CorrelationRegistry<T> {
   next: AtomicI32,
   pending: Mutex<HashMap<i32, T>>,
}

impl<T> Default for CorrelationRegistry<T> {
   fn default() -> Self {
      Self::new()
   }
}

impl<T> CorrelationRegistry<T> {
   pub fn new() -> Self {
      Self {
         next: AtomicI32::new(0),
         pending: Mutex::new(HashMap::new()),
      }
   }

   /// Stores `continuation` and returns the token to hand to the platform.
   pub fn issue(&self, continuation: T) -> i32 {
      let token = self.next.fetch_add(1, Ordering::Relaxed);
      if self.pending.lock().insert(token, continuation).is_some() {
         warn!("Request token {token} reissued while still pending, dropping the older request");
      }
      token
   }

   /// Removes and returns the continuation for `token`.
   pub fn resolve(&self, token: i32) -> Option<T> {
      self.pending.lock().remove(&token)
   }

   /// Removes and returns every pending continuation.
   pub fn drain(&self) -> Vec<T> {
      self.pending.lock().drain().map(|(_, c)| c).collect()
   }

   /// Number of requests still waiting for an answer.
   pub fn len(&self) -> usize {
      self.pending.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.pending.lock().is_empty()
   }
}

#[cfg(test)]
mod tests {
   use std::{sync::Arc, thread};

   use super::*;

   #[test]
   fn test_resolve_returns_continuation_once() {
      let registry = CorrelationRegistry::new();
      let token = registry.issue("first");

      assert_eq!(registry.resolve(token), Some("first"));
      assert_eq!(registry.resolve(token), None);
      assert!(registry.is_empty());
   }

   #[test]
   fn test_tokens_increase_per_registry() {
      let a = CorrelationRegistry::new();
      let b = CorrelationRegistry::new();

      let t0 = a.issue(());
      let t1 = a.issue(());
      assert!(t1 > t0);

      // Each registry owns its own token space.
      assert_eq!(b.issue(()), t0);
      assert_eq!(a.len(), 2);
   }

   #[test]
   fn test_drain_empties_registry_and_keeps_counting() {
      let registry = CorrelationRegistry::new();
      let first = registry.issue("a");
      registry.issue("b");

      let mut drained = registry.drain();
      drained.sort_unstable();
      assert_eq!(drained, vec!["a", "b"]);
      assert!(registry.is_empty());
      assert_eq!(registry.resolve(first), None);

      // Tokens handed out before the drain are never reused.
      assert!(registry.issue("c") > first + 1);
   }

   #[test]
   fn test_unknown_token_is_absent() {
      let registry: CorrelationRegistry<u8> = CorrelationRegistry::new();
      assert_eq!(registry.resolve(42), None);
   }

   #[test]
   fn test_token_wraps_at_overflow() {
      let registry = CorrelationRegistry::new();
      registry.next.store(i32::MAX, Ordering::Relaxed);

      assert_eq!(registry.issue('a'), i32::MAX);
      assert_eq!(registry.issue('b'), i32::MIN);
      assert_eq!(registry.resolve(i32::MAX), Some('a'));
      assert_eq!(registry.resolve(i32::MIN), Some('b'));
   }

   #[test]
   fn test_concurrent_issue_yields_unique_tokens() {
      let registry = Arc::new(CorrelationRegistry::new());
      let handles: Vec<_> = (0..8)
         .map(|n| {
            let registry = registry.clone();
            thread::spawn(move || (0..100).map(|i| registry.issue(n * 100 + i)).collect::<Vec<_>>())
         })
         .collect();

      let mut tokens: Vec<i32> = handles
         .into_iter()
         .flat_map(|h| h.join().expect("issuer thread panicked"))
         .collect();
      tokens.sort_unstable();
      tokens.dedup();

      assert_eq!(tokens.len(), 800);
      assert_eq!(registry.len(), 800);
   }
}
