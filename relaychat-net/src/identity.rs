//! Identity allocation for registered peers.
//!
//! Released identities are reused smallest-first before any fresh identity
//! is issued, so a long-running registry keeps identities dense.

use std::collections::BTreeSet;

use crate::protocol::ClientId;

/// Allocator of positive peer identities.
#[derive(Debug, Clone)]
pub struct IdentityPool {
    released: BTreeSet<ClientId>,
    next_fresh: ClientId,
}

impl Default for IdentityPool {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityPool {
    pub fn new() -> Self {
        Self {
            released: BTreeSet::new(),
            next_fresh: 1,
        }
    }

    /// Take the smallest released identity, else the next fresh one.
    pub fn allocate(&mut self) -> ClientId {
        if let Some(id) = self.released.pop_first() {
            return id;
        }
        let id = self.next_fresh;
        self.next_fresh += 1;
        id
    }

    /// Return an identity to the pool.
    ///
    /// Identities that were never issued, or are already released, are
    /// refused so a released identity can never shadow a live one.
    pub fn release(&mut self, id: ClientId) -> bool {
        if id == 0 || id >= self.next_fresh {
            return false;
        }
        self.released.insert(id)
    }

    /// Released identities in ascending order.
    pub fn released(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.released.iter().copied()
    }

    /// Number of identities currently handed out.
    pub fn in_use(&self) -> usize {
        (self.next_fresh as usize - 1) - self.released.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let mut pool = IdentityPool::new();
        let ids: Vec<_> = (0..5).map(|_| pool.allocate()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(pool.in_use(), 5);
    }

    #[test]
    fn test_released_identity_is_reused_first() {
        let mut pool = IdentityPool::new();
        for _ in 0..4 {
            pool.allocate();
        }
        assert!(pool.release(2));
        assert_eq!(pool.allocate(), 2);
        assert_eq!(pool.allocate(), 5);
    }

    #[test]
    fn test_smallest_released_wins() {
        let mut pool = IdentityPool::new();
        for _ in 0..6 {
            pool.allocate();
        }
        pool.release(5);
        pool.release(3);
        pool.release(4);
        assert_eq!(pool.released().collect::<Vec<_>>(), vec![3, 4, 5]);

        assert_eq!(pool.allocate(), 3);
        assert_eq!(pool.allocate(), 4);
        assert_eq!(pool.allocate(), 5);
        assert_eq!(pool.allocate(), 7);
    }

    #[test]
    fn test_release_rejects_unissued_and_duplicates() {
        let mut pool = IdentityPool::new();
        pool.allocate();

        assert!(!pool.release(0));
        assert!(!pool.release(9));
        assert!(pool.release(1));
        assert!(!pool.release(1));
        assert_eq!(pool.in_use(), 0);
    }
}
