//! Hierarchical address allocation: assigns child addresses as the
//! tree grows, enforcing depth and fan-out bounds.

use crate::address::{Address, DEFAULT_SEG_MAX};
use chronotree_error::{EngineError, Result};
use std::collections::HashMap;

/// Default tree depth bound (`max_depth`), matching the engine's
/// historical default.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Default fan-out bound (`fan_out`), matching the engine's historical
/// default.
pub const DEFAULT_FAN_OUT: u32 = 100;

struct Ledger {
    address: Address,
    child_count: u32,
}

/// Tracks every address handed out so far and each address's
/// next-child counter. Never reclaims an address once allocated.
pub struct AddressAllocator {
    root: Address,
    max_depth: usize,
    fan_out: u32,
    seg_max: u32,
    ledger: HashMap<String, Ledger>,
}

impl AddressAllocator {
    /// Build an allocator rooted at `root_address`, pre-allocating the
    /// root itself.
    pub fn new(root_address: &str, max_depth: usize, fan_out: u32) -> Result<Self> {
        let root = Address::parse(root_address, DEFAULT_SEG_MAX)?;
        let mut ledger = HashMap::new();
        ledger.insert(
            root.to_string(),
            Ledger {
                address: root.clone(),
                child_count: 0,
            },
        );
        Ok(Self {
            root,
            max_depth,
            fan_out,
            seg_max: DEFAULT_SEG_MAX,
            ledger,
        })
    }

    /// `AddressAllocator::new` with the engine's default root
    /// (`"10.0.0.0"`), depth bound, and fan-out bound.
    pub fn with_defaults() -> Self {
        Self::new("10.0.0.0", DEFAULT_MAX_DEPTH, DEFAULT_FAN_OUT)
            .expect("default root address is well-formed")
    }

    /// Idempotent: always returns the pre-assigned root.
    pub fn allocate_root(&self) -> Address {
        self.root.clone()
    }

    /// Allocate the next child address of `parent`.
    ///
    /// Fails with `IP_ALLOCATION` if `parent` is not in the ledger, if
    /// `parent` is already at `max_depth - 1`, if its child counter has
    /// reached the fan-out limit, or if the resulting address is
    /// somehow already allocated (e.g. from an external load).
    #[tracing::instrument(skip(self), fields(parent = %parent))]
    pub fn allocate_child(&mut self, parent: &Address) -> Result<Address> {
        let parent_key = parent.to_string();
        let entry = self
            .ledger
            .get(&parent_key)
            .ok_or_else(|| EngineError::address_allocation(parent_key.clone(), "unknown parent"))?;

        if parent.depth() >= self.max_depth.saturating_sub(1) {
            return Err(EngineError::address_allocation(parent_key, "depth"));
        }

        if entry.child_count >= self.fan_out {
            return Err(EngineError::address_allocation(parent_key, "fan out"));
        }

        let child_count = entry.child_count;
        let child = parent
            .child(child_count, self.seg_max)
            .map_err(|e| EngineError::address_allocation(parent_key.clone(), e.to_string()))?;

        if self.ledger.contains_key(&child.to_string()) {
            return Err(EngineError::address_allocation(
                parent_key,
                format!("address already allocated: {child}"),
            ));
        }

        self.ledger.insert(
            child.to_string(),
            Ledger {
                address: child.clone(),
                child_count: 0,
            },
        );
        self.ledger.get_mut(&parent_key).unwrap().child_count = child_count + 1;

        Ok(child)
    }

    /// Record `address` as allocated with at least `child_count`
    /// children already handed out, without running any depth/fan-out
    /// checks. For replaying a ledger reconstructed from storage: if
    /// `address` is already recorded, `child_count` only raises its
    /// counter, never lowers it.
    #[tracing::instrument(skip(self), fields(address = %address))]
    pub fn register(&mut self, address: Address, child_count: u32) {
        let key = address.to_string();
        let child_count = self.ledger.get(&key).map(|l| l.child_count).unwrap_or(0).max(child_count);
        self.ledger.insert(key, Ledger { address, child_count });
    }

    pub fn is_allocated(&self, address: &Address) -> bool {
        self.ledger.contains_key(&address.to_string())
    }

    /// Every allocated address, in no particular order.
    pub fn allocations(&self) -> Vec<Address> {
        self.ledger.values().map(|l| l.address.clone()).collect()
    }

    pub fn child_count_of(&self, address: &Address) -> Option<u32> {
        self.ledger.get(&address.to_string()).map(|l| l.child_count)
    }

    /// Clear the ledger and re-allocate the root.
    pub fn reset(&mut self) {
        self.ledger.clear();
        self.ledger.insert(
            self.root.to_string(),
            Ledger {
                address: self.root.clone(),
                child_count: 0,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_children_in_call_order() {
        let mut allocator = AddressAllocator::with_defaults();
        let root = allocator.allocate_root();
        let first = allocator.allocate_child(&root).unwrap();
        let second = allocator.allocate_child(&root).unwrap();
        assert_eq!(first.to_string(), "10.0.0.0.0");
        assert_eq!(second.to_string(), "10.0.0.0.1");
    }

    #[test]
    fn enforces_depth_and_fan_out_bounds() {
        let mut allocator = AddressAllocator::new("0", 3, 3).unwrap();
        let root = allocator.allocate_root();

        for _ in 0..3 {
            allocator.allocate_child(&root).unwrap();
        }
        let err = allocator.allocate_child(&root).unwrap_err();
        assert_eq!(err.code(), "IP_ALLOCATION");
        assert!(err.to_string().contains("fan out"));

        // Build a fresh allocator to exercise the depth bound directly:
        // a depth-2 parent (three segments) is one below max_depth=3,
        // so allocating from it must fail with "depth".
        let mut shallow = AddressAllocator::new("0", 3, 3).unwrap();
        let root = shallow.allocate_root();
        let depth1 = shallow.allocate_child(&root).unwrap();
        let depth2 = shallow.allocate_child(&depth1).unwrap();
        let err = shallow.allocate_child(&depth2).unwrap_err();
        assert!(err.to_string().contains("depth"));
    }

    #[test]
    fn register_raises_child_count_without_collision() {
        let mut allocator = AddressAllocator::with_defaults();
        let root = allocator.allocate_root();
        let loaded_child = root.child(0, DEFAULT_SEG_MAX).unwrap();

        // Replay as `load_from_storage` would: the child itself, then
        // its parent with the next-free index.
        allocator.register(loaded_child.clone(), 0);
        allocator.register(root.clone(), 1);

        assert!(allocator.is_allocated(&loaded_child));
        let next = allocator.allocate_child(&root).unwrap();
        assert_eq!(next.to_string(), "10.0.0.0.1");
        assert_ne!(next, loaded_child);

        // A lower replayed count never lowers an already-higher one.
        allocator.register(root.clone(), 0);
        assert_eq!(allocator.child_count_of(&root), Some(2));
    }

    #[test]
    fn reset_clears_ledger_and_reallocates_root() {
        let mut allocator = AddressAllocator::with_defaults();
        let root = allocator.allocate_root();
        let child = allocator.allocate_child(&root).unwrap();
        allocator.reset();
        assert!(allocator.is_allocated(&root));
        assert!(!allocator.is_allocated(&child));
        assert_eq!(allocator.child_count_of(&root), Some(0));
    }
}
