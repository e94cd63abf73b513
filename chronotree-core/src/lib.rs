//! Hierarchical address allocation, the write-through timeline cache,
//! nodes, and the tree repository that ties them together over a
//! pluggable storage backend.

pub mod address;
pub mod allocator;
pub mod dimension;
pub mod node;
pub mod timeline;
pub mod tree;

pub use address::Address;
pub use allocator::AddressAllocator;
pub use dimension::{DimensionDescriptor, DimensionRegistry, ValueDomain};
pub use node::Node;
pub use timeline::Timeline;
pub use tree::{NodeQuery, TraversalOrder, TreeRepository};
