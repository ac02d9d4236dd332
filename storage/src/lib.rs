//! Object-block slice index and trunk reclaimer (spec.md §4.D, §4.E).

pub mod index;
pub mod ops;
pub mod reclaim;
pub mod trunk;

pub use index::{OBSliceEntry, ObjectBlockIndex, ReclaimToken};
pub use ops::{Source, StorageEngine};
pub use reclaim::TrunkReclaimer;
pub use trunk::{Trunk, TrunkPool, TrunkSpace};
