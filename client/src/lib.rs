//! Write-combine engine (spec.md §4.C): coalesces contiguous same-block
//! writes from the same OTID into a single outbound RPC.

pub mod engine;
pub mod slice;
pub mod transport;
pub mod wheel;

pub use engine::{CombineEngine, CombineOutcome, WriteContext};
pub use slice::{CombineResult, SliceEntry};
pub use transport::Transport;
pub use wheel::TimingWheel;
