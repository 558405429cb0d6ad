pub mod index;
pub mod sweep;

pub use index::{IndexOutcome, ensure_index};
pub use sweep::{OrphanSweeper, SweepOptions, SweepReport};
