//! Image and result cache storage on top of a document store plus a blob store.
//!
//! The data plane holds the two storages the image server talks to. The control
//! plane holds index bootstrap and the orphan sweep. Backends plug in through
//! the traits in [`ports`].

pub mod context;
pub mod domain;
mod guard;
pub mod persistence;
pub mod planes;
pub mod ports;
pub mod sniff;

pub use context::{ManualClock, StorageContext, SystemClock};
pub use domain::{
    FileId, IndexSpec, KeyField, LastUpdated, MetadataDocument, RequestContext,
};
pub use planes::control::{IndexOutcome, OrphanSweeper, SweepOptions, SweepReport};
pub use planes::data::{PathStorage, ResultStorage};
pub use ports::{Backends, StorageFactory};
