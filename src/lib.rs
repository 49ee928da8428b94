//! Remembered-set maintenance for a region-partitioned, generational,
//! mostly-concurrent garbage collector.
//!
//! The heap is a contiguous range carved into fixed-size regions; each region
//! keeps a remembered set (RS) of cards in *other* regions that may contain
//! pointers into it. Mutator stores are logged through a card-table post-write
//! barrier into dirty-card queues. This crate implements everything that keeps
//! those remembered sets current:
//!
//! * concurrent card refinement, which drains the dirty-card logs off-pause
//!   and installs cross-region references into the owning region's RS
//!   ([`remset::RemSetEngine::refine_card_concurrently`]),
//! * pause-time RS update and collection-set scanning
//!   ([`remset::RemSetEngine::oops_into_collection_set_do`]),
//! * RS scrubbing against marking liveness ([`remset::RemSetEngine::scrub`]),
//! * chunked, yield-safe RS rebuilding after a marking cycle
//!   ([`remset::RemSetEngine::rebuild_rem_set`]).
//!
//! The surrounding collector supplies the collection set, the evacuation
//! push closure and the marking artifacts; this crate supplies the engine
//! plus the concrete region/card/RS machinery it runs on.

#[macro_use]
extern crate log;

pub mod util;
pub mod vm;
pub mod policy;
pub mod heap;
pub mod barrier;
pub mod scheduler;
pub mod mark;
pub mod refine;
pub mod remset;

pub use crate::heap::RegionalHeap;
pub use crate::remset::RemSetEngine;
pub use crate::util::address::{Address, ObjectReference};
pub use crate::util::options::Options;
