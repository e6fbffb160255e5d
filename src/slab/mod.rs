//! Slab allocator for small objects.
//!
//! Sits on top of the page allocator: sub-page requests are served from
//! page-sized slabs partitioned into fixed-size cells and tracked by an
//! in-band header with occupancy bitmaps; anything larger is forwarded
//! to the page tier.

pub mod slab_allocator;
pub mod slab_header;

pub use slab_allocator::{PageProvider, SlabAllocator, SLAB_CLASS_COUNT, SLAB_CLASS_SIZES};
pub use slab_header::SLAB_HEADER_RESERVED;
