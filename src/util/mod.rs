//! Small helpers shared by the allocator layers.

pub(crate) mod layout;
pub(crate) mod size;
