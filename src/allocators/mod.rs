//! Allocation backends.
//!
//! OS mappings, the TLSF core, and the region records that tie the two
//! together. **These are the only modules that should contain `unsafe` code.**

pub(crate) mod os;
pub(crate) mod region;
pub(crate) mod tlsf;
