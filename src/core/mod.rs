//! Instances and the process-wide directory that tracks them.

pub(crate) mod directory;
pub(crate) mod instance;
