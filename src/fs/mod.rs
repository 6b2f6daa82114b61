//! Filesystem enumeration and metadata handling.

pub mod metadata;
pub mod walker;
