//! Storage backend implementations

pub mod fs;
pub mod mem;
