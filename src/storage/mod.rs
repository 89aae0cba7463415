//! Storage layer: host-filesystem access below the encrypted core.
//!
//! This module handles:
//! - Positioned reads and writes on host files
//! - The hashed two-level directory layout mapping object ids to file pairs
//! - The advisory repository lock and repository statistics

mod io;
mod layout;

pub use io::{read_at, read_exact_at, sync, truncate, write_all_at};
pub use layout::{
    current_gid, current_uid, DataDir, ObjectFiles, RepoLock, RepoStatistics,
};
