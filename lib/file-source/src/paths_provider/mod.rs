//! Sources of candidate paths for the [`Manager`](crate::Manager) to watch.
//!
//! Configurations always use [`glob::Glob`]. A plain `Vec<PathBuf>` works too,
//! for a fixed set of files.

use std::path::PathBuf;

pub mod glob;

/// Represents the ability to enumerate paths.
///
/// The manager calls [`PathsProvider::paths`] once per poll tick, off the
/// async runtime, so implementations are free to block on the file system.
pub trait PathsProvider: Send + Sync + 'static {
    /// Provides the iterator that returns paths.
    type IntoIter: IntoIterator<Item = PathBuf>;

    /// Provides a set of paths.
    fn paths(&self) -> Self::IntoIter;
}

impl PathsProvider for Vec<PathBuf> {
    type IntoIter = Vec<PathBuf>;

    fn paths(&self) -> Self::IntoIter {
        self.iter().filter(|path| path.is_file()).cloned().collect()
    }
}
