//! [`Glob`] paths provider.

use std::path::{Path, PathBuf};

use glob::{Pattern, PatternError};

pub use glob::MatchOptions;

use super::PathsProvider;
use crate::FileSourceInternalEvents;

/// The options every [`Glob`] is built with: `*` stays within a single path
/// segment and only `**` crosses directories.
pub const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A glob-based path provider.
///
/// Provides the paths to the regular files on the file system that match any
/// include pattern and no exclude pattern, sorted and without duplicates.
pub struct Glob<E: FileSourceInternalEvents> {
    include_patterns: Vec<String>,
    exclude_patterns: Vec<Pattern>,
    glob_match_options: MatchOptions,
    emitter: E,
}

impl<E: FileSourceInternalEvents> Glob<E> {
    /// Create a new [`Glob`].
    ///
    /// Returns the first error for a pattern that isn't valid.
    pub fn new(
        include_patterns: &[String],
        exclude_patterns: &[String],
        glob_match_options: MatchOptions,
        emitter: E,
    ) -> Result<Self, PatternError> {
        let include_patterns = include_patterns
            .iter()
            .map(|pattern| {
                let pattern = normalize_pattern(pattern);
                Pattern::new(&pattern).map(|_| pattern)
            })
            .collect::<Result<_, _>>()?;

        let exclude_patterns = exclude_patterns
            .iter()
            .map(|pattern| Pattern::new(&normalize_pattern(pattern)))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            include_patterns,
            exclude_patterns,
            glob_match_options,
            emitter,
        })
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.exclude_patterns
            .iter()
            .any(|pattern| pattern.matches_path_with(path, self.glob_match_options))
    }
}

impl<E: FileSourceInternalEvents> PathsProvider for Glob<E> {
    type IntoIter = Vec<PathBuf>;

    fn paths(&self) -> Self::IntoIter {
        let mut paths = Vec::new();
        for include_pattern in &self.include_patterns {
            let Ok(matches) = glob::glob_with(include_pattern, self.glob_match_options) else {
                // Validated in `new`.
                continue;
            };
            for entry in matches {
                match entry {
                    Ok(path) if path.is_file() && !self.is_excluded(&path) => paths.push(path),
                    Ok(_) => {}
                    Err(error) => {
                        let path = error.path().to_path_buf();
                        self.emitter.emit_path_globbing_failed(&path, error.into());
                    }
                }
            }
        }
        paths.sort();
        paths.dedup();
        paths
    }
}

/// Rewrite `**` that is not a whole path segment (`logs/**.log`) to `*`, which
/// is what it means there. The `glob` crate rejects it otherwise.
pub fn normalize_pattern(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|segment| {
            if segment == "**" || !segment.contains("**") {
                segment.to_owned()
            } else {
                let mut collapsed = String::with_capacity(segment.len());
                for c in segment.chars() {
                    if !(c == '*' && collapsed.ends_with('*')) {
                        collapsed.push(c);
                    }
                }
                collapsed
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
