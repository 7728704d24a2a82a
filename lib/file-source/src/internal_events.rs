use std::{io::Error, path::Path};

use metrics::{counter, gauge};
use tracing::{debug, error, info, trace, warn};

use crate::FilePosition;

/// Every occurrence the engine reports while it runs.
///
/// The engine never logs on its own; it calls into an implementation of this
/// trait so embedders can route diagnostics wherever they want. The default
/// [`InternalEventsEmitter`] logs through `tracing` and keeps `metrics`
/// counters.
pub trait FileSourceInternalEvents: Send + Sync + Clone + 'static {
    fn emit_file_added(&self, path: &Path);

    fn emit_file_resumed(&self, path: &Path, file_position: FilePosition);

    fn emit_file_unwatched(&self, path: &Path, reached_eof: bool);

    fn emit_file_renamed(&self, old_path: &Path, new_path: &Path);

    fn emit_file_truncated(&self, path: &Path, generation: u64);

    fn emit_file_open_error(&self, path: &Path, error: Error);

    fn emit_file_read_error(&self, path: &Path, error: Error);

    fn emit_file_fingerprint_read_error(&self, path: &Path, error: Error);

    fn emit_duplicate_fingerprint(&self, path: &Path, original_path: &Path);

    fn emit_files_open(&self, count: usize);

    fn emit_files_deferred(&self, count: usize);

    fn emit_path_globbing_failed(&self, path: &Path, error: Error);

    fn emit_record_oversized(&self, path: &Path, max_size: usize);

    fn emit_record_force_flushed(&self, path: &Path, byte_size: usize);

    fn emit_decoder_malformed_replacement(&self, path: &Path, from_encoding: &'static str);

    fn emit_decoder_bom_removal(&self, path: &Path, from_encoding: &'static str);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct InternalEventsEmitter;

impl FileSourceInternalEvents for InternalEventsEmitter {
    fn emit_file_added(&self, path: &Path) {
        info!(message = "Found new file to watch.", file = %path.display());
        counter!("files_added_total").increment(1);
    }

    fn emit_file_resumed(&self, path: &Path, file_position: FilePosition) {
        debug!(
            message = "Resuming to watch file.",
            file = %path.display(),
            file_position = %file_position
        );
        counter!("files_resumed_total").increment(1);
    }

    fn emit_file_unwatched(&self, path: &Path, reached_eof: bool) {
        info!(
            message = "Stopped watching file.",
            file = %path.display(),
            reached_eof = reached_eof,
        );
        counter!("files_unwatched_total").increment(1);
    }

    fn emit_file_renamed(&self, old_path: &Path, new_path: &Path) {
        info!(
            message = "Watched file has been renamed.",
            path = %new_path.display(),
            old_path = %old_path.display(),
        );
        counter!("files_renamed_total").increment(1);
    }

    fn emit_file_truncated(&self, path: &Path, generation: u64) {
        info!(
            message = "File was truncated; reading from the beginning.",
            file = %path.display(),
            generation = generation,
        );
        counter!("files_truncated_total").increment(1);
    }

    fn emit_file_open_error(&self, path: &Path, error: Error) {
        error!(
            message = "Failed to open file for reading.",
            file = %path.display(),
            error = %error,
            error_type = "open_failed",
            stage = "receiving",
            internal_log_rate_limit = true,
        );
        counter!("component_errors_total", "error_type" => "open_failed").increment(1);
    }

    fn emit_file_read_error(&self, path: &Path, error: Error) {
        error!(
            message = "Failed reading file; retrying on the next poll.",
            file = %path.display(),
            error = %error,
            error_type = "read_failed",
            stage = "receiving",
            internal_log_rate_limit = true,
        );
        counter!("component_errors_total", "error_type" => "read_failed").increment(1);
    }

    fn emit_file_fingerprint_read_error(&self, path: &Path, error: Error) {
        error!(
            message = "Failed reading file for fingerprinting.",
            file = %path.display(),
            error = %error,
            error_type = "fingerprint_read_failed",
            stage = "receiving",
            internal_log_rate_limit = true,
        );
        counter!("fingerprint_read_errors_total").increment(1);
    }

    fn emit_duplicate_fingerprint(&self, path: &Path, original_path: &Path) {
        debug!(
            message = "More than one file has the same fingerprint; skipping duplicate.",
            path = %path.display(),
            original_path = %original_path.display(),
        );
    }

    fn emit_files_open(&self, count: usize) {
        gauge!("open_files").set(count as f64);
    }

    fn emit_files_deferred(&self, count: usize) {
        if count > 0 {
            debug!(
                message = "Concurrent file limit reached; deferring files to a later poll.",
                count = count,
            );
        }
        gauge!("deferred_files").set(count as f64);
    }

    fn emit_path_globbing_failed(&self, path: &Path, error: Error) {
        warn!(
            message = "Failed to glob path.",
            path = %path.display(),
            error = %error,
            error_type = "glob_failed",
            stage = "receiving",
            internal_log_rate_limit = true,
        );
        counter!("glob_errors_total").increment(1);
    }

    fn emit_record_oversized(&self, path: &Path, max_size: usize) {
        warn!(
            message = "Found record that exceeds max_log_size; splitting.",
            file = %path.display(),
            max_size = max_size,
            internal_log_rate_limit = true,
        );
        counter!("oversized_records_total").increment(1);
    }

    fn emit_record_force_flushed(&self, path: &Path, byte_size: usize) {
        trace!(
            message = "Flushed incomplete record after force_flush_period.",
            file = %path.display(),
            byte_size = byte_size,
        );
        counter!("force_flushed_records_total").increment(1);
    }

    fn emit_decoder_malformed_replacement(&self, path: &Path, from_encoding: &'static str) {
        warn!(
            message = "Replaced malformed sequences with replacement character while decoding to utf8.",
            file = %path.display(),
            from_encoding = %from_encoding,
            internal_log_rate_limit = true,
        );
        // NOT the actual number of replacements in the output: there's no easy
        // way to get that from encoding_rs.
        counter!("decoder_malformed_replacement_warnings_total").increment(1);
    }

    fn emit_decoder_bom_removal(&self, path: &Path, from_encoding: &'static str) {
        trace!(
            message = "Removing initial BOM bytes from the final output while decoding to utf8.",
            file = %path.display(),
            from_encoding = %from_encoding,
            internal_log_rate_limit = true,
        );
        counter!("decoder_bom_removals_total").increment(1);
    }
}
