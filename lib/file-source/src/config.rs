use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use regex::bytes::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use snafu::Snafu;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    buffer::align_max_size,
    encoding::Decoder,
    fingerprinter::Fingerprinter,
    manager::Manager,
    paths_provider::glob::{normalize_pattern, Glob, MATCH_OPTIONS},
    reader::ReadContext,
    record::{Attributes, RecordEmitter},
    splitter::SplitMode,
    FileSourceInternalEvents, InternalEventsEmitter, ReadFrom,
};

/// Fingerprints shorter than this can't tell files apart reliably.
pub const MIN_FINGERPRINT_SIZE: u64 = 16;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("`include` must contain at least one pattern"))]
    MissingInclude,

    #[snafu(display("Invalid include pattern {pattern:?}: {source}"))]
    InvalidInclude {
        pattern: String,
        source: glob::PatternError,
    },

    #[snafu(display("Invalid exclude pattern {pattern:?}: {source}"))]
    InvalidExclude {
        pattern: String,
        source: glob::PatternError,
    },

    #[snafu(display(
        "Only one of `multiline.line_start_pattern` and `multiline.line_end_pattern` can be set"
    ))]
    ConflictingMultiline,

    #[snafu(display("Invalid `multiline.line_start_pattern`: {source}"))]
    InvalidLineStartPattern { source: regex::Error },

    #[snafu(display("Invalid `multiline.line_end_pattern`: {source}"))]
    InvalidLineEndPattern { source: regex::Error },

    #[snafu(display("Unsupported encoding {encoding:?}"))]
    UnsupportedEncoding { encoding: String },

    #[snafu(display("`{option}` must be greater than zero"))]
    NonPositive { option: &'static str },

    #[snafu(display(
        "`fingerprint_size` must be at least {} bytes, got {}",
        MIN_FINGERPRINT_SIZE,
        size
    ))]
    FingerprintTooSmall { size: u64 },
}

/// Every problem found while validating a [`FileConsumerConfig`].
#[derive(Debug, Snafu)]
#[snafu(display("Invalid file consumer configuration: {}", join(errors)))]
pub struct BuildError {
    pub errors: Vec<ConfigError>,
}

fn join(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Multiline options. At most one pattern may be set; with neither, every line
/// is a record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct MultilineConfig {
    /// A line matching this regular expression starts a new record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_start_pattern: Option<String>,

    /// A line matching this regular expression ends the current record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_end_pattern: Option<String>,
}

/// Configuration of the file consumer.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConsumerConfig {
    /// Glob patterns of the files to read.
    pub include: Vec<String>,

    /// Glob patterns of files to skip, even when an include pattern matches.
    pub exclude: Vec<String>,

    /// How often to look for new files and new data.
    #[serde(with = "duration")]
    pub poll_interval: Duration,

    /// How many bytes from the start of a file identify it.
    pub fingerprint_size: ByteSize,

    /// The largest record that is buffered. Longer records are split.
    #[serde(alias = "max_record_size")]
    pub max_log_size: ByteSize,

    /// How many files are read at the same time.
    pub max_concurrent_files: usize,

    /// Where to start reading files found during the first poll.
    pub start_at: ReadFrom,

    /// Text encoding of the files. `nop` passes raw bytes through.
    pub encoding: String,

    /// How long an incomplete record may wait for more data before it is
    /// emitted anyway. Zero disables.
    #[serde(with = "duration")]
    pub force_flush_period: Duration,

    pub multiline: MultilineConfig,

    /// Add the file name to every record as `log.file.name`.
    pub include_file_name: bool,

    /// Add the file path to every record as `log.file.path`.
    pub include_file_path: bool,

    /// Static attributes added to every record.
    pub attributes: Attributes,

    /// Static resource attributes added to every record.
    pub resource: Attributes,
}

impl Default for FileConsumerConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            poll_interval: Duration::from_millis(200),
            fingerprint_size: ByteSize(1000),
            max_log_size: ByteSize(1024 * 1024),
            max_concurrent_files: 1024,
            start_at: ReadFrom::End,
            encoding: "utf-8".to_owned(),
            force_flush_period: Duration::from_millis(500),
            multiline: MultilineConfig::default(),
            include_file_name: true,
            include_file_path: false,
            attributes: Attributes::new(),
            resource: Attributes::new(),
        }
    }
}

impl FileConsumerConfig {
    /// Validate the configuration and build a [`Manager`] that reports
    /// through the default [`InternalEventsEmitter`].
    pub fn build(
        &self,
        emitter: impl RecordEmitter,
    ) -> Result<Manager<Glob<InternalEventsEmitter>, InternalEventsEmitter>, BuildError> {
        self.build_with_events(emitter, InternalEventsEmitter)
    }

    /// Validate the configuration and build a [`Manager`].
    ///
    /// Validation doesn't stop at the first problem: the error lists all of
    /// them.
    pub fn build_with_events<E: FileSourceInternalEvents>(
        &self,
        emitter: impl RecordEmitter,
        events: E,
    ) -> Result<Manager<Glob<E>, E>, BuildError> {
        let mut errors = Vec::new();

        if self.include.is_empty() {
            errors.push(ConfigError::MissingInclude);
        }
        for pattern in &self.include {
            if let Err(source) = glob::Pattern::new(&normalize_pattern(pattern)) {
                errors.push(ConfigError::InvalidInclude {
                    pattern: pattern.clone(),
                    source,
                });
            }
        }
        for pattern in &self.exclude {
            if let Err(source) = glob::Pattern::new(&normalize_pattern(pattern)) {
                errors.push(ConfigError::InvalidExclude {
                    pattern: pattern.clone(),
                    source,
                });
            }
        }

        let split_mode = self.split_mode().unwrap_or_else(|error| {
            errors.push(error);
            SplitMode::Newline
        });

        let decoder = Decoder::for_label(&self.encoding);
        if decoder.is_none() {
            errors.push(ConfigError::UnsupportedEncoding {
                encoding: self.encoding.clone(),
            });
        }

        if self.poll_interval.is_zero() {
            errors.push(ConfigError::NonPositive {
                option: "poll_interval",
            });
        }
        if self.max_log_size.0 == 0 {
            errors.push(ConfigError::NonPositive {
                option: "max_log_size",
            });
        }
        if self.max_concurrent_files == 0 {
            errors.push(ConfigError::NonPositive {
                option: "max_concurrent_files",
            });
        }
        if self.fingerprint_size.0 < MIN_FINGERPRINT_SIZE {
            errors.push(ConfigError::FingerprintTooSmall {
                size: self.fingerprint_size.0,
            });
        }

        let decoder = match decoder {
            Some(decoder) if errors.is_empty() => decoder,
            _ => return Err(BuildError { errors }),
        };

        let paths_provider = Glob::new(&self.include, &self.exclude, MATCH_OPTIONS, events.clone())
            .map_err(|source| BuildError {
                errors: vec![ConfigError::InvalidInclude {
                    pattern: self.include.join(", "),
                    source,
                }],
            })?;

        let ctx = ReadContext {
            fingerprinter: Fingerprinter::new(saturating_usize(self.fingerprint_size.0)),
            decoder,
            split_mode,
            max_size: align_max_size(
                saturating_usize(self.max_log_size.0),
                decoder.newline().len(),
            ),
            force_flush_period: (!self.force_flush_period.is_zero())
                .then_some(self.force_flush_period),
            include_file_name: self.include_file_name,
            include_file_path: self.include_file_path,
            attributes: self.attributes.clone(),
            resource: self.resource.clone(),
            emitter: Arc::new(emitter),
            events,
            cancel: CancellationToken::new(),
        };

        Ok(Manager::new(
            paths_provider,
            ctx,
            self.poll_interval,
            clamp_to_open_file_limit(self.max_concurrent_files),
            self.start_at,
        ))
    }

    fn split_mode(&self) -> Result<SplitMode, ConfigError> {
        let non_empty = |pattern: &Option<String>| pattern.clone().filter(|p| !p.is_empty());
        match (
            non_empty(&self.multiline.line_start_pattern),
            non_empty(&self.multiline.line_end_pattern),
        ) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingMultiline),
            (Some(start), None) => Regex::new(&start)
                .map(SplitMode::LineStart)
                .map_err(|source| ConfigError::InvalidLineStartPattern { source }),
            (None, Some(end)) => Regex::new(&end)
                .map(SplitMode::LineEnd)
                .map_err(|source| ConfigError::InvalidLineEndPattern { source }),
            (None, None) => Ok(SplitMode::Newline),
        }
    }
}

fn saturating_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

fn clamp_to_open_file_limit(max_concurrent_files: usize) -> usize {
    match open_file_limit() {
        Some(limit) if max_concurrent_files > limit => {
            warn!(
                message = "`max_concurrent_files` exceeds the open file limit; clamping.",
                max_concurrent_files,
                limit,
            );
            limit
        }
        _ => max_concurrent_files,
    }
}

#[cfg(unix)]
fn open_file_limit() -> Option<usize> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `getrlimit` only writes to the struct it is handed.
    let result = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    (result == 0 && limit.rlim_cur != libc::RLIM_INFINITY && limit.rlim_cur > 0)
        .then(|| usize::try_from(limit.rlim_cur).unwrap_or(usize::MAX))
}

#[cfg(not(unix))]
const fn open_file_limit() -> Option<usize> {
    None
}

/// A number of bytes. Deserializes from integers and from strings with an
/// optional unit suffix understood by [`bytesize`]: `b`, `kb`, `kib`, `mb`,
/// `mib`, `gb`, `gib` and so on, in any case. Fractions are rounded to the
/// nearest byte, so `"1.1kb"` is 1100.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ParseByteSizeError {
    #[snafu(display("Invalid byte size {input:?}: expected a number"))]
    InvalidNumber { input: String },

    #[snafu(display("Invalid byte size {input:?}: {reason}"))]
    UnknownUnit { input: String, reason: String },
}

impl ByteSize {
    fn from_f64(value: f64) -> Option<Self> {
        (value.is_finite() && value >= 0.0 && value <= u64::MAX as f64)
            .then(|| Self(value.round() as u64))
    }
}

impl FromStr for ByteSize {
    type Err = ParseByteSizeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);

        let number: f64 = number.parse().map_err(|_| ParseByteSizeError::InvalidNumber {
            input: input.to_owned(),
        })?;
        // Only the unit comes from `bytesize`: it truncates fractional sizes,
        // so `1.15kb` would land a byte short.
        let unit = format!("1{}", unit.trim());
        let unit = bytesize::ByteSize::from_str(&unit).map_err(|reason| {
            ParseByteSizeError::UnknownUnit {
                input: input.to_owned(),
                reason: reason.to_string(),
            }
        })?;

        Self::from_f64(number * unit.as_u64() as f64).ok_or_else(|| {
            ParseByteSizeError::InvalidNumber {
                input: input.to_owned(),
            }
        })
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ByteSizeVisitor;

        impl de::Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte count, optionally with a unit such as \"1kib\"")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<ByteSize, E> {
                u64::try_from(value)
                    .map(ByteSize)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(value), &self))
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<ByteSize, E> {
                ByteSize::from_f64(value)
                    .ok_or_else(|| E::invalid_value(de::Unexpected::Float(value), &self))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<ByteSize, E> {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

/// Durations as humantime strings (`"200ms"`, `"1m30s"`) or as bare numbers of
/// seconds.
mod duration {
    use std::{fmt, time::Duration};

    use serde::{de, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl de::Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration such as \"200ms\", or a number of seconds")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::invalid_value(de::Unexpected::Signed(value), &self))
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<Duration, E> {
            Duration::try_from_secs_f64(value)
                .map_err(|_| E::invalid_value(de::Unexpected::Float(value), &self))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
            let value = value.trim();
            match value.parse::<f64>() {
                Ok(seconds) => self.visit_f64(seconds),
                Err(_) => humantime::parse_duration(value).map_err(E::custom),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::Record;

    fn parse(toml: &str) -> FileConsumerConfig {
        toml::from_str(toml).unwrap()
    }

    fn base() -> FileConsumerConfig {
        FileConsumerConfig {
            include: vec!["/var/log/testpath.*".to_owned()],
            exclude: vec!["/var/log/testpath.ex*".to_owned()],
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn build_errors(config: &FileConsumerConfig) -> Vec<ConfigError> {
        match config.build(|_: &CancellationToken, _: Record| {}) {
            Ok(_) => Vec::new(),
            Err(error) => error.errors,
        }
    }

    #[test]
    fn empty_document_is_the_default() {
        assert_eq!(parse(""), FileConsumerConfig::default());
    }

    #[test]
    fn full_document() {
        let config = parse(
            r#"
            include = ["i1", "i2"]
            exclude = ["e1", "e2"]
            poll_interval = "200ms"
            fingerprint_size = "1024"
            max_log_size = "1mib"
            max_concurrent_files = 1024
            start_at = "beginning"
            encoding = "utf16"
            force_flush_period = "500ms"
            include_file_name = true
            include_file_path = false

            [multiline]
            line_start_pattern = "start"

            [attributes]
            env = "prod"

            [resource]
            "host.name" = "box"
            "#,
        );
        assert_eq!(config.include, vec!["i1", "i2"]);
        assert_eq!(config.exclude, vec!["e1", "e2"]);
        assert_eq!(config.fingerprint_size, ByteSize(1024));
        assert_eq!(config.max_log_size, ByteSize(1024 * 1024));
        assert_eq!(config.start_at, ReadFrom::Beginning);
        assert_eq!(config.multiline.line_start_pattern.as_deref(), Some("start"));
        assert_eq!(config.attributes["env"], "prod");
        assert_eq!(config.resource["host.name"], "box");
    }

    #[test]
    fn poll_interval_units() {
        for (value, expected) in [
            ("1", Duration::from_secs(1)),
            ("\"1\"", Duration::from_secs(1)),
            ("0.5", Duration::from_millis(500)),
            ("\"1s\"", Duration::from_secs(1)),
            ("\"1ms\"", Duration::from_millis(1)),
            ("\"1000ms\"", Duration::from_secs(1)),
        ] {
            let config = parse(&format!("poll_interval = {value}"));
            assert_eq!(config.poll_interval, expected, "poll_interval = {value}");
        }
        assert!(toml::from_str::<FileConsumerConfig>("poll_interval = -1").is_err());
    }

    #[test]
    fn fingerprint_size_units() {
        for (value, expected) in [
            ("1000", 1000),
            ("\"1kb\"", 1000),
            ("\"1KB\"", 1000),
            ("\"1kib\"", 1024),
            ("\"1KiB\"", 1024),
            ("\"1.1kb\"", 1100),
            ("\"1.15kb\"", 1150),
            ("\"2 KiB\"", 2048),
            ("1.5", 2),
        ] {
            let config = parse(&format!("fingerprint_size = {value}"));
            assert_eq!(
                config.fingerprint_size,
                ByteSize(expected),
                "fingerprint_size = {value}"
            );
        }
    }

    #[test]
    fn max_log_size_units_and_alias() {
        for value in ["\"1mib\"", "\"1MiB\"", "1048576"] {
            let config = parse(&format!("max_log_size = {value}"));
            assert_eq!(config.max_log_size, ByteSize(1 << 20));
        }
        assert_eq!(parse("max_log_size = \"1MB\"").max_log_size, ByteSize(1_000_000));
        assert_eq!(
            parse("max_record_size = \"2kib\"").max_log_size,
            ByteSize(2048)
        );
    }

    #[test]
    fn byte_size_rejects_garbage() {
        assert!(matches!(
            "12 parsecs".parse::<ByteSize>(),
            Err(ParseByteSizeError::UnknownUnit { .. })
        ));
        assert!(matches!(
            "3 furlongs".parse::<ByteSize>(),
            Err(ParseByteSizeError::UnknownUnit { input, .. }) if input == "3 furlongs"
        ));
        assert!(matches!(
            "kb".parse::<ByteSize>(),
            Err(ParseByteSizeError::InvalidNumber { .. })
        ));
        assert!(toml::from_str::<FileConsumerConfig>("fingerprint_size = -3").is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<FileConsumerConfig>("includes = [\"*.log\"]").is_err());
        assert!(toml::from_str::<FileConsumerConfig>("[multiline]\nline_middle = \"x\"").is_err());
    }

    #[test]
    fn basic_config_builds() {
        assert!(build_errors(&base()).is_empty());

        let mut config = base();
        config.multiline.line_start_pattern = Some("START.*".to_owned());
        assert!(build_errors(&config).is_empty());

        let mut config = base();
        config.multiline.line_end_pattern = Some("END.*".to_owned());
        assert!(build_errors(&config).is_empty());
    }

    #[test]
    fn encodings_are_case_insensitive() {
        for encoding in ["utf-16le", "UTF-16lE", "nop", "ascii", "utf16"] {
            let mut config = base();
            config.encoding = encoding.to_owned();
            assert!(build_errors(&config).is_empty(), "{encoding}");
        }
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut config = base();
        config.include = vec!["[".to_owned()];
        assert!(matches!(
            build_errors(&config)[..],
            [ConfigError::InvalidInclude { .. }]
        ));

        let mut config = base();
        config.exclude = vec!["[".to_owned()];
        assert!(matches!(
            build_errors(&config)[..],
            [ConfigError::InvalidExclude { .. }]
        ));

        let mut config = base();
        config.multiline.line_start_pattern = Some(".*".to_owned());
        config.multiline.line_end_pattern = Some(".*".to_owned());
        assert!(matches!(
            build_errors(&config)[..],
            [ConfigError::ConflictingMultiline]
        ));

        let mut config = base();
        config.multiline.line_start_pattern = Some("(".to_owned());
        assert!(matches!(
            build_errors(&config)[..],
            [ConfigError::InvalidLineStartPattern { .. }]
        ));

        let mut config = base();
        config.multiline.line_end_pattern = Some("(".to_owned());
        assert!(matches!(
            build_errors(&config)[..],
            [ConfigError::InvalidLineEndPattern { .. }]
        ));

        let mut config = base();
        config.encoding = "UTF-3233".to_owned();
        assert!(matches!(
            build_errors(&config)[..],
            [ConfigError::UnsupportedEncoding { .. }]
        ));

        let mut config = base();
        config.fingerprint_size = ByteSize(8);
        assert!(matches!(
            build_errors(&config)[..],
            [ConfigError::FingerprintTooSmall { size: 8 }]
        ));
    }

    #[test]
    fn all_problems_are_reported_together() {
        let config = FileConsumerConfig {
            include: Vec::new(),
            exclude: vec!["[".to_owned()],
            poll_interval: Duration::ZERO,
            max_log_size: ByteSize(0),
            max_concurrent_files: 0,
            encoding: "klingon".to_owned(),
            multiline: MultilineConfig {
                line_start_pattern: Some("a".to_owned()),
                line_end_pattern: Some("b".to_owned()),
            },
            ..Default::default()
        };
        let Err(error) = config.build(|_: &CancellationToken, _: Record| {}) else {
            panic!("configuration should be rejected");
        };
        assert_eq!(error.errors.len(), 7);

        let message = error.to_string();
        assert!(message.contains("`include` must contain at least one pattern"));
        assert!(message.contains("Unsupported encoding \"klingon\""));
        assert!(message.contains("`max_concurrent_files` must be greater than zero"));
    }

    #[test]
    fn empty_patterns_mean_line_mode() {
        let mut config = base();
        config.multiline.line_start_pattern = Some(String::new());
        config.multiline.line_end_pattern = Some(String::new());
        assert!(matches!(config.split_mode(), Ok(SplitMode::Newline)));
    }

    #[test]
    fn huge_concurrency_is_clamped_not_rejected() {
        let mut config = base();
        config.max_concurrent_files = usize::MAX;
        let manager = config.build(|_: &CancellationToken, _: Record| {}).unwrap();
        if let Some(limit) = open_file_limit() {
            assert_eq!(manager.max_concurrent_files(), limit);
        }
    }
}
