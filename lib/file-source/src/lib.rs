#![deny(clippy::all)]

//! Continuous file discovery and tailing.
//!
//! The [`Manager`] polls the file system on an interval, matches the paths
//! returned by a [`PathsProvider`] against the files it already tracks using a
//! content [`Fingerprint`], and drives one [`FileReader`] per tracked file. Each
//! reader splits newly appended bytes into records, decodes them and hands them
//! to a [`RecordEmitter`].

pub mod buffer;
pub mod config;
pub mod encoding;
mod fingerprinter;
pub mod internal_events;
mod manager;
pub mod paths_provider;
mod reader;
mod record;
pub mod splitter;

pub use self::{
    config::{BuildError, ByteSize, ConfigError, FileConsumerConfig, MultilineConfig},
    encoding::Decoder,
    fingerprinter::{Fingerprint, Fingerprinter},
    internal_events::{FileSourceInternalEvents, InternalEventsEmitter},
    manager::{Manager, Shutdown},
    paths_provider::{glob::Glob, PathsProvider},
    reader::{FileReader, ReaderState},
    record::{Attributes, Record, RecordEmitter, ATTRIBUTE_FILE_NAME, ATTRIBUTE_FILE_PATH},
    splitter::{SplitMode, Splitter},
};

pub type FilePosition = u64;

/// Where a file discovered during the first poll starts being read.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFrom {
    /// Read from the first byte of the file.
    Beginning,
    /// Skip everything already in the file and only read what is appended.
    #[default]
    End,
}
