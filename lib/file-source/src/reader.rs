#[cfg(unix)]
use std::os::unix::fs::MetadataExt;
use std::{
    fs::{File, Metadata},
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::{read_until_with_max_size, Chunk},
    encoding::Decoder,
    fingerprinter::{Fingerprint, Fingerprinter},
    record::{Attributes, Record, RecordEmitter, ATTRIBUTE_FILE_NAME, ATTRIBUTE_FILE_PATH},
    splitter::{SplitMode, Splitter},
    FilePosition, FileSourceInternalEvents,
};

type Devno = u64;
type Ino = u64;

/// The device and inode of an open file. Tells a renamed file apart from a
/// copy of it.
pub(crate) type FileId = (Devno, Ino);

#[cfg(unix)]
pub(crate) fn file_id(metadata: &Metadata) -> Option<FileId> {
    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
pub(crate) fn file_id(_: &Metadata) -> Option<FileId> {
    None
}

/// Everything a read cycle needs besides the per-file state. Built once from
/// the configuration and shared by every reader.
pub(crate) struct ReadContext<E> {
    pub fingerprinter: Fingerprinter,
    pub decoder: Decoder,
    pub split_mode: SplitMode,
    pub max_size: usize,
    pub force_flush_period: Option<Duration>,
    pub include_file_name: bool,
    pub include_file_path: bool,
    pub attributes: Attributes,
    pub resource: Attributes,
    pub emitter: Arc<dyn RecordEmitter>,
    pub events: E,
    pub cancel: CancellationToken,
}

impl<E: FileSourceInternalEvents> ReadContext<E> {
    fn new_splitter(&self) -> Splitter {
        Splitter::new(
            self.split_mode.clone(),
            self.decoder.newline(),
            self.max_size,
            self.force_flush_period,
        )
    }

    fn emit(&self, path: &Path, raw: Bytes) {
        if raw.is_empty() {
            return;
        }
        let decoded = self.decoder.decode(raw);
        if decoded.had_errors {
            self.events
                .emit_decoder_malformed_replacement(path, self.decoder.name());
        }
        if decoded.bom_removed {
            self.events.emit_decoder_bom_removal(path, self.decoder.name());
        }

        let mut attributes = Attributes::with_capacity(self.attributes.len() + 2);
        if self.include_file_name {
            if let Some(name) = path.file_name() {
                attributes.insert(
                    ATTRIBUTE_FILE_NAME.to_owned(),
                    name.to_string_lossy().into_owned(),
                );
            }
        }
        if self.include_file_path {
            attributes.insert(
                ATTRIBUTE_FILE_PATH.to_owned(),
                path.to_string_lossy().into_owned(),
            );
        }
        attributes.extend(
            self.attributes
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        self.emitter.emit(
            &self.cancel,
            Record {
                body: decoded.body,
                attributes,
                resource: self.resource.clone(),
            },
        );
    }
}

/// What the engine remembers about a file, with or without an open handle.
///
/// `offset` counts every byte taken out of the file, including the bytes of an
/// incomplete line still held in `carry`.
#[derive(Debug)]
pub struct ReaderState {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub offset: FilePosition,
    /// Bumped every time the file is found truncated.
    pub generation: u64,
    /// The tick this file last held a read slot in.
    pub last_served: u64,
    /// The tick the current read slot was taken in.
    pub(crate) active_since: u64,
    carry: BytesMut,
    splitter: Splitter,
}

impl ReaderState {
    pub(crate) fn new<E: FileSourceInternalEvents>(
        path: PathBuf,
        fingerprint: Fingerprint,
        offset: FilePosition,
        ctx: &ReadContext<E>,
    ) -> Self {
        Self {
            path,
            fingerprint,
            offset,
            generation: 0,
            last_served: 0,
            active_since: 0,
            carry: BytesMut::new(),
            splitter: ctx.new_splitter(),
        }
    }

    /// Nothing is buffered: no partial line and no partial record.
    pub fn is_idle(&self) -> bool {
        self.carry.is_empty() && self.splitter.is_idle()
    }

    /// Buffered data has waited for longer than the force flush period.
    pub fn is_stale(&self, now: Instant) -> bool {
        !self.is_idle() && self.splitter.is_stale(now)
    }

    fn handle_chunk<E: FileSourceInternalEvents>(&mut self, chunk: Chunk, ctx: &ReadContext<E>) {
        let line = match chunk {
            Chunk::Delimited(line) => strip_suffix(line, ctx.decoder.carriage_return()),
            Chunk::Oversized(line) => {
                ctx.events.emit_record_oversized(&self.path, ctx.max_size);
                line
            }
        };
        self.handle_line(line, ctx);
    }

    fn handle_line<E: FileSourceInternalEvents>(&mut self, line: Bytes, ctx: &ReadContext<E>) {
        if let Some(emit) = self.splitter.handle_line(line) {
            for record in emit {
                ctx.emit(&self.path, record);
            }
        }
    }

    /// Emit the partial line and the partial record, complete or not.
    fn flush<E: FileSourceInternalEvents>(&mut self, ctx: &ReadContext<E>) -> usize {
        let mut flushed = 0;
        if !self.carry.is_empty() {
            let mut partial = self.carry.split().freeze();
            flushed += partial.len();
            while partial.len() > ctx.max_size {
                let head = partial.split_to(ctx.max_size);
                self.handle_line(head, ctx);
            }
            let partial = strip_suffix(partial, ctx.decoder.carriage_return());
            self.handle_line(partial, ctx);
        }
        if let Some(record) = self.splitter.flush() {
            flushed += record.len();
            ctx.emit(&self.path, record);
        }
        flushed
    }

    /// Force flush buffered data if it is stale. Needs no file handle, so it
    /// also applies to files waiting for a read slot.
    pub(crate) fn flush_if_stale<E: FileSourceInternalEvents>(
        &mut self,
        ctx: &ReadContext<E>,
        now: Instant,
    ) {
        if self.is_stale(now) {
            let byte_size = self.flush(ctx);
            ctx.events.emit_record_force_flushed(&self.path, byte_size);
        }
    }

    /// Emit whatever is buffered before the state is dropped for good.
    pub(crate) fn finish<E: FileSourceInternalEvents>(mut self, ctx: &ReadContext<E>) {
        self.flush(ctx);
    }
}

/// A tracked file with an open handle.
///
/// Readers are driven by the manager: one [`read_cycle`](Self::read_cycle)
/// per poll tick. A reader can be parked, closing its handle but keeping its
/// [`ReaderState`], and resumed later at the same offset.
pub struct FileReader {
    state: ReaderState,
    reader: BufReader<File>,
    file_id: Option<FileId>,
}

impl FileReader {
    /// Open a new handle on `state.path` positioned at `state.offset`. The
    /// state is handed back when that fails.
    pub(crate) fn open(state: ReaderState) -> Result<Self, (ReaderState, io::Error)> {
        match open_at(&state.path, state.offset) {
            Ok((file, file_id)) => Ok(Self {
                state,
                reader: BufReader::new(file),
                file_id,
            }),
            Err(error) => Err((state, error)),
        }
    }

    /// The identity of the open handle, where the platform has one.
    pub(crate) fn file_id(&self) -> Option<FileId> {
        self.file_id
    }

    /// Replace the handle with a new one on `state.path`, at the same offset.
    /// For when the path now names a different file holding the same content,
    /// as after a copy and truncate rotation. The old handle is kept on error.
    pub(crate) fn reopen(&mut self) -> io::Result<()> {
        let (file, file_id) = open_at(&self.state.path, self.state.offset)?;
        self.reader = BufReader::new(file);
        self.file_id = file_id;
        Ok(())
    }

    pub fn state(&self) -> &ReaderState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut ReaderState {
        &mut self.state
    }

    pub fn path(&self) -> &Path {
        &self.state.path
    }

    /// Close the handle and hand back the state.
    pub fn park(self) -> ReaderState {
        self.state
    }

    /// One read-emit pass: detect truncation, read everything appended up to
    /// the size observed at the start of the cycle, split it into records,
    /// and force flush stale data. I/O errors are reported and the cycle
    /// ends early; the next cycle retries.
    pub(crate) fn read_cycle<E: FileSourceInternalEvents>(
        &mut self,
        ctx: &ReadContext<E>,
        now: Instant,
    ) {
        let size = match self.reader.get_ref().metadata() {
            Ok(metadata) => metadata.len(),
            Err(error) => {
                ctx.events.emit_file_read_error(&self.state.path, error);
                return;
            }
        };

        if size < self.state.offset {
            if let Err(error) = self.rewind() {
                ctx.events.emit_file_read_error(&self.state.path, error);
                return;
            }
            ctx.events
                .emit_file_truncated(&self.state.path, self.state.generation);
        }

        let before = self.state.offset;
        if let Err(error) = self.read_to(size, ctx) {
            ctx.events.emit_file_read_error(&self.state.path, error);
        }
        if self.state.offset > before {
            self.state.splitter.touch(now);
        }

        if !ctx.fingerprinter.is_complete(&self.state.fingerprint) {
            self.refresh_fingerprint(ctx);
        }

        self.state.flush_if_stale(ctx, now);
    }

    /// Read what is left through the still open handle, flush everything
    /// buffered, and close. Used when the file left the candidate set.
    ///
    /// Skipped unless the handle still starts with this reader's fingerprint:
    /// past a truncation, the bytes after `offset` belong to other content.
    pub(crate) fn drain<E: FileSourceInternalEvents>(mut self, ctx: &ReadContext<E>) {
        let same_content = ctx
            .fingerprinter
            .get_fingerprint_of_handle(self.reader.get_ref())
            .map(|current| current.starts_with(&self.state.fingerprint))
            .unwrap_or(false);

        if same_content {
            let drained = self
                .reader
                .seek(SeekFrom::Start(self.state.offset))
                .and_then(|_| self.read_to(FilePosition::MAX, ctx));
            if let Err(error) = drained {
                ctx.events.emit_file_read_error(&self.state.path, error);
            }
        }

        self.state.finish(ctx);
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        let state = &mut self.state;
        state.offset = 0;
        state.carry.clear();
        state.splitter.reset();
        state.generation += 1;
        // Force a refresh: the old prefix describes content that is gone.
        state.fingerprint = Fingerprint::default();
        Ok(())
    }

    fn read_to<E: FileSourceInternalEvents>(
        &mut self,
        size: FilePosition,
        ctx: &ReadContext<E>,
    ) -> io::Result<()> {
        let state = &mut self.state;
        let mut limited = (&mut self.reader).take(size.saturating_sub(state.offset));
        let delimiter = ctx.decoder.newline();
        while let Some(chunk) = read_until_with_max_size(
            &mut limited,
            &mut state.offset,
            delimiter,
            &mut state.carry,
            ctx.max_size,
        )? {
            state.handle_chunk(chunk, ctx);
        }
        Ok(())
    }

    fn refresh_fingerprint<E: FileSourceInternalEvents>(&mut self, ctx: &ReadContext<E>) {
        let refreshed = ctx
            .fingerprinter
            .get_fingerprint_of_handle(self.reader.get_ref())
            .and_then(|fingerprint| {
                // Fingerprinting moved the handle's cursor.
                self.reader.seek(SeekFrom::Start(self.state.offset))?;
                Ok(fingerprint)
            });
        match refreshed {
            Ok(fingerprint) => self.state.fingerprint = fingerprint,
            Err(error) => ctx
                .events
                .emit_file_fingerprint_read_error(&self.state.path, error),
        }
    }
}

fn open_at(path: &Path, offset: FilePosition) -> io::Result<(File, Option<FileId>)> {
    let mut file = File::open(path)?;
    let id = file_id(&file.metadata()?);
    file.seek(SeekFrom::Start(offset))?;
    Ok((file, id))
}

fn strip_suffix(mut line: Bytes, suffix: &[u8]) -> Bytes {
    if line.ends_with(suffix) {
        line.truncate(line.len() - suffix.len());
    }
    line
}
