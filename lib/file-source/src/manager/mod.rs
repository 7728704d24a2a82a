use std::{
    fs::File,
    future::Future,
    io,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    fingerprinter::Fingerprint,
    paths_provider::PathsProvider,
    reader::{file_id, FileId, FileReader, ReadContext, ReaderState},
    FilePosition, FileSourceInternalEvents, ReadFrom,
};


/// Returned by [`Manager::run`] once the poll loop has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shutdown;

/// A discovered file, identified for this tick.
#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    fingerprint: Fingerprint,
    size: FilePosition,
    file_id: Option<FileId>,
}

/// What a tick found on disk.
#[derive(Debug, Default)]
struct Discovery {
    candidates: Vec<Candidate>,
    /// Matched paths that couldn't be identified: unreadable or empty.
    skipped: Vec<PathBuf>,
}

/// A file that wants a read slot this tick.
enum Waiting {
    New(Candidate),
    Parked(ReaderState),
}

impl Waiting {
    fn sort_key(&self) -> (u64, &PathBuf) {
        match self {
            // Never served, so first in line.
            Waiting::New(candidate) => (0, &candidate.path),
            Waiting::Parked(state) => (state.last_served, &state.path),
        }
    }
}

/// Files the manager tracks. Readers hold a handle and a read slot; parked
/// states wait for one.
#[derive(Default)]
struct Tracked {
    active: Vec<FileReader>,
    parked: Vec<ReaderState>,
}

/// Tick-wide settings for reconciliation.
#[derive(Clone, Copy)]
struct Admission {
    tick: u64,
    max_concurrent_files: usize,
    read_from: ReadFrom,
}

impl Admission {
    /// Where a newly discovered file starts being read. Only files seen on
    /// the very first tick honor `start_at = end`; anything that shows up
    /// later was created while we watched, so all of it is new.
    fn initial_offset(&self, size: FilePosition) -> FilePosition {
        match (self.tick, self.read_from) {
            (1, ReadFrom::End) => size,
            _ => 0,
        }
    }
}

/// The poll loop.
///
/// Every tick the manager globs for candidates, identifies them by
/// fingerprint, reconciles them with the files it already tracks, hands out
/// at most `max_concurrent_files` read slots and runs one read cycle per
/// slot. Ticks are driven by [`run`](Self::run), or one at a time by
/// [`poll`](Self::poll).
///
/// Reconciliation always runs on its own; read cycles of different files run
/// in parallel, each reader owned by exactly one worker.
pub struct Manager<PP, E>
where
    PP: PathsProvider,
    E: FileSourceInternalEvents,
{
    paths_provider: Arc<PP>,
    ctx: Arc<ReadContext<E>>,
    poll_interval: Duration,
    max_concurrent_files: usize,
    read_from: ReadFrom,
    tracked: Tracked,
    tick: u64,
}

impl<PP, E> Manager<PP, E>
where
    PP: PathsProvider,
    E: FileSourceInternalEvents,
{
    pub(crate) fn new(
        paths_provider: PP,
        ctx: ReadContext<E>,
        poll_interval: Duration,
        max_concurrent_files: usize,
        read_from: ReadFrom,
    ) -> Self {
        Self {
            paths_provider: Arc::new(paths_provider),
            ctx: Arc::new(ctx),
            poll_interval,
            max_concurrent_files,
            read_from,
            tracked: Tracked::default(),
            tick: 0,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn max_concurrent_files(&self) -> usize {
        self.max_concurrent_files
    }

    /// Files currently holding a read slot.
    pub fn files_open(&self) -> usize {
        self.tracked.active.len()
    }

    /// Files tracked without a handle, waiting for a read slot.
    pub fn files_parked(&self) -> usize {
        self.tracked.parked.len()
    }

    /// The token handed to the record emitter. Cancelled when the poll loop
    /// stops.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Poll ticks until `shutdown` resolves.
    ///
    /// Shutdown is only observed between ticks: a tick in progress finishes
    /// its reads so no record is emitted half way. Open handles are closed
    /// before returning.
    pub async fn run<S>(mut self, shutdown: S) -> Shutdown
    where
        S: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }
            self.poll().await;
        }

        self.ctx.cancel.cancel();
        let Tracked { active, parked } = std::mem::take(&mut self.tracked);
        info!(
            message = "Stopped polling files.",
            files_open = active.len(),
            files_parked = parked.len(),
        );
        drop(active);
        self.ctx.events.emit_files_open(0);
        Shutdown
    }

    /// Run a single tick.
    pub async fn poll(&mut self) {
        self.tick += 1;
        let admission = Admission {
            tick: self.tick,
            max_concurrent_files: self.max_concurrent_files,
            read_from: self.read_from,
        };

        let tracked = std::mem::take(&mut self.tracked);
        let paths_provider = Arc::clone(&self.paths_provider);
        let ctx = Arc::clone(&self.ctx);
        let reconciled = tokio::task::spawn_blocking(move || {
            let discovery = discover(&*paths_provider, &ctx);
            reconcile(tracked, discovery, &ctx, admission)
        })
        .await;
        let Tracked { active, parked } = match reconciled {
            Ok(tracked) => tracked,
            Err(error) => {
                error!(message = "File discovery failed; all tracked files were lost.", %error);
                return;
            }
        };
        self.tracked.parked = parked;

        let now = Instant::now();
        let cycles = active.into_iter().map(|mut reader| {
            let ctx = Arc::clone(&self.ctx);
            tokio::task::spawn_blocking(move || {
                reader.read_cycle(&ctx, now);
                reader
            })
        });
        for result in join_all(cycles).await {
            match result {
                Ok(mut reader) => {
                    reader.state_mut().last_served = self.tick;
                    self.tracked.active.push(reader);
                }
                Err(error) => error!(message = "Read cycle failed; file dropped.", %error),
            }
        }

        self.ctx.events.emit_files_open(self.tracked.active.len());
    }
}

/// Glob, then fingerprint every match. Files that can't be read, empty files,
/// and duplicates of an earlier path are left out.
fn discover<PP, E>(paths_provider: &PP, ctx: &ReadContext<E>) -> Discovery
where
    PP: PathsProvider,
    E: FileSourceInternalEvents,
{
    let mut paths: Vec<PathBuf> = paths_provider.paths().into_iter().collect();
    paths.sort();
    paths.dedup();

    let mut discovery = Discovery::default();
    for path in paths {
        let identified = File::open(&path).and_then(|file| {
            let metadata = file.metadata()?;
            let fingerprint = ctx.fingerprinter.get_fingerprint_of_handle(&file)?;
            io::Result::Ok((fingerprint, metadata.len(), file_id(&metadata)))
        });
        let (fingerprint, size, file_id) = match identified {
            Ok(identified) => identified,
            Err(error) => {
                ctx.events.emit_file_fingerprint_read_error(&path, error);
                discovery.skipped.push(path);
                continue;
            }
        };

        // Nothing to identify an empty file by; wait until it has content.
        if fingerprint.is_empty() {
            discovery.skipped.push(path);
            continue;
        }
        if let Some(original) = discovery
            .candidates
            .iter()
            .find(|c| c.fingerprint == fingerprint)
        {
            ctx.events.emit_duplicate_fingerprint(&path, &original.path);
            continue;
        }
        discovery.candidates.push(Candidate {
            path,
            fingerprint,
            size,
            file_id,
        });
    }
    discovery
}

/// Find the first unclaimed state `candidate` may continue.
fn claim<'a>(
    states: impl Iterator<Item = &'a ReaderState>,
    claimed: &mut [bool],
    candidate: &Candidate,
    same_path_only: bool,
) -> Option<usize> {
    let index = states.enumerate().position(|(index, state)| {
        !claimed[index]
            && (!same_path_only || state.path == candidate.path)
            && candidate.fingerprint.starts_with(&state.fingerprint)
    })?;
    claimed[index] = true;
    Some(index)
}

/// Apply what this tick found on disk to the tracked files.
fn reconcile<E: FileSourceInternalEvents>(
    tracked: Tracked,
    discovery: Discovery,
    ctx: &ReadContext<E>,
    admission: Admission,
) -> Tracked {
    let events = &ctx.events;
    let Tracked {
        mut active,
        mut parked,
    } = tracked;

    // Pair candidates with what we already track. A candidate at a tracked
    // path gets the first chance at it; otherwise the prefix decides, which is
    // how renames are followed.
    let mut active_claimed = vec![false; active.len()];
    let mut parked_claimed = vec![false; parked.len()];
    let mut active_pending = vec![false; active.len()];
    let mut active_reopen = vec![false; active.len()];
    let mut parked_pending = vec![false; parked.len()];
    let mut new_files = Vec::new();
    let mut unmatched = Vec::new();

    let mut pending = discovery.candidates;
    for same_path_only in [true, false] {
        for candidate in std::mem::take(&mut pending) {
            let state = if let Some(index) = claim(
                active.iter().map(FileReader::state),
                &mut active_claimed,
                &candidate,
                same_path_only,
            ) {
                let reader = &mut active[index];
                active_pending[index] = candidate.size != reader.state().offset;
                // Moved to a path that holds a copy, not the file we have open.
                active_reopen[index] = reader.state().path != candidate.path
                    && candidate.file_id.is_some()
                    && reader.file_id() != candidate.file_id;
                reader.state_mut()
            } else if let Some(index) =
                claim(parked.iter(), &mut parked_claimed, &candidate, same_path_only)
            {
                parked_pending[index] = candidate.size != parked[index].offset;
                &mut parked[index]
            } else if same_path_only {
                unmatched.push(candidate);
                continue;
            } else {
                new_files.push(candidate);
                continue;
            };

            if state.path != candidate.path {
                events.emit_file_renamed(&state.path, &candidate.path);
                state.path = candidate.path;
            }
        }
        pending = std::mem::take(&mut unmatched);
    }

    // A tracked file that merely couldn't be identified this tick stays; an
    // emptied one is seen as truncated by its next read cycle.
    for (reader, claimed) in active.iter().zip(active_claimed.iter_mut()) {
        *claimed |= discovery.skipped.contains(&reader.state().path);
    }
    for (state, claimed) in parked.iter().zip(parked_claimed.iter_mut()) {
        *claimed |= discovery.skipped.contains(&state.path);
    }

    // Whatever wasn't found is gone. Readers still hold a handle to what was
    // written before the file disappeared.
    let mut kept_active = Vec::with_capacity(active.len());
    let mut kept_pending = Vec::with_capacity(active.len());
    let mut reopen_failed = Vec::new();
    let active_flags = active_claimed.into_iter().zip(active_pending).zip(active_reopen);
    for (mut reader, ((claimed, pending), reopen)) in active.into_iter().zip(active_flags) {
        if claimed {
            if reopen {
                if let Err(error) = reader.reopen() {
                    events.emit_file_open_error(reader.path(), error);
                    reopen_failed.push(reader.park());
                    continue;
                }
            }
            kept_active.push(reader);
            kept_pending.push(pending);
        } else {
            let path = reader.path().to_path_buf();
            reader.drain(ctx);
            events.emit_file_unwatched(&path, true);
        }
    }
    let mut active = kept_active;

    let mut waiting: Vec<Waiting> = new_files
        .into_iter()
        .map(Waiting::New)
        .chain(reopen_failed.into_iter().map(Waiting::Parked))
        .collect();
    let mut still_parked = Vec::with_capacity(parked.len());
    for ((state, claimed), pending) in parked.drain(..).zip(parked_claimed).zip(parked_pending) {
        match (claimed, pending) {
            (false, _) => {
                let path = state.path.clone();
                state.finish(ctx);
                events.emit_file_unwatched(&path, false);
            }
            (true, true) => waiting.push(Waiting::Parked(state)),
            (true, false) => still_parked.push(state),
        }
    }
    waiting.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    // Make room for waiting files by parking readers, idle ones first and then
    // the ones that have held their slot the longest.
    let free = admission.max_concurrent_files.saturating_sub(active.len());
    if waiting.len() > free {
        let to_yield = (waiting.len() - free).min(active.len());
        let mut order: Vec<usize> = (0..active.len()).collect();
        order.sort_by_key(|&index| (kept_pending[index], active[index].state().active_since));
        let mut yielding = vec![false; active.len()];
        for &index in order.iter().take(to_yield) {
            yielding[index] = true;
        }

        let mut kept = Vec::with_capacity(active.len() - to_yield);
        for (reader, yielding) in active.into_iter().zip(yielding) {
            if yielding {
                debug!(message = "Yielding read slot.", path = ?reader.path());
                still_parked.push(reader.park());
            } else {
                kept.push(reader);
            }
        }
        active = kept;
    }

    let mut deferred = 0;
    for waiting in waiting {
        let admit = active.len() < admission.max_concurrent_files;
        let state = match waiting {
            Waiting::New(candidate) => {
                let offset = admission.initial_offset(candidate.size);
                let state = ReaderState::new(candidate.path, candidate.fingerprint, offset, ctx);
                if admit {
                    events.emit_file_added(&state.path);
                }
                state
            }
            Waiting::Parked(state) => {
                if admit {
                    events.emit_file_resumed(&state.path, state.offset);
                }
                state
            }
        };

        if !admit {
            deferred += 1;
            still_parked.push(state);
            continue;
        }

        match FileReader::open(state) {
            Ok(mut reader) => {
                reader.state_mut().active_since = admission.tick;
                active.push(reader);
            }
            Err((state, error)) => {
                events.emit_file_open_error(&state.path, error);
                still_parked.push(state);
            }
        }
    }
    events.emit_files_deferred(deferred);

    let now = Instant::now();
    for state in &mut still_parked {
        state.flush_if_stale(ctx, now);
    }

    Tracked {
        active,
        parked: still_parked,
    }
}
