//! Shared channel state: the mode machine, error handling, and the
//! callback discipline.
//!
//! Every field of the channel lives behind one mutex; whoever holds the
//! guard owns the state machines. User callbacks are invoked with the
//! lock released and the generation counter is rechecked afterwards, so a
//! callback may reenter any public operation, including `deinitialize`.

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::config::SharedChannelConfig;
use crate::engine::{IoEngine, SpillFile};
use crate::error::ChannelError;
use crate::queue::BufferQueue;
use crate::{reader, writer};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Buffering mode of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// All buffered data lives in memory.
    InMemory,
    /// Buffered data beyond what the reader has served spills to an
    /// anonymous file on disk.
    InFile,
    /// A terminal error has been delivered downstream.
    Error,
    /// A terminal error is parked until the downstream channel becomes
    /// idle enough to receive it.
    ErrorWaiting,
}

impl Mode {
    pub fn is_error(self) -> bool {
        matches!(self, Mode::Error | Mode::ErrorWaiting)
    }
}

/// Progress of the reader, which drives delivery to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Nothing to deliver; reactivated by the next feed.
    Inactive,
    /// Handing a buffer to the downstream channel.
    Feeding,
    /// Handing the end-of-stream sentinel to the downstream channel.
    FeedingEof,
    /// The downstream channel is busy; the reader resumes when it is
    /// acknowledged.
    WaitingForChannelIdle,
    /// An asynchronous spill file read is outstanding.
    ReadingFromFile,
    /// End of stream or error; only `deinitialize` revives the reader.
    Terminated,
}

/// Progress of the writer ("mover"), which drains the in-memory queue
/// onto the spill file. Only meaningful in in-file mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// No buffers left to move.
    Inactive,
    /// The spill file is being created.
    CreatingFile,
    /// A buffer write is outstanding.
    Moving,
    /// End of stream or error; the writer issues no further writes.
    Terminated,
}

/// Everything that only exists while spilled to disk.
///
/// `written` is the number of unread bytes on disk relative to
/// `read_offset`. It goes negative when the reader has served buffers
/// directly from memory that the writer is still flushing; in that case
/// those buffers are still queued, so `written < 0` implies a non-empty
/// queue.
pub(crate) struct InFileMode {
    /// None while the file is being created.
    pub file: Option<SpillFile>,
    pub read_request: Option<CancellationToken>,
    pub writer_state: WriterState,
    pub writer_request: Option<CancellationToken>,
    /// Bytes already read back from the spill file.
    pub read_offset: u64,
    pub written: i64,
}

impl InFileMode {
    pub fn new() -> Self {
        Self {
            file: None,
            read_request: None,
            writer_state: WriterState::Inactive,
            writer_request: None,
            read_offset: 0,
            written: 0,
        }
    }
}

/// Callback fired on the queue-drained and data-flushed events.
pub type FlushCallback = Box<dyn FnMut() + Send>;

pub(crate) struct State {
    pub mode: Mode,
    pub reader_state: ReaderState,
    pub errcode: Option<ChannelError>,
    /// Bumped by `reinitialize`/`deinitialize`. Sampled around every
    /// callback invocation to detect that the callback reset the channel.
    pub generation: u64,
    pub queue: BufferQueue,
    pub in_file: Option<InFileMode>,
    pub sink: Channel,
    pub on_buffers_flushed: Option<FlushCallback>,
    pub on_data_flushed: Option<FlushCallback>,
}

pub(crate) struct Shared {
    pub config: SharedChannelConfig,
    pub engine: Arc<dyn IoEngine>,
    pub state: Mutex<State>,
}

pub(crate) type StateGuard<'a> = MutexGuard<'a, State>;

impl State {
    pub fn new() -> Self {
        Self {
            mode: Mode::InMemory,
            reader_state: ReaderState::Inactive,
            errcode: None,
            generation: 0,
            queue: BufferQueue::new(),
            in_file: None,
            sink: Channel::new(),
            on_buffers_flushed: None,
            on_data_flushed: None,
        }
    }

    pub fn spill(&mut self) -> &mut InFileMode {
        self.in_file.as_mut().expect("in-file state missing")
    }

    pub fn spill_ref(&self) -> &InFileMode {
        self.in_file.as_ref().expect("in-file state missing")
    }

    pub fn passed_threshold(&self, config: &SharedChannelConfig) -> bool {
        self.queue.bytes_buffered() >= config.threshold
    }

    /// True once no further input will be accepted: the end-of-stream
    /// sentinel is queued, the channel failed, or the downstream channel
    /// has ended on its own.
    pub fn ended(&self) -> bool {
        self.queue.back().map_or(false, Buffer::is_eos) || self.mode.is_error() || self.sink.ended()
    }

    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        if self.mode.is_error() {
            assert_eq!(self.reader_state, ReaderState::Terminated);
            assert!(self.in_file.is_none());
        }
        assert_eq!(self.errcode.is_some(), self.mode.is_error());
        assert_eq!(self.in_file.is_some(), self.mode == Mode::InFile);

        match self.reader_state {
            ReaderState::WaitingForChannelIdle => assert!(!self.mode.is_error()),
            ReaderState::ReadingFromFile => {
                let spill = self.in_file.as_ref().expect("reading without spill state");
                assert!(spill.read_request.is_some());
                assert!(spill.written > 0);
            }
            _ => {}
        }

        if let Some(spill) = &self.in_file {
            assert_eq!(
                spill.read_request.is_some(),
                self.reader_state == ReaderState::ReadingFromFile
            );
            assert_eq!(
                spill.writer_request.is_some(),
                matches!(
                    spill.writer_state,
                    WriterState::CreatingFile | WriterState::Moving
                )
            );
            assert!(spill.read_offset as i128 + spill.written as i128 >= 0);
            if spill.written < 0 {
                assert!(!self.queue.is_empty());
            }
        }
    }

    #[cfg(not(debug_assertions))]
    pub fn verify_invariants(&self) {}
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(spill) = state.in_file.as_mut() {
            if let Some(token) = spill.read_request.take() {
                token.cancel();
            }
            if let Some(token) = spill.writer_request.take() {
                token.cancel();
            }
        }
    }
}

/// Appends a buffer, switching modes and kicking the mover and reader as
/// needed. A no-op once the stream has ended or failed.
pub(crate) fn feed(shared: &Arc<Shared>, buffer: Buffer) {
    let mut st = shared.state.lock();
    st.verify_invariants();
    trace!(len = buffer.len(), "feeding buffer");
    if st.ended() {
        trace!("feed ignored: stream already ended or failed");
        return;
    }

    st.queue.push(buffer);
    if st.mode == Mode::InMemory && st.passed_threshold(&shared.config) {
        switch_to_in_file_mode(shared, &mut st);
    } else if st.mode == Mode::InFile
        && st.spill_ref().writer_state == WriterState::Inactive
        && shared.config.auto_start_mover
    {
        writer::move_next_buffer(shared, &mut st);
    }

    if st.reader_state == ReaderState::Inactive {
        if st.sink.accepting_input() {
            reader::read_next(shared, st);
        } else {
            trace!("reader: waiting for downstream channel to become idle");
            st.reader_state = ReaderState::WaitingForChannelIdle;
            st.verify_invariants();
        }
    }
}

pub(crate) fn feed_error(shared: &Arc<Shared>, error: ChannelError) {
    let st = shared.state.lock();
    set_error(shared, st, error);
}

/// Pushes the channel into error mode: cancels outstanding I/O, drops the
/// spill state, and delivers the error downstream — immediately if the
/// downstream channel is idle, otherwise once it becomes idle or ends.
/// Idempotent after the first error.
pub(crate) fn set_error(shared: &Arc<Shared>, mut st: StateGuard<'_>, error: ChannelError) {
    if st.mode.is_error() {
        return;
    }
    debug!(%error, "entering error mode");

    cancel_reader(&mut st);
    if st.mode == Mode::InFile {
        cancel_writer(&mut st);
    }
    st.reader_state = ReaderState::Terminated;
    st.errcode = Some(error);
    st.in_file = None;

    if st.sink.accepting_input() {
        st.mode = Mode::Error;
        st.verify_invariants();
        deliver_error(shared, st, error);
    } else {
        debug!("downstream busy, delaying error delivery");
        st.mode = Mode::ErrorWaiting;
        st.verify_invariants();
    }
}

pub(crate) fn cancel_reader(st: &mut State) {
    if st.reader_state == ReaderState::ReadingFromFile {
        if let Some(spill) = st.in_file.as_mut() {
            if let Some(token) = spill.read_request.take() {
                token.cancel();
            }
        }
    }
}

pub(crate) fn cancel_writer(st: &mut State) {
    let Some(spill) = st.in_file.as_mut() else {
        return;
    };
    match spill.writer_state {
        WriterState::CreatingFile | WriterState::Moving => {
            if let Some(token) = spill.writer_request.take() {
                token.cancel();
            }
            spill.writer_state = WriterState::Inactive;
        }
        WriterState::Inactive => {}
        WriterState::Terminated => {}
    }
}

pub(crate) fn switch_to_in_file_mode(shared: &Arc<Shared>, st: &mut State) {
    debug_assert_eq!(st.mode, Mode::InMemory);
    debug_assert!(st.in_file.is_none());
    debug!(bytes = st.queue.bytes_buffered(), "spilling to disk");
    st.mode = Mode::InFile;
    st.in_file = Some(InFileMode::new());
    writer::create_spill_file(shared, st);
}

/// The spill file is abandoned rather than truncated: pending background
/// I/O keeps running against the unlinked inode and cannot corrupt a
/// future spill.
pub(crate) fn switch_to_in_memory_mode(st: &mut State) {
    debug_assert_eq!(st.mode, Mode::InFile);
    debug_assert!(st.spill_ref().written <= 0);
    debug!("spill file drained, back to in-memory buffering");
    cancel_writer(st);
    st.queue.clear();
    st.mode = Mode::InMemory;
    st.in_file = None;
}

/// Hands a payload to the data callback with the state lock released.
///
/// Returns the reacquired guard, or `None` when the callback reset the
/// channel (generation bump) or pushed it into error mode; the caller must
/// then abandon whatever it was doing.
pub(crate) fn deliver<'a>(
    shared: &'a Arc<Shared>,
    mut st: StateGuard<'a>,
    payload: Result<Buffer, ChannelError>,
) -> Option<StateGuard<'a>> {
    let generation = st.generation;
    let is_error = payload.is_err();
    match &payload {
        Ok(buffer) => st.sink.begin_feed(buffer.is_eos()),
        Err(_) => st.sink.begin_error(),
    }
    let mut callback = st.sink.take_data_callback();
    drop(st);

    let ack = match callback.as_mut() {
        Some(callback) => callback(payload),
        None => crate::channel::Ack::Consumed(0),
    };

    let mut st = shared.state.lock();
    st.sink.restore_data_callback(callback);
    if st.generation == generation {
        if is_error {
            st.sink.error_acked();
        } else {
            st.sink.apply_ack(ack);
        }
    }

    if st.generation == generation
        && !is_error
        && st.mode == Mode::ErrorWaiting
        && st.sink.accepting_input()
    {
        // The callback failed the channel mid-delivery; flush the parked
        // error now that the slot is idle again.
        let error = st.errcode.expect("error mode without error");
        st.mode = Mode::Error;
        st.verify_invariants();
        deliver(shared, st, Err(error));
        return None;
    }

    if st.generation != generation || st.mode.is_error() {
        None
    } else {
        Some(st)
    }
}

pub(crate) fn deliver_error(shared: &Arc<Shared>, st: StateGuard<'_>, error: ChannelError) {
    debug!(%error, "delivering error downstream");
    let _ = deliver(shared, st, Err(error));
}

#[derive(Clone, Copy)]
enum FlushKind {
    BuffersFlushed,
    DataFlushed,
}

fn fire_flush_callback<'a>(
    shared: &'a Arc<Shared>,
    mut st: StateGuard<'a>,
    kind: FlushKind,
) -> Option<StateGuard<'a>> {
    let slot = match kind {
        FlushKind::BuffersFlushed => &mut st.on_buffers_flushed,
        FlushKind::DataFlushed => &mut st.on_data_flushed,
    };
    let mut callback = match slot.take() {
        Some(callback) => Some(callback),
        None => return Some(st),
    };
    let generation = st.generation;
    drop(st);

    if let Some(callback) = callback.as_mut() {
        callback();
    }

    let mut st = shared.state.lock();
    let slot = match kind {
        FlushKind::BuffersFlushed => &mut st.on_buffers_flushed,
        FlushKind::DataFlushed => &mut st.on_data_flushed,
    };
    if slot.is_none() {
        *slot = callback;
    }
    if st.generation != generation || st.mode.is_error() {
        None
    } else {
        Some(st)
    }
}

/// Fired every time the in-memory queue drains.
pub(crate) fn call_buffers_flushed<'a>(
    shared: &'a Arc<Shared>,
    st: StateGuard<'a>,
) -> Option<StateGuard<'a>> {
    trace!("all in-memory buffers flushed");
    fire_flush_callback(shared, st, FlushKind::BuffersFlushed)
}

/// Fired when all buffered data, in memory and on disk, has been
/// delivered and the reader is idle or terminated.
pub(crate) fn call_data_flushed<'a>(
    shared: &'a Arc<Shared>,
    st: StateGuard<'a>,
) -> Option<StateGuard<'a>> {
    trace!("all buffered data flushed");
    fire_flush_callback(shared, st, FlushKind::DataFlushed)
}

/// Pops the front buffer; when the queue drains this fires the
/// buffers-flushed callback with the lock released. A `None` guard means
/// the callback reset or failed the channel.
pub(crate) fn pop_front<'a>(
    shared: &'a Arc<Shared>,
    mut st: StateGuard<'a>,
) -> (Buffer, Option<StateGuard<'a>>) {
    let buffer = st.queue.pop();
    trace!(remaining = st.queue.len(), "popped buffer");
    if st.queue.is_empty() {
        let st = call_buffers_flushed(shared, st);
        (buffer, st)
    } else {
        (buffer, Some(st))
    }
}

/// Rearm point run after every acknowledgement that may have made the
/// downstream channel idle: resumes a parked reader, or flushes a parked
/// error.
pub(crate) fn on_sink_event<'a>(shared: &'a Arc<Shared>, mut st: StateGuard<'a>) {
    if st.reader_state == ReaderState::WaitingForChannelIdle {
        if st.sink.accepting_input() {
            trace!("downstream channel idle again, resuming reader");
            reader::read_next(shared, st);
        } else if st.sink.ended() {
            trace!("downstream channel ended while reader was waiting");
            reader::terminate(shared, st);
        }
    } else if st.mode == Mode::ErrorWaiting {
        let error = st.errcode.expect("error mode without error");
        if st.sink.accepting_input() {
            st.mode = Mode::Error;
            st.verify_invariants();
            deliver_error(shared, st, error);
        } else if st.sink.ended() {
            // Downstream is gone; nothing left to deliver the error to.
            st.mode = Mode::Error;
            st.verify_invariants();
        }
    }
}

pub(crate) fn consumed(shared: &Arc<Shared>, size: usize, end: bool) {
    let mut st = shared.state.lock();
    if st.sink.consumed(size, end) {
        on_sink_event(shared, st);
    }
}

pub(crate) fn start(shared: &Arc<Shared>) {
    let mut st = shared.state.lock();
    if st.sink.start() {
        on_sink_event(shared, st);
    }
}

pub(crate) fn stop(shared: &Arc<Shared>) {
    shared.state.lock().sink.stop();
}

/// Cancels outstanding I/O and resets every field, bumping the generation
/// so that in-flight completions and unwinding callers back off.
pub(crate) fn deinitialize(shared: &Arc<Shared>) {
    let mut st = shared.state.lock();
    debug!("deinitializing");
    cancel_reader(&mut st);
    if st.mode == Mode::InFile {
        cancel_writer(&mut st);
    }
    st.queue.clear();
    st.mode = Mode::InMemory;
    st.reader_state = ReaderState::Inactive;
    st.errcode = None;
    st.in_file = None;
    st.generation = st.generation.wrapping_add(1);
    st.sink.reset();
    st.verify_invariants();
}

pub(crate) fn reinitialize(shared: &Arc<Shared>) {
    let mut st = shared.state.lock();
    st.sink.reset();
    st.generation = st.generation.wrapping_add(1);
    st.verify_invariants();
}
