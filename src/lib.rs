//! A file backed, unbounded buffering channel.
//!
//! A plain channel can hold a single buffer: nothing more can be written
//! until the previous buffer has been consumed. [`FileBufferedChannel`]
//! removes that restriction by buffering everything fed to it, in memory
//! below a configurable threshold and in an anonymous on-disk spill file
//! beyond it. This lets a fast producer (say, an upstream socket) run
//! ahead of a slow consumer indefinitely without unbounded memory growth
//! and without dropping data.
//!
//! Buffers are delivered strictly in feed order, across mode switches,
//! with every byte delivered exactly once. The spill file is created with
//! a random name and unlinked immediately, so nothing user-visible is
//! ever left on disk; once the backlog drains, the channel returns to
//! in-memory buffering and the file is abandoned.
//!
//! The consumer is a data callback which either acknowledges each buffer
//! synchronously by returning [`Ack::Consumed`], or applies backpressure
//! by returning [`Ack::Pending`] and acknowledging later through
//! [`FileBufferedChannel::consumed`]. An empty buffer marks the end of
//! the stream.
//!
//! # Examples
//! ```no_run
//! use spillway::{Ack, ChannelConfig, FileBufferedChannel};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Arc::new(ChannelConfig::default().threshold(64 * 1024));
//!     let channel = FileBufferedChannel::new(config);
//!
//!     channel.set_data_callback(Box::new(|payload| match payload {
//!         Ok(buffer) if buffer.is_eos() => Ack::Consumed(0),
//!         Ok(buffer) => {
//!             // hand the bytes to the slow side here
//!             Ack::Consumed(buffer.len())
//!         }
//!         Err(err) => {
//!             eprintln!("stream failed: {err}");
//!             Ack::Pending
//!         }
//!     }));
//!
//!     channel.feed("hello, world");
//!     channel.feed_eos();
//! }
//! ```

mod queue;
mod reader;
mod state;
mod writer;

pub mod buffer;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;

pub use buffer::Buffer;
pub use channel::{Ack, ChannelState, DataCallback};
pub use config::{ChannelConfig, SharedChannelConfig};
pub use error::ChannelError;
pub use queue::{MAX_BUFFERS, MAX_MEMORY_BUFFERING};
pub use state::{FlushCallback, Mode, ReaderState, WriterState};

use engine::{DiskEngine, IoEngine};
use parking_lot::Mutex;
use state::{Shared, State};
use std::fmt;
use std::sync::{Arc, Weak};

/// Unbounded buffering front for a single downstream consumer.
///
/// Created in in-memory mode with an inactive reader. Feeding may switch
/// the mode, start the mover, and drive deliveries synchronously when the
/// consumer keeps up. All callbacks run on whichever task is driving the
/// channel at that moment, never concurrently with each other.
///
/// Dropping the channel cancels outstanding spill I/O; the spill file
/// descriptor stays open until the last in-flight operation has unwound.
pub struct FileBufferedChannel {
    shared: Arc<Shared>,
}

impl FileBufferedChannel {
    /// Creates a channel spilling to disk through [`DiskEngine`].
    pub fn new(config: SharedChannelConfig) -> Self {
        Self::with_engine(config, Arc::new(DiskEngine))
    }

    /// Creates a channel with a custom I/O engine.
    pub fn with_engine(config: SharedChannelConfig, engine: Arc<dyn IoEngine>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                engine,
                state: Mutex::new(State::new()),
            }),
        }
    }

    /// Installs the downstream consumer.
    pub fn set_data_callback(&self, callback: DataCallback) {
        self.shared.state.lock().sink.set_data_callback(callback);
    }

    /// Installs the callback fired every time the in-memory queue drains.
    ///
    /// In in-memory mode that means the last buffer went to the consumer;
    /// in in-file mode it means the last buffer reached the spill file.
    /// Neither implies the consumer has seen everything — that is what
    /// the data-flushed callback is for.
    pub fn set_buffers_flushed_callback(&self, callback: FlushCallback) {
        self.shared.state.lock().on_buffers_flushed = Some(callback);
    }

    /// Installs the callback fired when all buffered data, in memory and
    /// on disk, has been delivered to the consumer.
    pub fn set_data_flushed_callback(&self, callback: FlushCallback) {
        self.shared.state.lock().on_data_flushed = Some(callback);
    }

    /// Appends a buffer. An empty buffer marks the end of the stream.
    /// A no-op once the stream has ended or the channel is in error mode.
    pub fn feed(&self, buffer: impl Into<Buffer>) {
        state::feed(&self.shared, buffer.into());
    }

    /// Copies `data` and feeds it.
    pub fn feed_slice(&self, data: &[u8]) {
        self.feed(Buffer::copy_from_slice(data));
    }

    /// Feeds the end-of-stream sentinel.
    pub fn feed_eos(&self) {
        self.feed(Buffer::eos());
    }

    /// Forces the channel into error mode. The error reaches the consumer
    /// exactly once, immediately if the downstream channel is idle.
    pub fn feed_error(&self, error: ChannelError) {
        state::feed_error(&self.shared, error);
    }

    /// Acknowledges the outstanding delivery; the asynchronous complement
    /// of returning [`Ack::Consumed`] from the data callback. Passing
    /// `end = true` declares that no further input will be accepted.
    pub fn consumed(&self, size: usize, end: bool) {
        state::consumed(&self.shared, size, end);
    }

    /// Resumes deliveries after a [`stop`](Self::stop).
    pub fn start(&self) {
        state::start(&self.shared);
    }

    /// Pauses deliveries. Feeding keeps buffering.
    pub fn stop(&self) {
        state::stop(&self.shared);
    }

    pub fn is_started(&self) -> bool {
        self.shared.state.lock().sink.is_started()
    }

    /// Prepares a deinitialized channel for reuse, bumping the
    /// generation.
    pub fn reinitialize(&self) {
        state::reinitialize(&self.shared);
    }

    /// Cancels outstanding I/O, clears all buffered data, and resets the
    /// channel to its initial state, bumping the generation so in-flight
    /// completions back off.
    pub fn deinitialize(&self) {
        state::deinitialize(&self.shared);
    }

    pub fn mode(&self) -> Mode {
        self.shared.state.lock().mode
    }

    pub fn reader_state(&self) -> ReaderState {
        self.shared.state.lock().reader_state
    }

    /// The writer state, or `None` outside in-file mode.
    pub fn writer_state(&self) -> Option<WriterState> {
        self.shared
            .state
            .lock()
            .in_file
            .as_ref()
            .map(|spill| spill.writer_state)
    }

    /// State of the underlying single-slot channel.
    pub fn channel_state(&self) -> ChannelState {
        self.shared.state.lock().sink.state()
    }

    /// Total bytes currently held in the in-memory queue.
    pub fn bytes_buffered(&self) -> u32 {
        self.shared.state.lock().queue.bytes_buffered()
    }

    /// The stored terminal error, if the channel has failed.
    pub fn error(&self) -> Option<ChannelError> {
        self.shared.state.lock().errcode
    }

    /// True once no further input will be accepted: the end-of-stream
    /// sentinel has been fed, the channel failed, or the consumer ended
    /// the stream itself.
    pub fn ended(&self) -> bool {
        self.shared.state.lock().ended()
    }

    /// True once the consumer has acknowledged the terminal delivery.
    pub fn end_acked(&self) -> bool {
        self.shared.state.lock().sink.end_acked()
    }

    pub fn passed_threshold(&self) -> bool {
        let st = self.shared.state.lock();
        st.passed_threshold(&self.shared.config)
    }

    /// A weak handle for use inside callbacks. Holding one does not keep
    /// the channel alive, so callbacks that capture it cannot leak the
    /// channel through a reference cycle.
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl fmt::Debug for FileBufferedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("FileBufferedChannel")
            .field("mode", &st.mode)
            .field("reader_state", &st.reader_state)
            .field("bytes_buffered", &st.queue.bytes_buffered())
            .field("nbuffers", &st.queue.len())
            .finish()
    }
}

/// Weak reference to a [`FileBufferedChannel`].
///
/// Every operation is a no-op once the channel has been dropped.
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Weak<Shared>,
}

impl ChannelHandle {
    pub fn feed(&self, buffer: impl Into<Buffer>) {
        if let Some(shared) = self.shared.upgrade() {
            state::feed(&shared, buffer.into());
        }
    }

    pub fn feed_eos(&self) {
        self.feed(Buffer::eos());
    }

    pub fn feed_error(&self, error: ChannelError) {
        if let Some(shared) = self.shared.upgrade() {
            state::feed_error(&shared, error);
        }
    }

    pub fn consumed(&self, size: usize, end: bool) {
        if let Some(shared) = self.shared.upgrade() {
            state::consumed(&shared, size, end);
        }
    }

    pub fn deinitialize(&self) {
        if let Some(shared) = self.shared.upgrade() {
            state::deinitialize(&shared);
        }
    }
}
