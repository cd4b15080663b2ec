//! The reader state machine: pulls buffered bytes from memory or the
//! spill file and feeds them to the downstream channel.

use crate::buffer::Buffer;
use crate::error::{errno_of, ChannelError};
use crate::state::{self, Mode, ReaderState, Shared, State, StateGuard};
use bytes::Bytes;
use std::cmp;
use std::io;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// What the downstream channel will do with further input.
enum SinkDisposition {
    Accepting,
    Waiting,
    Refused,
}

fn disposition(st: &State) -> SinkDisposition {
    if st.sink.accepting_input() {
        SinkDisposition::Accepting
    } else if st.sink.may_accept_input_later() {
        SinkDisposition::Waiting
    } else {
        SinkDisposition::Refused
    }
}

/// Serves buffers to the downstream channel until it stops accepting, the
/// queue runs dry, or an asynchronous file read takes over.
///
/// Only entered when the downstream channel is idle. Every hand-off may
/// reenter the channel through the data callback, so the guard is given
/// up and revalidated around each one.
pub(crate) fn read_next<'a>(shared: &'a Arc<Shared>, mut st: StateGuard<'a>) {
    loop {
        debug_assert!(st.sink.is_idle());
        match st.mode {
            Mode::InMemory => {
                if st.queue.is_empty() {
                    trace!("reader: no more buffers, going inactive");
                    st.reader_state = ReaderState::Inactive;
                    st.verify_invariants();
                    state::call_data_flushed(shared, st);
                    return;
                }
                if st.queue.front().map_or(false, Buffer::is_eos) {
                    feed_eof(shared, st);
                    return;
                }

                let (buffer, guard) = state::pop_front(shared, st);
                let Some(mut guard) = guard else {
                    return;
                };
                guard.reader_state = ReaderState::Feeding;
                trace!(len = buffer.len(), "reader: feeding buffer");
                let Some(guard) = state::deliver(shared, guard, Ok(buffer)) else {
                    return;
                };
                st = guard;
                debug_assert_eq!(st.reader_state, ReaderState::Feeding);
                st.verify_invariants();
                match disposition(&st) {
                    SinkDisposition::Accepting => continue,
                    SinkDisposition::Waiting => {
                        wait_for_idle(&mut st);
                        return;
                    }
                    SinkDisposition::Refused => {
                        trace!("reader: downstream channel refuses further input");
                        terminate(shared, st);
                        return;
                    }
                }
            }
            Mode::InFile => {
                if st.spill_ref().written > 0 {
                    // Unread data on disk; read it back and feed it.
                    read_chunk(shared, st);
                    return;
                }

                // The file holds nothing unread; the next bytes are still
                // in memory, ahead of the writer.
                match find_unread(&st) {
                    None => {
                        st.reader_state = ReaderState::Inactive;
                        if shared.config.auto_truncate_file {
                            state::switch_to_in_memory_mode(&mut st);
                        } else {
                            trace!("reader: drained, keeping spill file");
                        }
                        st.verify_invariants();
                        state::call_data_flushed(shared, st);
                        return;
                    }
                    Some(buffer) if buffer.is_eos() => {
                        feed_eof(shared, st);
                        return;
                    }
                    Some(buffer) => {
                        let len = buffer.len();
                        {
                            let spill = st.spill();
                            spill.read_offset += len as u64;
                            spill.written -= len as i64;
                        }
                        st.reader_state = ReaderState::Feeding;
                        trace!(len, "reader: feeding buffer ahead of the writer");
                        let Some(guard) = state::deliver(shared, st, Ok(buffer)) else {
                            return;
                        };
                        st = guard;
                        debug_assert_eq!(st.reader_state, ReaderState::Feeding);
                        st.verify_invariants();
                        match disposition(&st) {
                            SinkDisposition::Accepting => continue,
                            SinkDisposition::Waiting => {
                                wait_for_idle(&mut st);
                                return;
                            }
                            SinkDisposition::Refused => {
                                trace!("reader: downstream channel refuses further input");
                                terminate(shared, st);
                                return;
                            }
                        }
                    }
                }
            }
            Mode::Error | Mode::ErrorWaiting => unreachable!("reader running in error mode"),
        }
    }
}

fn wait_for_idle(st: &mut State) {
    trace!("reader: waiting for downstream channel to become idle");
    st.reader_state = ReaderState::WaitingForChannelIdle;
    st.verify_invariants();
}

fn feed_eof<'a>(shared: &'a Arc<Shared>, mut st: StateGuard<'a>) {
    trace!("reader: feeding end of stream");
    st.reader_state = ReaderState::FeedingEof;
    st.verify_invariants();
    let Some(st) = state::deliver(shared, st, Ok(Buffer::eos())) else {
        return;
    };
    debug_assert_eq!(st.reader_state, ReaderState::FeedingEof);
    terminate(shared, st);
}

/// Terminal transition shared by the end-of-stream and refused-input
/// paths. A terminated in-file channel has nothing left to serve, so the
/// spill state is torn down once nothing unread remains on disk.
pub(crate) fn terminate<'a>(shared: &'a Arc<Shared>, mut st: StateGuard<'a>) {
    st.reader_state = ReaderState::Terminated;
    if st.mode == Mode::InFile && shared.config.auto_truncate_file && st.spill_ref().written <= 0 {
        state::switch_to_in_memory_mode(&mut st);
    }
    st.verify_invariants();
    state::call_data_flushed(shared, st);
}

/// Locates the next buffer to serve directly from memory when the writer
/// is behind (`written <= 0`). The target offset is how far the reader has
/// already run ahead of the file; the queue still holds everything the
/// writer has not flushed, so walking it by cumulative size finds the
/// first unserved buffer.
fn find_unread(st: &State) -> Option<Buffer> {
    debug_assert!(st.spill_ref().written <= 0);
    let target = (-st.spill_ref().written) as u64;
    let mut offset = 0u64;
    for buffer in st.queue.iter() {
        if offset == target || buffer.is_eos() {
            return Some(buffer.clone());
        }
        offset += buffer.len() as u64;
    }
    None
}

/// Issues an asynchronous read of the next unread chunk on disk.
fn read_chunk<'a>(shared: &'a Arc<Shared>, mut st: StateGuard<'a>) {
    let (file, offset, len) = {
        let spill = st.spill();
        debug_assert!(spill.written > 0);
        let len = cmp::min(spill.written as u64, shared.config.read_chunk_size as u64) as usize;
        let file = spill.file.clone().expect("unread bytes without a spill file");
        (file, spill.read_offset, len)
    };
    trace!(len, offset, "reader: reading chunk from spill file");

    let token = CancellationToken::new();
    st.reader_state = ReaderState::ReadingFromFile;
    st.spill().read_request = Some(token.clone());
    st.verify_invariants();
    drop(st);

    let weak = Arc::downgrade(shared);
    let engine = Arc::clone(&shared.engine);
    tokio::spawn(async move {
        let result = engine.read_at(&file, len, offset).await;
        chunk_read(weak, token, result);
    });
}

fn chunk_read(weak: Weak<Shared>, token: CancellationToken, result: io::Result<Bytes>) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    let mut st = shared.state.lock();
    if token.is_cancelled() {
        return;
    }
    debug_assert_eq!(st.reader_state, ReaderState::ReadingFromFile);
    st.spill().read_request = None;

    match result {
        Ok(chunk) if !chunk.is_empty() => {
            let len = chunk.len();
            {
                let spill = st.spill();
                debug_assert!(len as i64 <= spill.written);
                spill.read_offset += len as u64;
                spill.written -= len as i64;
            }
            st.reader_state = ReaderState::Feeding;
            trace!(len, "reader: feeding chunk from spill file");
            let Some(mut st) = state::deliver(&shared, st, Ok(Buffer::new(chunk))) else {
                return;
            };
            debug_assert_eq!(st.reader_state, ReaderState::Feeding);
            st.verify_invariants();
            match disposition(&st) {
                SinkDisposition::Accepting => {
                    st.reader_state = ReaderState::Inactive;
                    read_next(&shared, st);
                }
                SinkDisposition::Waiting => wait_for_idle(&mut st),
                SinkDisposition::Refused => {
                    trace!("reader: downstream channel refuses further input");
                    terminate(&shared, st);
                }
            }
        }
        Ok(_) => {
            // The file is shorter than `written` promised. Feeding an
            // empty chunk would forge an end of stream, so fail instead.
            warn!("reader: unexpected end of spill file");
            state::set_error(&shared, st, ChannelError::Read(0));
        }
        Err(err) => {
            warn!(%err, "reader: spill file read failed");
            let errno = errno_of(&err);
            state::set_error(&shared, st, ChannelError::Read(errno));
        }
    }
}
