//! The writer ("mover") state machine: creates the spill file and moves
//! queued buffers onto it.

use crate::buffer::Buffer;
use crate::engine::{IoEngine, SpillFile};
use crate::error::{errno_of, ChannelError};
use crate::state::{self, Mode, Shared, State, WriterState};
use bytes::Bytes;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Starts creating the spill file, optionally after the configured delay.
///
/// The file is unlinked in the background the moment it exists: the open
/// descriptor keeps the inode alive, and nothing user-visible remains on
/// disk even if the channel dies mid-spill.
pub(crate) fn create_spill_file(shared: &Arc<Shared>, st: &mut State) {
    let spill = st.spill();
    debug_assert_eq!(spill.writer_state, WriterState::Inactive);
    debug_assert!(spill.file.is_none());

    let path = shared
        .config
        .buffer_dir
        .join(format!("buffer.{}", Uuid::new_v4().simple()));
    let token = CancellationToken::new();
    spill.writer_state = WriterState::CreatingFile;
    spill.writer_request = Some(token.clone());
    trace!(path = %path.display(), "writer: creating spill file");

    let weak = Arc::downgrade(shared);
    let engine = Arc::clone(&shared.engine);
    let delay = shared.config.delay_in_file_mode_switching;
    tokio::spawn(async move {
        if !delay.is_zero() {
            trace!(?delay, "writer: delaying spill file creation");
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let result = engine.create(&path).await;
        if result.is_ok() {
            unlink_in_background(Arc::clone(&engine), path.clone());
        }
        file_created(weak, token, result);
    });
}

fn unlink_in_background(engine: Arc<dyn IoEngine>, path: PathBuf) {
    tokio::spawn(async move {
        match engine.unlink(&path).await {
            Ok(()) => trace!(path = %path.display(), "spill file unlinked"),
            // Non-fatal: the descriptor is the only handle that matters.
            Err(err) => warn!(path = %path.display(), %err, "failed to unlink spill file"),
        }
    });
}

fn file_created(weak: Weak<Shared>, token: CancellationToken, result: io::Result<SpillFile>) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    let mut st = shared.state.lock();
    if token.is_cancelled() {
        return;
    }
    debug_assert_eq!(st.spill_ref().writer_state, WriterState::CreatingFile);
    st.spill().writer_request = None;

    match result {
        Ok(file) => {
            debug!("writer: spill file ready");
            st.spill().file = Some(file);
            move_next_buffer(&shared, &mut st);
            st.verify_invariants();
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            debug!("writer: spill path taken, retrying with a fresh name");
            st.spill().writer_state = WriterState::Inactive;
            create_spill_file(&shared, &mut st);
            st.verify_invariants();
        }
        Err(err) => {
            warn!(%err, "writer: spill file creation failed");
            let errno = errno_of(&err);
            state::set_error(&shared, st, ChannelError::Open(errno));
        }
    }
}

/// Issues the next buffer move, or parks the writer when the queue is
/// empty or ends in the end-of-stream sentinel (which never touches the
/// file; the reader serves it from memory).
pub(crate) fn move_next_buffer(shared: &Arc<Shared>, st: &mut State) {
    debug_assert_eq!(st.mode, Mode::InFile);

    if st.queue.is_empty() {
        trace!("writer: no more buffers, going inactive");
        st.spill().writer_state = WriterState::Inactive;
        return;
    }
    if st.queue.front().map_or(false, Buffer::is_eos) {
        trace!("writer: end of stream reached, writer done");
        st.spill().writer_state = WriterState::Terminated;
        return;
    }

    let buffer = st.queue.front().expect("queue emptied underfoot").clone();
    let (file, offset) = {
        let spill = st.spill();
        let file = spill.file.clone().expect("moving before spill file exists");
        let offset = (spill.read_offset as i64 + spill.written) as u64;
        (file, offset)
    };
    let token = CancellationToken::new();
    st.spill().writer_state = WriterState::Moving;
    st.spill().writer_request = Some(token.clone());
    trace!(len = buffer.len(), offset, "writer: moving buffer to spill file");

    let weak = Arc::downgrade(shared);
    let engine = Arc::clone(&shared.engine);
    tokio::spawn(async move {
        match write_fully(engine.as_ref(), &file, buffer.into_bytes(), offset, &token).await {
            Some(result) => buffer_written(weak, token, result),
            // Cancelled mid-write; whoever cancelled owns the state now.
            None => {}
        }
    });
}

/// Writes `bytes` at `offset`, reissuing after partial writes until the
/// buffer is fully on disk, an error occurs, or the request is cancelled.
async fn write_fully(
    engine: &dyn IoEngine,
    file: &SpillFile,
    bytes: Bytes,
    offset: u64,
    token: &CancellationToken,
) -> Option<io::Result<usize>> {
    let total = bytes.len();
    let mut done = 0;
    while done < total {
        if token.is_cancelled() {
            return None;
        }
        match engine.write_at(file, bytes.slice(done..), offset + done as u64).await {
            Ok(0) => {
                return Some(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "spill file write returned zero bytes",
                )))
            }
            Ok(n) => {
                done += n;
                if done < total {
                    trace!(done, total, "writer: partial write, continuing");
                }
            }
            Err(err) => return Some(Err(err)),
        }
    }
    Some(Ok(total))
}

fn buffer_written(weak: Weak<Shared>, token: CancellationToken, result: io::Result<usize>) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    let mut st = shared.state.lock();
    if token.is_cancelled() {
        return;
    }
    debug_assert_eq!(st.mode, Mode::InFile);
    debug_assert_eq!(st.spill_ref().writer_state, WriterState::Moving);

    match result {
        Ok(len) => {
            st.spill().written += len as i64;
            trace!(len, backlog = st.spill_ref().written, "writer: move complete");
            let (_buffer, guard) = state::pop_front(&shared, st);
            let Some(mut st) = guard else {
                return;
            };
            st.spill().writer_request = None;
            move_next_buffer(&shared, &mut st);
            st.verify_invariants();
        }
        Err(err) => {
            warn!(%err, "writer: spill file write failed");
            let errno = errno_of(&err);
            st.spill().writer_request = None;
            st.spill().writer_state = WriterState::Terminated;
            state::set_error(&shared, st, ChannelError::Write(errno));
        }
    }
}
