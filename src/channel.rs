//! The single-slot channel fronting the data callback.
//!
//! A plain channel holds at most one outstanding delivery: nothing more
//! can be fed until the consumer acknowledges the previous buffer. The
//! file buffered machinery in the rest of this crate exists to lift that
//! restriction.

use crate::buffer::Buffer;
use crate::error::ChannelError;
use tracing::warn;

/// Delivery state of the single-slot channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No delivery outstanding; the next feed is handed to the consumer
    /// immediately.
    Idle,
    /// A buffer is with the data callback and not yet acknowledged.
    Calling,
    /// The end-of-stream sentinel is with the data callback and not yet
    /// acknowledged.
    CallingWithEofAck,
    /// Deliveries are paused until `start` is called.
    Stopped,
    /// The consumer acknowledged a delivery with `end = true`; no further
    /// input is accepted.
    EofReached,
    /// The consumer acknowledged the end-of-stream sentinel.
    EofAcked,
    /// The consumer acknowledged an error delivery.
    ErrorAcked,
}

/// Acknowledgement returned by the data callback.
///
/// A consumer that is done with the buffer before returning acknowledges
/// synchronously; one that applies backpressure returns [`Ack::Pending`]
/// and acknowledges later through `consumed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// `n` bytes were consumed; the channel may deliver again.
    Consumed(usize),
    /// `n` bytes were consumed and no further input will be accepted.
    ConsumedEnd(usize),
    /// The acknowledgement will arrive later via `consumed`.
    Pending,
}

/// The downstream consumer. Receives either a buffer (empty buffer marks
/// the end of the stream) or the terminal error, exactly once.
pub type DataCallback = Box<dyn FnMut(Result<Buffer, ChannelError>) -> Ack + Send>;

pub(crate) struct Channel {
    state: ChannelState,
    data_callback: Option<DataCallback>,
}

impl Channel {
    pub fn new() -> Self {
        Self {
            state: ChannelState::Idle,
            data_callback: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn set_data_callback(&mut self, callback: DataCallback) {
        self.data_callback = Some(callback);
    }

    /// Takes the callback out of its slot so it can be invoked with the
    /// state lock released.
    pub fn take_data_callback(&mut self) -> Option<DataCallback> {
        self.data_callback.take()
    }

    /// Puts a previously taken callback back, unless the slot was
    /// refilled in the meantime.
    pub fn restore_data_callback(&mut self, callback: Option<DataCallback>) {
        if let Some(callback) = callback {
            if self.data_callback.is_none() {
                self.data_callback = Some(callback);
            }
        }
    }

    /// Marks a buffer delivery as outstanding. Only legal when idle.
    pub fn begin_feed(&mut self, eos: bool) {
        debug_assert_eq!(self.state, ChannelState::Idle);
        self.state = if eos {
            ChannelState::CallingWithEofAck
        } else {
            ChannelState::Calling
        };
    }

    /// Marks an error delivery as outstanding. Only legal when idle.
    pub fn begin_error(&mut self) {
        debug_assert_eq!(self.state, ChannelState::Idle);
        self.state = ChannelState::Calling;
    }

    /// Applies a synchronous acknowledgement returned by the data
    /// callback.
    pub fn apply_ack(&mut self, ack: Ack) {
        match ack {
            Ack::Pending => {}
            Ack::Consumed(n) => {
                self.consumed(n, false);
            }
            Ack::ConsumedEnd(n) => {
                self.consumed(n, true);
            }
        }
    }

    /// Acknowledges the outstanding delivery. Returns true if the channel
    /// state changed, in which case the caller must run its rearm logic.
    pub fn consumed(&mut self, _size: usize, end: bool) -> bool {
        match self.state {
            ChannelState::Calling => {
                self.state = if end {
                    ChannelState::EofReached
                } else {
                    ChannelState::Idle
                };
                true
            }
            ChannelState::CallingWithEofAck => {
                self.state = ChannelState::EofAcked;
                true
            }
            _ => {
                warn!(state = ?self.state, "consumed() with no outstanding delivery");
                false
            }
        }
    }

    pub fn error_acked(&mut self) {
        self.state = ChannelState::ErrorAcked;
    }

    pub fn stop(&mut self) {
        if self.state == ChannelState::Idle {
            self.state = ChannelState::Stopped;
        }
    }

    /// Returns true if the channel became idle again.
    pub fn start(&mut self) -> bool {
        if self.state == ChannelState::Stopped {
            self.state = ChannelState::Idle;
            true
        } else {
            false
        }
    }

    pub fn is_started(&self) -> bool {
        self.state != ChannelState::Stopped
    }

    pub fn accepting_input(&self) -> bool {
        self.state == ChannelState::Idle
    }

    /// Whether the channel is busy now but will accept input once the
    /// outstanding delivery is acknowledged or deliveries are restarted.
    pub fn may_accept_input_later(&self) -> bool {
        matches!(
            self.state,
            ChannelState::Calling | ChannelState::CallingWithEofAck | ChannelState::Stopped
        )
    }

    pub fn is_idle(&self) -> bool {
        self.state == ChannelState::Idle
    }

    pub fn ended(&self) -> bool {
        matches!(
            self.state,
            ChannelState::EofReached | ChannelState::EofAcked | ChannelState::ErrorAcked
        )
    }

    pub fn end_acked(&self) -> bool {
        matches!(self.state, ChannelState::EofAcked | ChannelState::ErrorAcked)
    }

    /// Resets delivery state. Installed callbacks are kept.
    pub fn reset(&mut self) {
        self.state = ChannelState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_and_sync_ack_round_trip() {
        let mut channel = Channel::new();
        assert!(channel.accepting_input());

        channel.begin_feed(false);
        assert_eq!(channel.state(), ChannelState::Calling);
        assert!(channel.may_accept_input_later());

        channel.apply_ack(Ack::Consumed(5));
        assert!(channel.is_idle());
    }

    #[test]
    fn eof_ack_terminates() {
        let mut channel = Channel::new();
        channel.begin_feed(true);
        assert_eq!(channel.state(), ChannelState::CallingWithEofAck);
        assert!(!channel.ended());

        assert!(channel.consumed(0, false));
        assert_eq!(channel.state(), ChannelState::EofAcked);
        assert!(channel.ended());
        assert!(channel.end_acked());
    }

    #[test]
    fn consumer_can_refuse_further_input() {
        let mut channel = Channel::new();
        channel.begin_feed(false);
        channel.apply_ack(Ack::ConsumedEnd(3));
        assert_eq!(channel.state(), ChannelState::EofReached);
        assert!(channel.ended());
        assert!(!channel.end_acked());
        assert!(!channel.may_accept_input_later());
    }

    #[test]
    fn stop_gates_idle_and_start_releases() {
        let mut channel = Channel::new();
        channel.stop();
        assert!(!channel.is_started());
        assert!(!channel.accepting_input());
        assert!(channel.may_accept_input_later());

        assert!(channel.start());
        assert!(channel.is_started());
        assert!(channel.accepting_input());
    }

    #[test]
    fn stray_ack_is_ignored() {
        let mut channel = Channel::new();
        assert!(!channel.consumed(10, false));
        assert!(channel.is_idle());
    }
}
