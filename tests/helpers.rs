use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use spillway::engine::{DiskEngine, IoEngine, SpillFile};
use spillway::{Ack, ChannelConfig, ChannelError, DataCallback, SharedChannelConfig};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

/// Everything a consumer observed, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Data(Vec<u8>),
    Eof,
    Error(ChannelError),
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

pub fn new_event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(events: &EventLog, payload: &Result<spillway::Buffer, ChannelError>) {
    let event = match payload {
        Ok(buffer) if buffer.is_eos() => Event::Eof,
        Ok(buffer) => Event::Data(buffer.to_vec()),
        Err(err) => Event::Error(*err),
    };
    events.lock().push(event);
}

/// A consumer that acknowledges every delivery before returning.
pub fn sync_consumer(events: &EventLog) -> DataCallback {
    let events = events.clone();
    Box::new(move |payload| {
        record(&events, &payload);
        match payload {
            Ok(buffer) => Ack::Consumed(buffer.len()),
            Err(_) => Ack::Pending,
        }
    })
}

/// A consumer that records deliveries but never acknowledges them; the
/// test drives acknowledgements through `consumed`.
pub fn manual_consumer(events: &EventLog) -> DataCallback {
    let events = events.clone();
    Box::new(move |payload| {
        record(&events, &payload);
        Ack::Pending
    })
}

/// Concatenation of all data payloads observed so far.
pub fn received_bytes(events: &EventLog) -> Vec<u8> {
    let mut bytes = Vec::new();
    for event in events.lock().iter() {
        if let Event::Data(data) = event {
            bytes.extend_from_slice(data);
        }
    }
    bytes
}

pub fn config_with_threshold(dir: &TempDir, threshold: u32) -> SharedChannelConfig {
    Arc::new(ChannelConfig::from_path(dir.path()).threshold(threshold))
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let result = timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    result.unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Engine whose writes always fail with the given OS error. Everything
/// else hits the real filesystem.
pub struct FailingWrites {
    inner: DiskEngine,
    errno: i32,
}

impl FailingWrites {
    pub fn new(errno: i32) -> Self {
        Self {
            inner: DiskEngine,
            errno,
        }
    }
}

#[async_trait]
impl IoEngine for FailingWrites {
    async fn create(&self, path: &Path) -> io::Result<SpillFile> {
        self.inner.create(path).await
    }

    async fn write_at(&self, _file: &SpillFile, _buf: Bytes, _offset: u64) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(self.errno))
    }

    async fn read_at(&self, file: &SpillFile, len: usize, offset: u64) -> io::Result<Bytes> {
        self.inner.read_at(file, len, offset).await
    }

    async fn unlink(&self, path: &Path) -> io::Result<()> {
        self.inner.unlink(path).await
    }
}

/// Engine that delays every write, keeping the mover busy long enough for
/// tests to observe the reader running ahead of it.
pub struct SlowWrites {
    inner: DiskEngine,
    delay: Duration,
}

impl SlowWrites {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: DiskEngine,
            delay,
        }
    }
}

#[async_trait]
impl IoEngine for SlowWrites {
    async fn create(&self, path: &Path) -> io::Result<SpillFile> {
        self.inner.create(path).await
    }

    async fn write_at(&self, file: &SpillFile, buf: Bytes, offset: u64) -> io::Result<usize> {
        sleep(self.delay).await;
        self.inner.write_at(file, buf, offset).await
    }

    async fn read_at(&self, file: &SpillFile, len: usize, offset: u64) -> io::Result<Bytes> {
        self.inner.read_at(file, len, offset).await
    }

    async fn unlink(&self, path: &Path) -> io::Result<()> {
        self.inner.unlink(path).await
    }
}
