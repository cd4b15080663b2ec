//! Configuration settings for a file buffered channel.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// The default number of in-memory bytes beyond which buffered data spills
/// to disk.
pub const THRESHOLD_DEFAULT: u32 = 128 * 1024;

/// The default upper bound on the size of a single spill file read.
pub const READ_CHUNK_SIZE_DEFAULT: usize = 16 * 1024;

pub type SharedChannelConfig = Arc<ChannelConfig>;

/// Tuning knobs for a channel, shared across its reader and writer.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Directory in which spill files are created. Spill files are
    /// unlinked immediately after creation, so nothing in this directory
    /// outlives the channel.
    pub buffer_dir: PathBuf,
    /// Number of in-memory bytes beyond which buffered data spills to
    /// disk.
    pub threshold: u32,
    /// Delay before the spill file is created once the threshold has been
    /// passed. Zero disables the delay.
    pub delay_in_file_mode_switching: Duration,
    /// Switch back to in-memory buffering once the spill file has fully
    /// drained.
    pub auto_truncate_file: bool,
    /// Start moving buffers to the spill file as soon as they are fed.
    /// When disabled, movement only resumes after the previous move
    /// completes.
    pub auto_start_mover: bool,
    /// Upper bound on the size of a single read issued against the spill
    /// file.
    pub read_chunk_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from_path(env::temp_dir())
    }
}

impl ChannelConfig {
    /// Creates a config spilling into `path`. All remaining fields are
    /// assigned reasonable defaults until overridden.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self {
            buffer_dir: path.as_ref().to_owned(),
            threshold: THRESHOLD_DEFAULT,
            delay_in_file_mode_switching: Duration::ZERO,
            auto_truncate_file: true,
            auto_start_mover: true,
            read_chunk_size: READ_CHUNK_SIZE_DEFAULT,
        }
    }

    /// Overrides the default `threshold` field.
    pub fn threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Overrides the default `delay_in_file_mode_switching` field.
    pub fn delay_in_file_mode_switching(mut self, delay: Duration) -> Self {
        self.delay_in_file_mode_switching = delay;
        self
    }

    /// Overrides the default `auto_truncate_file` field.
    pub fn auto_truncate_file(mut self, enabled: bool) -> Self {
        self.auto_truncate_file = enabled;
        self
    }

    /// Overrides the default `auto_start_mover` field.
    pub fn auto_start_mover(mut self, enabled: bool) -> Self {
        self.auto_start_mover = enabled;
        self
    }

    /// Overrides the default `read_chunk_size` field.
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = ChannelConfig::default();
        assert_eq!(config.threshold, THRESHOLD_DEFAULT);
        assert_eq!(config.read_chunk_size, READ_CHUNK_SIZE_DEFAULT);
        assert!(config.auto_truncate_file);
        assert!(config.auto_start_mover);
        assert!(config.delay_in_file_mode_switching.is_zero());
    }

    #[test]
    fn builder_overrides_stick() {
        let config = ChannelConfig::from_path("/tmp/buffers")
            .threshold(16)
            .auto_truncate_file(false)
            .delay_in_file_mode_switching(Duration::from_millis(5));
        assert_eq!(config.buffer_dir, PathBuf::from("/tmp/buffers"));
        assert_eq!(config.threshold, 16);
        assert!(!config.auto_truncate_file);
        assert_eq!(config.delay_in_file_mode_switching, Duration::from_millis(5));
    }
}
