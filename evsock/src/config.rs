//! Per-socket configuration.

use std::time::Duration;

use crate::{buf::DEFAULT_CAPACITY, timer::MIN_INTERVAL, transport::MsgFlags};

/// Backlog used by [`AsyncSocket::listen`](crate::AsyncSocket::listen).
pub const DEFAULT_BACKLOG: i32 = 65535;

/// Delay between the end of one accept/receive cycle and the next.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("receive buffer capacity must be at least one byte")]
  ZeroCapacity,
}

/// Tunables for an [`AsyncSocket`](crate::AsyncSocket).
///
/// ```rust
/// use std::time::Duration;
/// use evsock::SocketConfig;
///
/// let config = SocketConfig::builder()
///     .receive_interval(Duration::from_millis(5))
///     .receive_capacity(4096)
///     .build()
///     .unwrap();
/// assert_eq!(config.receive_capacity(), 4096);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
  listen_interval: Duration,
  receive_interval: Duration,
  receive_capacity: usize,
  receive_flags: MsgFlags,
  backlog: i32,
}

impl SocketConfig {
  pub fn builder() -> SocketConfigBuilder {
    SocketConfigBuilder { config: Self::default() }
  }

  pub fn listen_interval(&self) -> Duration {
    self.listen_interval
  }

  pub fn receive_interval(&self) -> Duration {
    self.receive_interval
  }

  pub fn receive_capacity(&self) -> usize {
    self.receive_capacity
  }

  pub fn receive_flags(&self) -> MsgFlags {
    self.receive_flags
  }

  pub fn backlog(&self) -> i32 {
    self.backlog
  }
}

impl Default for SocketConfig {
  fn default() -> Self {
    Self {
      listen_interval: DEFAULT_INTERVAL,
      receive_interval: DEFAULT_INTERVAL,
      receive_capacity: DEFAULT_CAPACITY,
      receive_flags: MsgFlags::NONE,
      backlog: DEFAULT_BACKLOG,
    }
  }
}

/// Builder for [`SocketConfig`]. Intervals below one millisecond are raised
/// to one millisecond.
#[derive(Debug, Clone)]
pub struct SocketConfigBuilder {
  config: SocketConfig,
}

impl SocketConfigBuilder {
  pub fn listen_interval(mut self, interval: Duration) -> Self {
    self.config.listen_interval = interval.max(MIN_INTERVAL);
    self
  }

  pub fn receive_interval(mut self, interval: Duration) -> Self {
    self.config.receive_interval = interval.max(MIN_INTERVAL);
    self
  }

  /// Sets both intervals.
  pub fn poll_interval(self, interval: Duration) -> Self {
    self.listen_interval(interval).receive_interval(interval)
  }

  pub fn receive_capacity(mut self, capacity: usize) -> Self {
    self.config.receive_capacity = capacity;
    self
  }

  pub fn receive_flags(mut self, flags: MsgFlags) -> Self {
    self.config.receive_flags = flags;
    self
  }

  pub fn backlog(mut self, backlog: i32) -> Self {
    self.config.backlog = backlog;
    self
  }

  pub fn build(self) -> Result<SocketConfig, ConfigError> {
    if self.config.receive_capacity == 0 {
      return Err(ConfigError::ZeroCapacity);
    }
    Ok(self.config)
  }
}
