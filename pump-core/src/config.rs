use crate::poll::backend::BackendKind;
use std::time::Duration;

/// Default upper bound for one backend wait.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Default size of the per-transport read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Default size of the per-transport datagram buffer.
pub const DEFAULT_UDP_BUFFER_SIZE: usize = 65536;

/// Default `listen(2)` backlog.
pub const DEFAULT_LISTEN_BACKLOG: i32 = 1024;

/// Settings for one [`Service`](crate::service::Service).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    name: String,
    poll_timeout: Duration,
    backend: BackendKind,
    read_buffer_size: usize,
    udp_buffer_size: usize,
    listen_backlog: i32,
    task_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: format!("pump-{}", uuid::Uuid::new_v4()),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            backend: BackendKind::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            udp_buffer_size: DEFAULT_UDP_BUFFER_SIZE,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            task_wait: Duration::from_millis(10),
        }
    }
}

impl Config {
    #[must_use]
    pub fn get_name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn get_poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    #[must_use]
    pub fn get_backend(&self) -> BackendKind {
        self.backend
    }

    #[must_use]
    pub fn get_read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    #[must_use]
    pub fn get_udp_buffer_size(&self) -> usize {
        self.udp_buffer_size
    }

    #[must_use]
    pub fn get_listen_backlog(&self) -> i32 {
        self.listen_backlog
    }

    /// How long the task worker sleeps when its queue is empty.
    #[must_use]
    pub fn get_task_wait(&self) -> Duration {
        self.task_wait
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    /// A zero timeout turns the pollers into busy loops and is rejected.
    pub fn set_poll_timeout(&mut self, poll_timeout: Duration) -> &mut Self {
        if !poll_timeout.is_zero() {
            self.poll_timeout = poll_timeout;
        }
        self
    }

    pub fn set_backend(&mut self, backend: BackendKind) -> &mut Self {
        self.backend = backend;
        self
    }

    pub fn set_read_buffer_size(&mut self, size: usize) -> &mut Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn set_udp_buffer_size(&mut self, size: usize) -> &mut Self {
        self.udp_buffer_size = size.max(1);
        self
    }

    pub fn set_listen_backlog(&mut self, backlog: i32) -> &mut Self {
        self.listen_backlog = backlog.max(1);
        self
    }

    pub fn set_task_wait(&mut self, task_wait: Duration) -> &mut Self {
        if !task_wait.is_zero() {
            self.task_wait = task_wait;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters() {
        let mut config = Config::default();
        assert!(config.get_name().starts_with("pump-"));
        _ = config
            .set_name("svc")
            .set_poll_timeout(Duration::ZERO)
            .set_read_buffer_size(0)
            .set_listen_backlog(16);
        assert_eq!(config.get_name(), "svc");
        assert_eq!(config.get_poll_timeout(), DEFAULT_POLL_TIMEOUT);
        assert_eq!(config.get_read_buffer_size(), 1);
        assert_eq!(config.get_listen_backlog(), 16);
    }
}
