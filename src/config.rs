//! Assembler Configuration
//!
//! Construction-time options for the reassembly engine. A zero value in any
//! field means "use the default"; inconsistent combinations are rejected
//! when the assembler is built.

use std::time::Duration;

use crate::errors::AssemblyError;

/// Options recognized by [`crate::Assembler::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblerConfig {
    /// Hard cap on buffered pages across all connections (default 50 000).
    pub max_buffered_pages_total: usize,
    /// Cap on buffered pages per half-connection (default 1 000).
    pub max_buffered_pages_per_connection: usize,
    /// Cap on live connections in the table (default 100 000).
    pub max_connections: usize,
    /// Idle age past which a half-connection is flushed (default 2 minutes).
    pub connection_timeout: Duration,
    /// Cadence of the background flush sweep (default 10 seconds).
    pub flush_interval: Duration,
    /// Bytes per page buffer (default 1900, covering most MTU payloads).
    pub page_size: usize,
    /// Minimum interval between page-pool evictions (default 30 seconds).
    pub eviction_period: Duration,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            max_buffered_pages_total: 50_000,
            max_buffered_pages_per_connection: 1_000,
            max_connections: 100_000,
            connection_timeout: Duration::from_secs(120),
            flush_interval: Duration::from_secs(10),
            page_size: 1900,
            eviction_period: Duration::from_secs(30),
        }
    }
}

impl AssemblerConfig {
    pub fn with_max_buffered_pages_total(mut self, max: usize) -> Self {
        self.max_buffered_pages_total = max;
        self
    }

    pub fn with_max_buffered_pages_per_connection(mut self, max: usize) -> Self {
        self.max_buffered_pages_per_connection = max;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_eviction_period(mut self, period: Duration) -> Self {
        self.eviction_period = period;
        self
    }

    /// Replace zero fields with their defaults and reject inconsistent
    /// combinations.
    pub fn validated(mut self) -> Result<Self, AssemblyError> {
        let defaults = Self::default();

        if self.max_buffered_pages_total == 0 {
            self.max_buffered_pages_total = defaults.max_buffered_pages_total;
        }
        if self.max_buffered_pages_per_connection == 0 {
            self.max_buffered_pages_per_connection = defaults.max_buffered_pages_per_connection;
        }
        if self.max_connections == 0 {
            self.max_connections = defaults.max_connections;
        }
        if self.connection_timeout.is_zero() {
            self.connection_timeout = defaults.connection_timeout;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = defaults.flush_interval;
        }
        if self.page_size == 0 {
            self.page_size = defaults.page_size;
        }
        if self.eviction_period.is_zero() {
            self.eviction_period = defaults.eviction_period;
        }

        if self.flush_interval > self.connection_timeout {
            return Err(AssemblyError::InvalidOptions(format!(
                "flush interval {:?} exceeds connection timeout {:?}",
                self.flush_interval, self.connection_timeout
            )));
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AssemblerConfig::default();

        assert_eq!(config.max_buffered_pages_total, 50_000);
        assert_eq!(config.max_buffered_pages_per_connection, 1_000);
        assert_eq!(config.max_connections, 100_000);
        assert_eq!(config.connection_timeout, Duration::from_secs(120));
        assert_eq!(config.flush_interval, Duration::from_secs(10));
        assert_eq!(config.page_size, 1900);
        assert_eq!(config.eviction_period, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_means_default() {
        let config = AssemblerConfig::default()
            .with_page_size(0)
            .with_max_connections(0)
            .with_flush_interval(Duration::ZERO)
            .validated()
            .unwrap();

        assert_eq!(config.page_size, 1900);
        assert_eq!(config.max_connections, 100_000);
        assert_eq!(config.flush_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_explicit_values_kept() {
        let config = AssemblerConfig::default()
            .with_max_buffered_pages_total(2)
            .with_page_size(4)
            .validated()
            .unwrap();

        assert_eq!(config.max_buffered_pages_total, 2);
        assert_eq!(config.page_size, 4);
        // Untouched fields keep their defaults.
        assert_eq!(config.max_buffered_pages_per_connection, 1_000);
    }

    #[test]
    fn test_flush_interval_past_timeout_rejected() {
        let result = AssemblerConfig::default()
            .with_connection_timeout(Duration::from_secs(5))
            .with_flush_interval(Duration::from_secs(10))
            .validated();

        assert!(matches!(result, Err(AssemblyError::InvalidOptions(_))));
    }
}
