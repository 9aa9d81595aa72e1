//! Configuration for the sync engine and the remote executor.

use meshsync_protocol::{CompressAlgorithm, SecurityOption};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What a permission check is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionFlag {
    /// Sending local data to the device.
    Send,
    /// Accepting data from the device.
    Receive,
    /// Answering a remote query from the device.
    RemoteQuery,
}

/// Caller-supplied permission hook.
#[derive(Clone)]
pub struct PermissionChecker(Arc<dyn Fn(&str, PermissionFlag) -> bool + Send + Sync>);

impl PermissionChecker {
    /// Wraps a closure.
    pub fn new(check: impl Fn(&str, PermissionFlag) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(check))
    }

    /// Allows everything.
    pub fn allow_all() -> Self {
        Self::new(|_, _| true)
    }

    /// Runs the check.
    pub fn check(&self, device: &str, flag: PermissionFlag) -> bool {
        (self.0)(device, flag)
    }
}

impl fmt::Debug for PermissionChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PermissionChecker(..)")
    }
}

impl Default for PermissionChecker {
    fn default() -> Self {
        Self::allow_all()
    }
}

/// Caller-supplied hook telling whether a device can hold data of a given
/// security option.
#[derive(Clone)]
pub struct SecurityAbilityChecker(Arc<dyn Fn(&str, &SecurityOption) -> bool + Send + Sync>);

impl SecurityAbilityChecker {
    /// Wraps a closure.
    pub fn new(check: impl Fn(&str, &SecurityOption) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(check))
    }

    /// Trusts every device.
    pub fn allow_all() -> Self {
        Self::new(|_, _| true)
    }

    /// Runs the check.
    pub fn check(&self, device: &str, option: &SecurityOption) -> bool {
        (self.0)(device, option)
    }
}

impl fmt::Debug for SecurityAbilityChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecurityAbilityChecker(..)")
    }
}

impl Default for SecurityAbilityChecker {
    fn default() -> Self {
        Self::allow_all()
    }
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity of this device.
    pub local_device: String,
    /// Maximum pending tasks in the engine scheduler.
    pub scheduler_capacity: usize,
    /// Retries for manual sync tasks.
    pub manual_retry_times: u32,
    /// Retries for auto sync tasks.
    pub auto_retry_times: u32,
    /// Keep-alive period while saving received data.
    pub data_notify_interval: Duration,
    /// Keep-alive packets per save.
    pub max_data_notify_count: u32,
    /// Watchdog timeout used when the communicator reports none.
    pub default_timeout: Duration,
    /// Packets in flight for peers with sliding-window support.
    pub high_window_size: u32,
    /// Packets in flight for older peers.
    pub low_window_size: u32,
    /// Maximum entries per data packet.
    pub page_size: usize,
    /// Maximum bytes per data packet.
    pub data_block_size: usize,
    /// Security option announced during ability sync. `NotSet` defers to
    /// the store.
    pub security: SecurityOption,
    /// Compression algorithms this device offers. Empty defers to the store.
    pub compress_algorithms: Vec<CompressAlgorithm>,
    /// Permission hook.
    pub permission_checker: PermissionChecker,
    /// Device security ability hook, asked before accepting remote rows.
    pub security_ability_checker: SecurityAbilityChecker,
    /// Remote query limits.
    pub remote_executor: RemoteExecutorConfig,
}

impl SyncConfig {
    /// Creates a configuration for `local_device`.
    pub fn new(local_device: impl Into<String>) -> Self {
        Self {
            local_device: local_device.into(),
            scheduler_capacity: 4096,
            manual_retry_times: 1,
            auto_retry_times: 3,
            data_notify_interval: Duration::from_millis(3000),
            max_data_notify_count: 15,
            default_timeout: Duration::from_secs(5),
            high_window_size: 3,
            low_window_size: 1,
            page_size: 100,
            data_block_size: 1024 * 1024,
            security: SecurityOption::default(),
            compress_algorithms: Vec::new(),
            permission_checker: PermissionChecker::allow_all(),
            security_ability_checker: SecurityAbilityChecker::allow_all(),
            remote_executor: RemoteExecutorConfig::new(),
        }
    }

    /// Sets the scheduler capacity.
    pub fn with_scheduler_capacity(mut self, capacity: usize) -> Self {
        self.scheduler_capacity = capacity;
        self
    }

    /// Sets the retry budgets.
    pub fn with_retry_times(mut self, manual: u32, auto: u32) -> Self {
        self.manual_retry_times = manual;
        self.auto_retry_times = auto;
        self
    }

    /// Sets the keep-alive period and count.
    pub fn with_data_notify(mut self, interval: Duration, max_count: u32) -> Self {
        self.data_notify_interval = interval;
        self.max_data_notify_count = max_count;
        self
    }

    /// Sets the fallback watchdog timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the sliding-window sizes.
    pub fn with_window_sizes(mut self, high: u32, low: u32) -> Self {
        self.high_window_size = high.max(1);
        self.low_window_size = low.max(1);
        self
    }

    /// Sets the entries per data packet.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sets the local security option.
    pub fn with_security(mut self, security: SecurityOption) -> Self {
        self.security = security;
        self
    }

    /// Sets the offered compression algorithms.
    pub fn with_compress_algorithms(mut self, algorithms: Vec<CompressAlgorithm>) -> Self {
        self.compress_algorithms = algorithms;
        self
    }

    /// Sets the permission hook.
    pub fn with_permission_checker(mut self, checker: PermissionChecker) -> Self {
        self.permission_checker = checker;
        self
    }

    /// Sets the device security ability hook.
    pub fn with_security_ability_checker(mut self, checker: SecurityAbilityChecker) -> Self {
        self.security_ability_checker = checker;
        self
    }

    /// Sets the remote query limits.
    pub fn with_remote_executor(mut self, config: RemoteExecutorConfig) -> Self {
        self.remote_executor = config;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for remote query execution.
#[derive(Debug, Clone)]
pub struct RemoteExecutorConfig {
    /// Shortest accepted query timeout.
    pub min_timeout: Duration,
    /// Longest accepted query timeout.
    pub max_timeout: Duration,
    /// Queued tasks per device before the global overflow budget is used.
    pub max_task_per_device: usize,
    /// Concurrently working tasks per device, and concurrent inbound workers.
    pub max_task_execute: usize,
    /// Global overflow budget across devices.
    pub max_queue_count: usize,
    /// Timeout for sending one packet.
    pub send_timeout: Duration,
    /// Share of the MTU one response page may use, in percent.
    pub packet_budget_percent: usize,
}

impl RemoteExecutorConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            min_timeout: Duration::from_millis(5000),
            max_timeout: Duration::from_millis(60000),
            max_task_per_device: 5,
            max_task_execute: 2,
            max_queue_count: 10,
            send_timeout: Duration::from_millis(3000),
            packet_budget_percent: 90,
        }
    }

    /// Sets the accepted timeout range.
    pub fn with_timeout_range(mut self, min: Duration, max: Duration) -> Self {
        self.min_timeout = min;
        self.max_timeout = max;
        self
    }

    /// Sets the per-device and global caps.
    pub fn with_limits(mut self, per_device: usize, execute: usize, queue: usize) -> Self {
        self.max_task_per_device = per_device;
        self.max_task_execute = execute.max(1);
        self.max_queue_count = queue;
        self
    }

    /// Sets the per-packet send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Byte budget for one response page given the transport MTU.
    pub fn packet_budget(&self, mtu: usize) -> usize {
        mtu.saturating_mul(self.packet_budget_percent) / 100
    }
}

impl Default for RemoteExecutorConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("device-a")
            .with_retry_times(2, 5)
            .with_window_sizes(0, 0)
            .with_page_size(10)
            .with_default_timeout(Duration::from_secs(1));

        assert_eq!(config.local_device, "device-a");
        assert_eq!(config.manual_retry_times, 2);
        assert_eq!(config.auto_retry_times, 5);
        assert_eq!(config.high_window_size, 1);
        assert_eq!(config.low_window_size, 1);
        assert_eq!(config.page_size, 10);
        assert_eq!(config.default_timeout, Duration::from_secs(1));
    }

    #[test]
    fn default_notify_cadence() {
        let config = SyncConfig::default();
        assert_eq!(config.data_notify_interval, Duration::from_millis(3000));
        assert_eq!(config.max_data_notify_count, 15);
    }

    #[test]
    fn permission_checker_is_called() {
        let checker = PermissionChecker::new(|device, flag| {
            device == "trusted" || flag == PermissionFlag::Send
        });
        assert!(checker.check("trusted", PermissionFlag::Receive));
        assert!(checker.check("other", PermissionFlag::Send));
        assert!(!checker.check("other", PermissionFlag::RemoteQuery));
    }

    #[test]
    fn security_ability_checker_sees_device_and_option() {
        use meshsync_protocol::{SecurityFlag, SecurityLabel};
        let checker = SecurityAbilityChecker::new(|device, option| {
            device == "phone" && option.label != SecurityLabel::S4
        });
        assert!(checker.check("phone", &SecurityOption::new(SecurityLabel::S2, SecurityFlag::Ece)));
        assert!(!checker.check("phone", &SecurityOption::new(SecurityLabel::S4, SecurityFlag::Ece)));
        assert!(!checker.check("watch", &SecurityOption::default()));
    }

    #[test]
    fn remote_executor_budget() {
        let config = RemoteExecutorConfig::default();
        assert_eq!(config.packet_budget(1000), 900);
        assert_eq!(config.min_timeout, Duration::from_secs(5));
        assert_eq!(config.max_timeout, Duration::from_secs(60));
    }
}
