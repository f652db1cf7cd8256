use std::sync::OnceLock;

// -
// Registry namespace

/// Default root node of the registry key space (`/<root>/...`)
pub const DEFAULT_ROOT: &str = "dubbo";

pub const PATH_SEPARATOR: char = '/';

/// Scheme prefix used to turn a bare `host:port` into a store endpoint
pub const HTTP_KEY: &str = "http://";

pub const HTTP_SUBFIX_KEY: &str = "://";

// -
// Categories

pub const PROVIDERS_CATEGORY: &str = "providers";
pub const CONSUMERS_CATEGORY: &str = "consumers";
pub const ROUTERS_CATEGORY: &str = "routers";
pub const CONFIGURATORS_CATEGORY: &str = "configurators";

pub const DEFAULT_CATEGORY: &str = PROVIDERS_CATEGORY;

pub const ALL_CATEGORIES: [&str; 4] = [
    PROVIDERS_CATEGORY,
    CONSUMERS_CATEGORY,
    ROUTERS_CATEGORY,
    CONFIGURATORS_CATEGORY,
];

// -
// Address parameter keys

pub const INTERFACE_KEY: &str = "interface";
pub const GROUP_KEY: &str = "group";
pub const VERSION_KEY: &str = "version";
pub const CLASSIFIER_KEY: &str = "classifier";
pub const CATEGORY_KEY: &str = "category";
pub const ENABLED_KEY: &str = "enabled";
pub const CHECK_KEY: &str = "check";
pub const BACKUP_KEY: &str = "backup";
pub const SESSION_TIMEOUT_KEY: &str = "session-timeout";
pub const NOTIFY_MAXTHREADS_KEY: &str = "etcd3.notify.maxthreads";
pub const NOTIFY_QUEUES_KEY: &str = "etcd3.notify.queues";

pub const ANY_VALUE: &str = "*";
pub const REMOVE_VALUE_PREFIX: char = '-';
pub const COMMA_SEPARATOR: char = ',';

/// Protocol of the placeholder address delivered when a category has no match
pub const EMPTY_PROTOCOL: &str = "empty";

// -
// Timeouts and sizing

/// Session timeout in milliseconds; drives lease ttl and keepalive cadence
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 60 * 1000;

pub const DEFAULT_KEEPALIVE_TIMEOUT_MS: u64 = DEFAULT_SESSION_TIMEOUT_MS / 2;

pub const DEFAULT_MAX_KEEPALIVE_FAILURES: u32 = 2;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3000;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

/// Notification queue depth shared by all notify workers
pub const DEFAULT_NOTIFY_QUEUES: usize = 300_0000;

pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 100;

pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 5000;

/// I/O concurrency default: available cores + 1, capped at 32
pub fn default_io_threads() -> usize {
    static IO_THREADS: OnceLock<usize> = OnceLock::new();
    *IO_THREADS.get_or_init(|| {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cores + 1).min(32)
    })
}

/// Default number of notify workers, tied to the I/O concurrency default
pub fn default_notify_threads() -> usize {
    default_io_threads()
}
