use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of a bus's dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub published: u64,
    pub delivered: u64,
    pub unhandled: u64,
    pub slow: u64,
    pub very_slow: u64,
    pub panicked: u64,
    pub total_handler_ns: u64,
    pub max_handler_ns: u64,
}

impl DispatchStats {
    pub fn average_handler_time(&self) -> Duration {
        if self.delivered == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_handler_ns / self.delivered)
    }
}

#[derive(Debug, Default)]
pub(crate) struct DispatchCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    unhandled: AtomicU64,
    slow: AtomicU64,
    very_slow: AtomicU64,
    panicked: AtomicU64,
    total_handler_ns: AtomicU64,
    max_handler_ns: AtomicU64,
}

impl DispatchCounters {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unhandled(&self) {
        self.unhandled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_panic(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery(&self, elapsed: Option<Duration>) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if let Some(elapsed) = elapsed {
            let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
            self.total_handler_ns.fetch_add(nanos, Ordering::Relaxed);
            self.max_handler_ns.fetch_max(nanos, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_slow(&self, very_slow: bool) {
        self.slow.fetch_add(1, Ordering::Relaxed);
        if very_slow {
            self.very_slow.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            slow: self.slow.load(Ordering::Relaxed),
            very_slow: self.very_slow.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            total_handler_ns: self.total_handler_ns.load(Ordering::Relaxed),
            max_handler_ns: self.max_handler_ns.load(Ordering::Relaxed),
        }
    }
}

pub mod logging {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    pub const FILTER_ENV: &str = "MESSAGE_BUS_LOG_FILTER";

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    impl std::str::FromStr for LogLevel {
        type Err = String;

        fn from_str(value: &str) -> Result<Self, Self::Err> {
            match value.trim().to_ascii_lowercase().as_str() {
                "error" => Ok(LogLevel::Error),
                "warn" | "warning" => Ok(LogLevel::Warn),
                "info" => Ok(LogLevel::Info),
                "debug" => Ok(LogLevel::Debug),
                "trace" => Ok(LogLevel::Trace),
                other => Err(format!("unknown log level '{other}'")),
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global fmt subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }
        inner_init(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    fn inner_init(config: &LogConfig) -> Result<(), InitError> {
        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(build_env_filter(config.level))
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_names(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        Ok(())
    }

    fn build_env_filter(level: LogLevel) -> EnvFilter {
        match std::env::var(FILTER_ENV) {
            Ok(filter) => EnvFilter::new(filter),
            Err(_) => EnvFilter::new(default_filter_for(level)),
        }
    }

    pub(crate) fn default_filter_for(level: LogLevel) -> String {
        match level {
            LogLevel::Debug | LogLevel::Trace => {
                format!("warn,message_bus={0},bus_connector={0}", level.as_str())
            }
            other => other.as_str().to_owned(),
        }
    }
}
