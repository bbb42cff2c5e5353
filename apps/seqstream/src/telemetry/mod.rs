pub mod logging {
    use clap::ValueEnum;
    use std::fs::{self, OpenOptions};
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;

    pub const FILTER_ENV: &str = "SEQSTREAM_LOG_FILTER";
    pub const TRACE_DEPS_ENV: &str = "SEQSTREAM_TRACE_DEPS";

    /// Targets that follow the requested level; everything else stays one
    /// notch quieter.
    const ENGINE_TARGETS: &[&str] = &["seqstream_core", "seqstream"];

    /// Chatty network crates, capped at `info` under `trace`.
    const NETWORK_TARGETS: &[&str] = &[
        "hyper",
        "hyper_util",
        "reqwest",
        "h2",
        "rustls",
        "tungstenite",
        "tokio_tungstenite",
        "mio",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        Warn,
        #[default]
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Long uploads usually log to a file next to their outputs; parent
        /// directories are created on demand.
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

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let level = LevelFilter::from(config.level);
        let (filter, capped) = match std::env::var(FILTER_ENV) {
            Ok(custom) => (custom, false),
            Err(_) => default_filter_for(level, dependency_traces_allowed()),
        };

        let (writer, guard) = open_writer(config.file.as_deref())?;
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(guard);

        if capped {
            tracing::debug!(
                target = "seqstream::telemetry",
                "network crates capped at info; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to override"
            );
        }
        Ok(())
    }

    fn open_writer(path: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
        let Some(path) = path else {
            return Ok(tracing_appender::non_blocking(std::io::stderr()));
        };
        let io_error = |source| InitError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_error)?;
        Ok(tracing_appender::non_blocking(file))
    }

    fn dependency_traces_allowed() -> bool {
        std::env::var(TRACE_DEPS_ENV).is_ok_and(|value| !value.is_empty() && value != "0")
    }

    /// Filter directives for `level`, and whether network crates were capped.
    pub(crate) fn default_filter_for(level: LevelFilter, allow_deps: bool) -> (String, bool) {
        let others = match level {
            LevelFilter::TRACE | LevelFilter::DEBUG => LevelFilter::INFO,
            LevelFilter::INFO => LevelFilter::WARN,
            quieter => quieter,
        };
        let mut directives = vec![others.to_string().to_ascii_lowercase()];
        if level > others {
            let level = level.to_string().to_ascii_lowercase();
            directives.extend(ENGINE_TARGETS.iter().map(|target| format!("{target}={level}")));
        }
        let capped = level == LevelFilter::TRACE && !allow_deps;
        if capped {
            directives.extend(NETWORK_TARGETS.iter().map(|target| format!("{target}=info")));
        }
        (directives.join(","), capped)
    }

}
