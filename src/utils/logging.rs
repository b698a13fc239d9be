#[cfg(feature = "logging")]
use std::io::Write;

/// Loads `.env` and installs the `env_logger` backend. `RUST_LOG` wins over the default filter.
#[cfg(feature = "logging")]
pub fn init() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let timestamp = buf.timestamp_millis();
            let target = record.module_path().unwrap_or_default();
            let target = target.strip_prefix("movieserver::").unwrap_or(target);

            writeln!(
                buf,
                "[{} {:<5} {}:{}] {}",
                timestamp,
                record.level(),
                target,
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();
}

#[cfg(feature = "logging")]
pub fn flush() {
    log::logger().flush();
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        log::error!($($arg)*)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        log::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        log::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        log::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        log::trace!($($arg)*)
    };
}

/// `log_with_context!(warn, err, "walking {}", root)` logs at the given level with the
/// error's `Debug` form appended. The error is still consumed when logging is compiled out.
#[macro_export]
macro_rules! log_with_context {
    ($level:ident, $e:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        #[cfg(feature = "logging")]
        log::$level!(
            concat!($fmt, " - Error: {:?}"),
            $($arg,)*
            $e
        );
        #[cfg(not(feature = "logging"))]
        {
            let _ = &$e;
        }
    };
}
