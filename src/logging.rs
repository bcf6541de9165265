//! 日志初始化
//!
//! 桌面 / 测试环境走 tracing-subscriber；`android` feature 下输出到 logcat。

use crate::config::LogConfig;

/// Install the global logger. Safe to call more than once; later calls are ignored.
pub fn init_logging(config: &LogConfig) {
    #[cfg(feature = "android")]
    {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(level_filter(&config.level))
                .with_tag("tunvisor"),
        );
    }

    #[cfg(not(feature = "android"))]
    {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

pub fn level_filter(level: &str) -> log::LevelFilter {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" | "none" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}
