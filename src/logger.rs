//! Structured logging, initialized per command invocation.
//!
//! A `log4rs`-based setup: a console appender plus a file appender scoped
//! under the catalog, `<catalog>/log/<instance>/backup.log`.

use std::path::Path;

/// Initialize logging to `<catalog_root>/log/<instance>/backup.log` plus stderr.
/// # Errors
/// Returns an error if the log directory cannot be created or the appender fails to build.
pub fn init_for_instance(catalog_root: &Path, instance: &str) -> Result<(), Box<dyn std::error::Error>> {
    use log::LevelFilter;
    use log4rs::append::console::ConsoleAppender;
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let log_dir = catalog_root.join("log").join(instance);
    std::fs::create_dir_all(&log_dir)?;
    let logfile_path = log_dir.join("backup.log");

    let pattern = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
    let file_appender =
        FileAppender::builder().encoder(Box::new(PatternEncoder::new(pattern))).build(logfile_path)?;
    let console_appender =
        ConsoleAppender::builder().encoder(Box::new(PatternEncoder::new(pattern))).build();

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .appender(Appender::builder().build("console", Box::new(console_appender)))
        .build(
            Root::builder()
                .appender("file")
                .appender("console")
                .build(LevelFilter::Info),
        )?;
    // Re-initializing is fine across repeated CLI invocations in-process; ignore the
    // "already initialized" error rather than treating it as fatal.
    let _ = log4rs::init_config(config);
    Ok(())
}

/// Minimal stderr-only logger, used by subcommands that do not yet operate against an
/// instance directory (e.g. `init`).
/// # Errors
/// Returns an error if the appender fails to build.
pub fn init_console_only() -> Result<(), Box<dyn std::error::Error>> {
    use log::LevelFilter;
    use log4rs::append::console::ConsoleAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let pattern = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
    let console_appender =
        ConsoleAppender::builder().encoder(Box::new(PatternEncoder::new(pattern))).build();
    let config = Config::builder()
        .appender(Appender::builder().build("console", Box::new(console_appender)))
        .build(Root::builder().appender("console").build(LevelFilter::Info))?;
    let _ = log4rs::init_config(config);
    Ok(())
}
