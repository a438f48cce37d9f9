use std::fs::{File, OpenOptions};
use std::io::{self, Write};

use anyhow::Result;
use slog::{o, Drain};
use slog_logfmt::Logfmt;

use smqtt_conf::logging::{Level, Log, To};

pub use slog::Logger;

/// Routes the `log` facade into an async logfmt drain configured by the `[log]` section.
///
/// The returned logger can be kept for structured logging, the facade holds its own clone.
pub fn logger_init(log: &Log) -> Result<Logger> {
    let logger = config_logger(log.filename(), log.to, log.level);
    log::set_boxed_logger(Box::new(Bridge(logger.clone())))
        .map_err(|e| anyhow::anyhow!("logger already initialized, {:?}", e))?;
    log::set_max_level(log.level.level_filter());
    Ok(logger)
}

/// `2024-05-01 10:00:00.000 INFO smqtt::session.120 | msg`
pub fn config_logger(filename: String, to: To, level: Level) -> Logger {
    let drain = Logfmt::new(Sink::new(filename, to))
        .set_prefix(|w: &mut dyn io::Write, rec: &slog::Record| -> slog::Result {
            write!(
                w,
                "{} {} {}.{} | {}\t",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                rec.level().as_short_str(),
                rec.module(),
                rec.line(),
                rec.msg(),
            )?;
            Ok(())
        })
        .build()
        .fuse()
        .filter_level(level.inner())
        .fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Logger::root(drain, o!())
}

struct Bridge(Logger);

impl log::Log for Bridge {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, r: &log::Record) {
        let location = slog::RecordLocation {
            file: r.file_static().unwrap_or("<unknown>"),
            line: r.line().unwrap_or_default(),
            column: 0,
            function: "",
            module: r.module_path_static().unwrap_or("<unknown>"),
        };
        let s = slog::RecordStatic { location: &location, level: slog_level(r.level()), tag: r.target() };
        self.0.log(&slog::Record::new(&s, r.args(), slog::b!()))
    }

    fn flush(&self) {}
}

fn slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Error => slog::Level::Error,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Info => slog::Level::Info,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Trace => slog::Level::Trace,
    }
}

/// Console and/or append-only file output, the file is opened on first write
struct Sink {
    to: To,
    filename: String,
    file: Option<File>,
}

impl Sink {
    fn new(filename: String, to: To) -> Self {
        Self { to, filename, file: None }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            self.file = Some(open_file(&self.filename)?);
        }
        self.file.as_mut().ok_or_else(|| io::Error::other("log file unavailable"))
    }

    fn each(&mut self, mut f: impl FnMut(&mut dyn Write) -> io::Result<()>) -> io::Result<()> {
        if self.to.console() {
            f(&mut io::stdout().lock())?;
        }
        if self.to.file() {
            f(self.file()?)?;
        }
        Ok(())
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.each(|w| w.write_all(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.each(|w| w.flush())
    }
}

fn open_file(filename: &str) -> io::Result<File> {
    if filename.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "log file is not configured"));
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| io::Error::new(e.kind(), format!("can not open log file {}, {}", filename, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_appends_to_file() {
        let filename = std::env::temp_dir().join(format!("smqtt-logger-{}.log", std::process::id()));
        let filename = filename.to_string_lossy().to_string();
        let _ = std::fs::remove_file(&filename);

        for line in ["first line\n", "second line\n"] {
            let mut sink = Sink::new(filename.clone(), To::File);
            sink.write_all(line.as_bytes()).unwrap();
            sink.flush().unwrap();
        }

        assert_eq!(std::fs::read_to_string(&filename).unwrap(), "first line\nsecond line\n");
        let _ = std::fs::remove_file(&filename);
    }

    #[test]
    fn test_sink_off_and_missing_file() {
        let mut sink = Sink::new(String::new(), To::Off);
        assert_eq!(sink.write(b"dropped").unwrap(), 7);
        sink.flush().unwrap();

        let mut sink = Sink::new(String::new(), To::File);
        assert!(sink.write(b"nowhere").is_err());
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(slog_level(log::Level::Warn), slog::Level::Warning);
        assert_eq!(slog_level(log::Level::Trace), slog::Level::Trace);
    }
}
