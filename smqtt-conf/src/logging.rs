use std::str::FromStr;

use serde::Deserialize;

/// `[log]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub to: To,
    pub level: Level,
    pub dir: String,
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            to: To::Console,
            level: Level(slog::Level::Info),
            dir: "/var/log/smqtt".into(),
            file: "smqtt.log".into(),
        }
    }
}

impl Log {
    /// `dir` joined with `file`, empty when no file is configured
    pub fn filename(&self) -> String {
        match (self.dir.trim_end_matches(['/', '\\']), self.file.as_str()) {
            (_, "") => String::new(),
            ("", file) => file.to_owned(),
            (dir, file) => format!("{dir}/{file}"),
        }
    }
}

/// Where log records go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
    #[inline]
    pub fn off(&self) -> bool {
        *self == To::Off
    }
}

impl TryFrom<String> for To {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "off" => To::Off,
            "file" => To::File,
            "console" => To::Console,
            "both" => To::Both,
            _ => return Err(format!("unknown log target {:?}, expected off, file, console or both", s)),
        })
    }
}

/// Minimum record level, parsed the way slog names its levels (`info`, `warn`, `debug`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }

    #[inline]
    pub fn debug() -> Self {
        Level(slog::Level::Debug)
    }

    /// The matching filter for the `log` facade
    pub fn level_filter(&self) -> log::LevelFilter {
        match self.0 {
            slog::Level::Critical | slog::Level::Error => log::LevelFilter::Error,
            slog::Level::Warning => log::LevelFilter::Warn,
            slog::Level::Info => log::LevelFilter::Info,
            slog::Level::Debug => log::LevelFilter::Debug,
            slog::Level::Trace => log::LevelFilter::Trace,
        }
    }
}

impl TryFrom<String> for Level {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        slog::Level::from_str(&s).map(Level).map_err(|_| format!("unknown log level {:?}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Section {
        #[serde(default)]
        log: Log,
    }

    fn parse(text: &str) -> Result<Section, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    #[test]
    fn test_log_defaults() {
        let log = parse("").unwrap().log;
        assert_eq!(log.to, To::Console);
        assert_eq!(log.level.inner(), slog::Level::Info);
        assert_eq!(log.filename(), "/var/log/smqtt/smqtt.log");
    }

    #[test]
    fn test_log_section() {
        let log = parse("[log]\nto = \"Both\"\nlevel = \"debug\"\ndir = \"/tmp/\"\nfile = \"pub.log\"").unwrap().log;
        assert!(log.to.file() && log.to.console() && !log.to.off());
        assert_eq!(log.level.level_filter(), log::LevelFilter::Debug);
        assert_eq!(log.filename(), "/tmp/pub.log");

        assert!(parse("[log]\nto = \"syslog\"").is_err());
        assert!(parse("[log]\nlevel = \"loud\"").is_err());
    }

    #[test]
    fn test_filename() {
        let log = Log { dir: String::new(), file: "a.log".into(), ..Log::default() };
        assert_eq!(log.filename(), "a.log");
        let log = Log { file: String::new(), ..Log::default() };
        assert_eq!(log.filename(), "");
    }
}
