use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn label(self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

pub fn parse_level(raw: &str) -> Option<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::Trace),
        "debug" => Some(Level::Debug),
        "1" | "info" => Some(Level::Info),
        "warn" | "warning" => Some(Level::Warn),
        "error" => Some(Level::Error),
        _ => None,
    }
}

// None means logging is off.
fn threshold() -> Option<Level> {
    static THRESHOLD: OnceLock<Option<Level>> = OnceLock::new();
    *THRESHOLD.get_or_init(|| {
        std::env::var("EDGESIM_LOG")
            .ok()
            .and_then(|raw| parse_level(&raw))
    })
}

pub fn enabled(level: Level) -> bool {
    threshold().is_some_and(|min| level >= min)
}

pub fn log(level: Level, message: &str) {
    if enabled(level) {
        eprintln!("[{}] {message}", level.label());
    }
}

pub fn debug(message: &str) {
    log(Level::Debug, message);
}

pub fn info(message: &str) {
    log(Level::Info, message);
}

pub fn warn(message: &str) {
    log(Level::Warn, message);
}

pub fn error(message: &str) {
    log(Level::Error, message);
}

#[cfg(test)]
mod tests {
    use super::{Level, parse_level};

    #[test]
    fn one_enables_info() {
        assert_eq!(parse_level("1"), Some(Level::Info));
        assert_eq!(parse_level(" WARNING "), Some(Level::Warn));
        assert_eq!(parse_level("verbose"), None);
    }
}
