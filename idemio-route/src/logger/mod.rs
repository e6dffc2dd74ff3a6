use serde::{Deserialize, Serialize};
use std::panic::Location;

/// Log level selected per redelivery policy or per component. `OFF` disables the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoggingLevel {
    ERROR,
    WARN,
    INFO,
    #[default]
    DEBUG,
    TRACE,
    OFF,
}

impl LoggingLevel {
    pub fn to_level(self) -> Option<log::Level> {
        match self {
            LoggingLevel::ERROR => Some(log::Level::Error),
            LoggingLevel::WARN => Some(log::Level::Warn),
            LoggingLevel::INFO => Some(log::Level::Info),
            LoggingLevel::DEBUG => Some(log::Level::Debug),
            LoggingLevel::TRACE => Some(log::Level::Trace),
            LoggingLevel::OFF => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    Route,
    Processor,
    ErrorHandler,
    Advice,
    Endpoint,
    Config,
}

impl Component {
    fn target(self) -> &'static str {
        match self {
            Component::Route => "idemio_route::route",
            Component::Processor => "idemio_route::processor",
            Component::ErrorHandler => "idemio_route::errorhandler",
            Component::Advice => "idemio_route::advice",
            Component::Endpoint => "idemio_route::endpoint",
            Component::Config => "idemio_route::config",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LogEntry<'a> {
    timestamp: String,
    level: LoggingLevel,
    component: Component,
    exchange_id: Option<&'a str>,
    file: Option<&'a str>,
    line: Option<u32>,
    column: Option<u32>,
    message: &'a str,
}

impl<'a> LogEntry<'a> {
    pub fn new(
        level: LoggingLevel,
        component: Component,
        exchange_id: Option<&'a str>,
        message: &'a str,
        location: Option<&'a Location<'a>>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level,
            component,
            exchange_id,
            file: location.map(|l| l.file()),
            line: location.map(|l| l.line()),
            column: location.map(|l| l.column()),
            message,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or(String::from("Error serializing log entry"))
    }
}

/// Writes routing outcome messages at a configurable level, either as plain text or as
/// structured [`LogEntry`] JSON lines.
#[derive(Debug, Clone)]
pub struct RouteLogger {
    component: Component,
    structured: bool,
}

impl RouteLogger {
    pub fn new(component: Component) -> Self {
        Self {
            component,
            structured: false,
        }
    }

    pub fn structured(component: Component) -> Self {
        Self {
            component,
            structured: true,
        }
    }

    pub fn is_structured(&self) -> bool {
        self.structured
    }

    pub fn is_enabled(&self, level: LoggingLevel) -> bool {
        level
            .to_level()
            .map(|level| log::log_enabled!(target: self.component.target(), level))
            .unwrap_or(false)
    }

    #[track_caller]
    pub fn log(&self, level: LoggingLevel, exchange_id: Option<&str>, message: impl AsRef<str>) {
        let Some(log_level) = level.to_level() else {
            return;
        };
        let target = self.component.target();
        if !log::log_enabled!(target: target, log_level) {
            return;
        }
        let message = message.as_ref();
        if self.structured {
            let location = Location::caller();
            let entry = LogEntry::new(level, self.component, exchange_id, message, Some(location));
            log::log!(target: target, log_level, "{}", entry.to_json());
        } else {
            match exchange_id {
                Some(id) => log::log!(target: target, log_level, "[{}] {}", id, message),
                None => log::log!(target: target, log_level, "{}", message),
            }
        }
    }
}

/// Initialises the `log` facade from the `RUST_LOG` environment variable.
pub fn init() -> Result<(), log::SetLoggerError> {
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing_and_mapping() {
        let level: LoggingLevel = serde_json::from_str("\"WARN\"").unwrap();
        assert_eq!(level, LoggingLevel::WARN);
        assert_eq!(level.to_level(), Some(log::Level::Warn));
        assert_eq!(LoggingLevel::OFF.to_level(), None);
        assert_eq!(LoggingLevel::default(), LoggingLevel::DEBUG);
    }

    #[test]
    fn test_log_entry_serializes() {
        let entry = LogEntry::new(
            LoggingLevel::ERROR,
            Component::ErrorHandler,
            Some("ex-1"),
            "exhausted after 3 attempts",
            None,
        );
        let json: serde_json::Value = serde_json::from_str(&entry.to_json()).unwrap();
        assert_eq!(json["level"], "ERROR");
        assert_eq!(json["component"], "ErrorHandler");
        assert_eq!(json["exchange_id"], "ex-1");
        assert_eq!(json["message"], "exhausted after 3 attempts");
    }

    #[test]
    fn test_off_level_is_never_enabled() {
        let logger = RouteLogger::new(Component::Route);
        assert!(!logger.is_enabled(LoggingLevel::OFF));
        logger.log(LoggingLevel::OFF, None, "ignored");
    }
}
