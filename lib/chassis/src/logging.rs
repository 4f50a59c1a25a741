pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the process root logger, writing to stderr at the supplied severity.
/// Valid levels are `trace`, `debug`, `info`, `warning`, `error` and
/// `critical`.
pub fn init(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("malformed logger config");

    config.build_logger().expect("logger construction failed")
}
