//! `env_logger` setup, with a custom JSON formatter for `--machine-readable`.

use log::LevelFilter;
use std::io::Write;

pub fn init(log_level: &str, machine_readable: bool) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(parse_level(log_level));

    if machine_readable {
        builder.format(|buf, record| {
            let line = serde_json::json!({
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{line}")
        });
    } else {
        builder.format_timestamp_millis();
    }
    builder.init();
}

fn parse_level(level: &str) -> LevelFilter {
    match level {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        // Carried over from the original's zerolog levels, which `log` has
        // no direct equivalent for.
        "fatal" => LevelFilter::Error,
        "panic" => LevelFilter::Off,
        other => {
            eprintln!("unknown log level `{other}`, defaulting to warn");
            LevelFilter::Warn
        }
    }
}
