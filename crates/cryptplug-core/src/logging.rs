//! Logger bootstrap for `cryptplug`.
//!
//! Module load, symbol and parameter diagnostics are emitted through `log`
//! under the `cryptplug_core` targets. Records suppressed by a handler's
//! quiet flag never reach the logger; everything else is filtered here.

use env_logger::Env;
use serde_json::json;
use std::env;
use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

pub const FORMAT_ENV: &str = "CRYPTPLUG_LOG_FORMAT";
pub const LEVEL_ENV: &str = "CRYPTPLUG_LOG_LEVEL";

/// Install the global logger once; later calls are no-ops.
///
/// `RUST_LOG` wins when set. Otherwise `CRYPTPLUG_LOG_LEVEL`, then
/// `default_level`. `CRYPTPLUG_LOG_FORMAT=plain` switches off JSON records.
pub fn init(default_level: &str) {
    let _ = INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let env = Env::default().default_filter_or(level);

    let format = env::var(FORMAT_ENV)
        .unwrap_or_else(|_| String::from("json"))
        .to_lowercase();

    let mut builder = env_logger::Builder::from_env(env);
    if format == "json" {
        builder.format(|buf, record| {
            let payload = json!({
                "timestamp": buf.timestamp().to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", payload)
        });
    } else {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} {} - {}",
                record.level().to_string().to_lowercase(),
                record.target(),
                record.args()
            )
        });
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {}", err);
    }
}
