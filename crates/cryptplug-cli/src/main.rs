//! `cryptplug`: load external crypto-token modules and expose their options.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cryptplug_core::{
    logging, ArgKind, CoreArgTable, HandlerState, OptionRow, PluginConfig, TokenError,
    TokenHandler,
};
use log::warn;
use schemars::schema_for;
use serde_json::{json, to_string_pretty};
use std::path::{Path, PathBuf};

mod core_args;
mod plugin_args;

use core_args::CORE_ARGS;
use plugin_args::{parse_token_args, trace_plugin_arg};

const DEFAULT_CONFIG_PATH: &str = "/etc/cryptplug.toml";

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "cryptplug",
    version,
    about = "Load external crypto-token modules and splice their options into the CLI."
)]
struct Cli {
    /// Path to the configuration file (ignored when missing).
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Do not log load and validation failures.
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load token modules and print their merged option tables.
    Inspect {
        /// Token type; defaults to every entry in tokens.preload.
        token_type: Option<String>,

        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Parse an argument vector against a token module's options.
    Args {
        /// Token type providing the plugin options.
        token_type: String,

        /// Arguments to parse, e.g. `--plugin-fido2-device /dev/hidraw0`.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Validate a configuration file.
    Validate {
        #[arg(short = 'f', long, default_value = DEFAULT_CONFIG_PATH)]
        file: PathBuf,
    },

    /// Print the configuration JSON schema.
    Schema,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        let code = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<TokenError>())
            .map(TokenError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    logging::init("warn");
    let cli = Cli::parse();

    match cli.command {
        Commands::Schema => {
            let schema = schema_for!(PluginConfig);
            println!("{}", to_string_pretty(&schema)?);
        }
        Commands::Validate { file } => {
            let cfg = PluginConfig::load(&file)
                .with_context(|| format!("failed to load configuration from {}", file.display()))?;
            let issues = cfg.validate();
            if issues.is_empty() {
                println!(
                    "Configuration valid ({} preloaded token types).",
                    cfg.tokens.preload.len()
                );
            } else {
                eprintln!("Configuration validation failed:");
                for issue in issues {
                    eprintln!("  - {issue}");
                }
                std::process::exit(1);
            }
        }
        Commands::Inspect { token_type, json } => {
            let config = load_config(&cli.config)?;
            let quiet = cli.quiet || config.loader.quiet;
            let types = match token_type {
                Some(token_type) => vec![token_type],
                None if config.tokens.preload.is_empty() => {
                    bail!("no token type given and tokens.preload is empty")
                }
                None => config.tokens.preload.clone(),
            };

            let loader = config.dylib_loader();
            let mut reports = Vec::new();
            for token_type in &types {
                let mut handler = TokenHandler::new();
                handler
                    .load(
                        &loader,
                        token_type,
                        CoreArgTable::new(CORE_ARGS),
                        trace_plugin_arg,
                        quiet,
                    )
                    .with_context(|| format!("failed to load token module `{token_type}`"))?;
                if json {
                    reports.push(handler_json(&handler));
                } else {
                    print_handler(&handler);
                }
                handler.unload();
            }
            if json {
                println!("{}", to_string_pretty(&reports)?);
            }
        }
        Commands::Args { token_type, args } => {
            let config = load_config(&cli.config)?;
            let quiet = cli.quiet || config.loader.quiet;
            let loader = config.dylib_loader();

            let mut handler = TokenHandler::new();
            handler
                .load(
                    &loader,
                    &token_type,
                    CoreArgTable::new(CORE_ARGS),
                    trace_plugin_arg,
                    quiet,
                )
                .with_context(|| format!("failed to load token module `{token_type}`"))?;
            if handler.state() != HandlerState::Configured {
                bail!("token module `{token_type}` is not configured");
            }

            let parsed = parse_token_args(&handler, CORE_ARGS, &args)?;
            println!("{}", to_string_pretty(&parsed.to_json(&token_type))?);
            handler.unload();
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<PluginConfig> {
    let config = PluginConfig::load_or_default(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    for issue in config.validate() {
        warn!("configuration: {issue}");
    }
    Ok(config)
}

fn print_handler(handler: &TokenHandler<'_>) {
    let caps = handler.capabilities();
    println!(
        "Token module {} ({} arguments, {} private)",
        handler.token_type().unwrap_or("?"),
        handler.args_count(),
        handler.private_args_count()
    );
    println!(
        "  entry points: validate-create={} create={} validate-remove={} remove={}",
        yes_no(caps.validate_create_params),
        yes_no(caps.create),
        yes_no(caps.validate_remove_params),
        yes_no(caps.remove)
    );

    let Some(include) = handler.plugin_options() else {
        return;
    };
    let Some(table) = include.table else {
        println!("  no plugin options");
        return;
    };

    println!("{}", include.description);
    for row in table.rows() {
        match row {
            OptionRow::Private {
                long_name,
                kind,
                description,
                arg_index,
            } => {
                let ty = handler
                    .private_args()
                    .get(*arg_index)
                    .map(|arg| arg.arg_type.as_str())
                    .unwrap_or("?");
                println!(
                    "  --{:<32} {:<8} {}",
                    format!("{long_name}{}", value_hint(*kind)),
                    ty,
                    description
                );
            }
            OptionRow::Core { index, arg } => {
                println!(
                    "  --{:<32} {:<8} (core argument #{index})",
                    format!("{}{}", arg.name, value_hint(arg.kind)),
                    "",
                );
            }
            OptionRow::Callback { .. } | OptionRow::End => {}
        }
    }
}

fn handler_json(handler: &TokenHandler<'_>) -> serde_json::Value {
    let rows: Vec<_> = handler
        .option_table()
        .map(|table| {
            table
                .rows()
                .iter()
                .map(|row| match row {
                    OptionRow::Callback { token_type, .. } => {
                        json!({ "row": "callback", "token": token_type })
                    }
                    OptionRow::Core { index, arg } => {
                        json!({ "row": "core", "name": arg.name, "index": index, "kind": arg.kind })
                    }
                    OptionRow::Private {
                        long_name,
                        kind,
                        description,
                        arg_index,
                    } => json!({
                        "row": "private",
                        "name": long_name,
                        "kind": kind,
                        "description": description,
                        "arg": handler.private_args().get(*arg_index),
                    }),
                    OptionRow::End => json!({ "row": "end" }),
                })
                .collect()
        })
        .unwrap_or_default();

    json!({
        "token": handler.token_type(),
        "state": handler.state(),
        "args_count": handler.args_count(),
        "private_args_count": handler.private_args_count(),
        "capabilities": handler.capabilities(),
        "options": rows,
    })
}

fn value_hint(kind: ArgKind) -> &'static str {
    match kind {
        ArgKind::Flag => "",
        ArgKind::Value => " <VALUE>",
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}
