//! Splices a token module's option table into a clap command and routes the
//! parsed plugin options back through the handler.

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use cryptplug_core::{
    ArgKind, ArgValue, CoreArg, IncludeTable, OptionRow, PrivateArg, TokenHandler, TokenResult,
};
use log::debug;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Values collected from one plugin argument vector.
#[derive(Debug, Default)]
pub struct ParsedArgs {
    pub core: BTreeMap<&'static str, Value>,
    pub plugin: BTreeMap<String, ArgValue>,
}

impl ParsedArgs {
    pub fn to_json(&self, token_type: &str) -> Value {
        json!({
            "token": token_type,
            "core": self.core,
            "plugin": self.plugin,
        })
    }
}

fn action_for(kind: ArgKind) -> ArgAction {
    match kind {
        ArgKind::Flag => ArgAction::SetTrue,
        ArgKind::Value => ArgAction::Set,
    }
}

fn core_arg(arg: &'static CoreArg) -> Arg {
    let mut clap_arg = Arg::new(arg.name)
        .long(arg.name)
        .help(arg.description)
        .action(action_for(arg.kind));
    if let Some(short) = arg.short {
        clap_arg = clap_arg.short(short);
    }
    clap_arg
}

/// Build the parser for a token's argument vector: host arguments first,
/// then the module's private rows under the plugin heading.
///
/// Rows aliasing host arguments are already present and are not added twice;
/// a private row whose name is already taken is skipped.
pub fn command_for(core: &'static [CoreArg], include: Option<IncludeTable<'_, '_>>) -> Command {
    let mut cmd = Command::new("cryptplug-token")
        .no_binary_name(true)
        .disable_version_flag(true);
    for arg in core {
        cmd = cmd.arg(core_arg(arg));
    }

    let Some(IncludeTable {
        description,
        table: Some(table),
    }) = include
    else {
        return cmd;
    };

    let heading = description.trim_end_matches(':').to_string();
    for row in table.rows() {
        if let OptionRow::Private {
            long_name,
            kind,
            description,
            ..
        } = row
        {
            if cmd.get_arguments().any(|arg| arg.get_id() == long_name.as_str()) {
                debug!("Plugin option --{long_name} already defined, skipping.");
                continue;
            }
            cmd = cmd.arg(
                Arg::new(long_name.clone())
                    .long(long_name.clone())
                    .help(description.clone())
                    .help_heading(heading.clone())
                    .action(action_for(*kind)),
            );
        }
    }
    cmd
}

/// Parse `args` against the merged table and dispatch every plugin option.
pub fn parse_token_args(
    handler: &TokenHandler<'_>,
    core: &'static [CoreArg],
    args: &[String],
) -> Result<ParsedArgs> {
    let matches = command_for(core, handler.plugin_options())
        .try_get_matches_from(args)
        .context("invalid token arguments")?;
    collect(handler, core, &matches)
}

fn collect(
    handler: &TokenHandler<'_>,
    core: &'static [CoreArg],
    matches: &ArgMatches,
) -> Result<ParsedArgs> {
    let mut parsed = ParsedArgs::default();

    for arg in core {
        match arg.kind {
            ArgKind::Flag => {
                if matches.get_flag(arg.name) {
                    parsed.core.insert(arg.name, Value::Bool(true));
                }
            }
            ArgKind::Value => {
                if let Some(value) = matches.get_one::<String>(arg.name) {
                    parsed.core.insert(arg.name, Value::String(value.clone()));
                }
            }
        }
    }

    let Some(table) = handler.option_table() else {
        return Ok(parsed);
    };

    for row in table.rows() {
        let OptionRow::Private {
            long_name,
            kind,
            arg_index,
            ..
        } = row
        else {
            continue;
        };

        let raw = match kind {
            ArgKind::Flag if matches.get_flag(long_name) => None,
            ArgKind::Value => match matches.get_one::<String>(long_name) {
                Some(value) => Some(value.as_str()),
                None => continue,
            },
            ArgKind::Flag => continue,
        };

        let value = handler.dispatch(long_name, raw)?;
        if let Some(arg) = handler.private_args().get(*arg_index) {
            parsed.plugin.insert(arg.name.clone(), value);
        }
    }

    Ok(parsed)
}

/// Callback recorded in the plugin table; logs each accepted value.
pub fn trace_plugin_arg(
    handler: &TokenHandler<'_>,
    arg: &PrivateArg,
    value: &ArgValue,
) -> TokenResult<()> {
    debug!(
        "plugin {} argument {} ({}) = {:?}",
        handler.token_type().unwrap_or("?"),
        arg.name,
        arg.arg_type.as_str(),
        value
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_args::CORE_ARGS;
    use cryptplug_core::abi::{
        CryptTokenArgItem, SYMBOL_HANDLE_FREE, SYMBOL_HANDLE_INIT, SYMBOL_PARAMS,
    };
    use cryptplug_core::{ArgType, CoreArgTable, ModuleLoader, ParamList, TokenModule};
    use std::ffi::{c_int, c_void};
    use std::path::Path;
    use std::sync::OnceLock;

    fn fixture_list() -> &'static ParamList {
        static LIST: OnceLock<ParamList> = OnceLock::new();
        LIST.get_or_init(|| {
            ParamList::new(&[
                ("plugin-fido2-device", "FIDO2 device path", ArgType::String),
                ("plugin-fido2-pin-retries", "PIN retries", ArgType::UInt32),
                ("plugin-fido2-uv", "Require user verification", ArgType::Bool),
                ("token-id", "", ArgType::Int32),
            ])
            .unwrap()
        })
    }

    unsafe extern "C" fn params() -> *const CryptTokenArgItem {
        fixture_list().head()
    }
    unsafe extern "C" fn init(_cli: *mut c_void, _handle: *mut *mut c_void) -> c_int {
        0
    }
    unsafe extern "C" fn free(_handle: *mut c_void) {}

    struct Fido2Module;

    impl TokenModule for Fido2Module {
        fn symbol(&self, name: &str) -> std::result::Result<*mut c_void, String> {
            match name {
                SYMBOL_HANDLE_INIT => Ok(init as *mut c_void),
                SYMBOL_HANDLE_FREE => Ok(free as *mut c_void),
                SYMBOL_PARAMS => Ok(params as *mut c_void),
                other => Err(format!("undefined symbol: {other}")),
            }
        }
    }

    struct Fido2Loader;

    impl ModuleLoader for Fido2Loader {
        fn open(&self, _path: &Path) -> std::result::Result<Box<dyn TokenModule>, String> {
            Ok(Box::new(Fido2Module))
        }
    }

    fn repeated_list() -> &'static ParamList {
        static LIST: OnceLock<ParamList> = OnceLock::new();
        LIST.get_or_init(|| {
            ParamList::new(&[
                ("plugin-dup-path", "Token path", ArgType::String),
                ("plugin-dup-path", "Token path", ArgType::String),
            ])
            .unwrap()
        })
    }

    unsafe extern "C" fn repeated_params() -> *const CryptTokenArgItem {
        repeated_list().head()
    }

    struct RepeatedModule;

    impl TokenModule for RepeatedModule {
        fn symbol(&self, name: &str) -> std::result::Result<*mut c_void, String> {
            match name {
                SYMBOL_PARAMS => Ok(repeated_params as *mut c_void),
                other => Fido2Module.symbol(other),
            }
        }
    }

    struct RepeatedLoader;

    impl ModuleLoader for RepeatedLoader {
        fn open(&self, _path: &Path) -> std::result::Result<Box<dyn TokenModule>, String> {
            Ok(Box::new(RepeatedModule))
        }
    }

    fn handler() -> TokenHandler<'static> {
        let mut handler = TokenHandler::new();
        handler
            .load(
                &Fido2Loader,
                "fido2",
                CoreArgTable::new(CORE_ARGS),
                trace_plugin_arg,
                true,
            )
            .unwrap();
        handler
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn host_only_command_has_core_args() {
        let cmd = command_for(CORE_ARGS, None);
        let names: Vec<_> = cmd.get_arguments().map(|a| a.get_id().as_str()).collect();
        assert_eq!(names.len(), CORE_ARGS.len());
        assert!(names.contains(&"key-slot"));
    }

    #[test]
    fn plugin_rows_join_under_heading() {
        let handler = handler();
        let cmd = command_for(CORE_ARGS, handler.plugin_options());

        let device = cmd
            .get_arguments()
            .find(|a| a.get_id() == "plugin-fido2-device")
            .expect("plugin row");
        assert_eq!(device.get_help_heading(), Some("Plugins options"));
        // token-id is aliased, not duplicated
        assert_eq!(cmd.get_arguments().count(), CORE_ARGS.len() + 3);
    }

    #[test]
    fn parses_and_dispatches_plugin_values() {
        let handler = handler();
        let parsed = parse_token_args(
            &handler,
            CORE_ARGS,
            &args(&[
                "--plugin-fido2-device",
                "/dev/hidraw1",
                "--plugin-fido2-uv",
                "--token-id",
                "2",
                "-v",
            ]),
        )
        .unwrap();

        assert_eq!(
            parsed.plugin.get("device"),
            Some(&ArgValue::String("/dev/hidraw1".into()))
        );
        assert_eq!(parsed.plugin.get("uv"), Some(&ArgValue::Bool(true)));
        assert!(!parsed.plugin.contains_key("pin-retries"));
        assert_eq!(parsed.core.get("token-id"), Some(&Value::String("2".into())));
        assert_eq!(parsed.core.get("verbose"), Some(&Value::Bool(true)));

        let json = parsed.to_json("fido2");
        assert_eq!(json["plugin"]["device"], "/dev/hidraw1");
        assert_eq!(json["plugin"]["uv"], true);
    }

    #[test]
    fn bad_plugin_value_is_reported() {
        let handler = handler();
        let err = parse_token_args(
            &handler,
            CORE_ARGS,
            &args(&["--plugin-fido2-pin-retries", "lots"]),
        )
        .unwrap_err();
        let token_err = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<cryptplug_core::TokenError>())
            .expect("token error");
        assert_eq!(token_err.code(), "TK1501");
    }

    #[test]
    fn repeated_plugin_option_never_reaches_the_parser() {
        let mut handler = TokenHandler::new();
        let err = handler
            .load(
                &RepeatedLoader,
                "dup",
                CoreArgTable::new(CORE_ARGS),
                trace_plugin_arg,
                true,
            )
            .unwrap_err();
        assert_eq!(err.code(), "TK1300");
        assert!(handler.plugin_options().is_none());

        let cmd = command_for(CORE_ARGS, handler.plugin_options());
        assert_eq!(cmd.get_arguments().count(), CORE_ARGS.len());
        assert!(parse_token_args(&handler, CORE_ARGS, &args(&["--plugin-dup-path", "x"])).is_err());
    }

    #[test]
    fn unknown_option_is_a_parse_error() {
        let handler = handler();
        assert!(parse_token_args(&handler, CORE_ARGS, &args(&["--plugin-other-x"])).is_err());
    }
}
