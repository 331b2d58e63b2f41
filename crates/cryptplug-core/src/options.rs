//! Merged command-line option table for a loaded token module.
//!
//! The table starts with a callback row, holds one row per declared
//! parameter and ends with a sentinel. Rows for core-shared parameters
//! borrow the host's own argument rows; rows for private parameters are
//! owned by the table.

use crate::abi::ArgType;
use crate::error::{ParamViolation, TokenError, TokenResult};
use crate::handler::TokenHandler;
use crate::params::{classify, ArgKind, CoreArg, CoreArgTable, DeclaredParam, ParamClass, ParamCounts};
use crate::value::ArgValue;
use log::debug;
use serde::Serialize;
use std::fmt;

/// Heading of the include row that splices a plugin table into the host's.
pub const PLUGIN_OPTIONS_TITLE: &str = "Plugins options:";

/// Invoked for every private option parsed on the command line.
pub type PluginCallback = fn(&TokenHandler<'_>, &PrivateArg, &ArgValue) -> TokenResult<()>;

/// A module-private argument as seen by the module's entry points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrivateArg {
    /// Parameter name without the `plugin-<type>-` prefix.
    pub name: String,
    pub arg_type: ArgType,
}

/// One row of the merged option table.
#[derive(Clone)]
pub enum OptionRow<'host> {
    /// Leading row routing parsed private options to the callback.
    Callback {
        callback: PluginCallback,
        token_type: String,
    },
    /// Alias of a host argument row.
    Core { index: usize, arg: &'host CoreArg },
    /// Row built for a module-private parameter.
    Private {
        long_name: String,
        kind: ArgKind,
        description: String,
        arg_index: usize,
    },
    /// Table terminator.
    End,
}

impl fmt::Debug for OptionRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionRow::Callback { token_type, .. } => f
                .debug_struct("Callback")
                .field("token_type", token_type)
                .finish_non_exhaustive(),
            OptionRow::Core { index, arg } => f
                .debug_struct("Core")
                .field("index", index)
                .field("name", &arg.name)
                .finish(),
            OptionRow::Private {
                long_name,
                kind,
                description,
                arg_index,
            } => f
                .debug_struct("Private")
                .field("long_name", long_name)
                .field("kind", kind)
                .field("description", description)
                .field("arg_index", arg_index)
                .finish(),
            OptionRow::End => f.write_str("End"),
        }
    }
}

/// Backbone of the merged option table.
#[derive(Debug, Clone)]
pub struct OptionTable<'host> {
    rows: Vec<OptionRow<'host>>,
}

impl<'host> OptionTable<'host> {
    pub fn rows(&self) -> &[OptionRow<'host>] {
        &self.rows
    }

    /// Callback recorded in the leading row.
    pub fn callback(&self) -> Option<PluginCallback> {
        match self.rows.first() {
            Some(OptionRow::Callback { callback, .. }) => Some(*callback),
            _ => None,
        }
    }

    /// Index into the private argument array for the row named `long_name`.
    pub fn private_index(&self, long_name: &str) -> Option<usize> {
        self.rows.iter().find_map(|row| match row {
            OptionRow::Private {
                long_name: name,
                arg_index,
                ..
            } if name == long_name => Some(*arg_index),
            _ => None,
        })
    }
}

/// Fragment handed to the host parser: an include row for the plugin table.
#[derive(Debug, Clone, Copy)]
pub struct IncludeTable<'a, 'host> {
    pub description: &'static str,
    pub table: Option<&'a OptionTable<'host>>,
}

/// Materialise the option table and private argument array for `params`.
///
/// `counts` must come from a successful validation of the same list. A
/// core-shared parameter that is no longer found in `core` is skipped and
/// does not take a row.
pub(crate) fn build_option_table<'host>(
    token_type: &str,
    params: &[DeclaredParam],
    counts: ParamCounts,
    core: CoreArgTable<'host>,
    callback: PluginCallback,
) -> TokenResult<(OptionTable<'host>, Vec<PrivateArg>)> {
    debug_assert!(counts.private_args <= counts.args);

    // callback row + one row per parameter + sentinel
    let rows_len = counts
        .args
        .checked_add(2)
        .ok_or(TokenError::AllocationFailure {
            what: "plugin option table",
        })?;
    let mut rows = Vec::new();
    rows.try_reserve_exact(rows_len)
        .map_err(|_| TokenError::AllocationFailure {
            what: "plugin option table",
        })?;

    let mut private_args = Vec::new();
    private_args
        .try_reserve_exact(counts.private_args)
        .map_err(|_| TokenError::AllocationFailure {
            what: "plugin private arguments",
        })?;

    let invalid = |violation: ParamViolation| TokenError::InvalidParameterDeclaration {
        token_type: token_type.to_string(),
        violation,
    };

    rows.push(OptionRow::Callback {
        callback,
        token_type: token_type.to_string(),
    });

    for param in params.iter().take(counts.args) {
        let arg_type = param.arg_type().ok_or_else(|| {
            invalid(ParamViolation::TypeOutOfRange {
                name: param.name.clone(),
                tag: param.tag,
            })
        })?;

        match classify(&param.name, token_type).map_err(invalid)? {
            ParamClass::Private { suffix } => {
                rows.push(OptionRow::Private {
                    long_name: param.name.clone(),
                    kind: ArgKind::from(arg_type),
                    description: param.description.clone(),
                    arg_index: private_args.len(),
                });
                private_args.push(PrivateArg {
                    name: suffix.to_string(),
                    arg_type,
                });
            }
            ParamClass::Core => match core.lookup(&param.name) {
                Some((index, arg)) => rows.push(OptionRow::Core { index, arg }),
                None => debug!(
                    "Core argument {} no longer defined, skipping plugin row.",
                    param.name
                ),
            },
        }
    }

    rows.push(OptionRow::End);

    Ok((OptionTable { rows }, private_args))
}
