//! Declared-parameter traversal and contract validation.

use crate::abi::{ArgType, CryptTokenArgItem};
use crate::error::ParamViolation;
use log::debug;
use std::collections::HashSet;
use std::ffi::{c_char, CStr};

/// Name prefix reserved for module-private parameters.
pub const PRIVATE_PREFIX: &str = "plugin-";

/// Upper bound on a declared-parameter list.
///
/// A deliberate limit: reaching it is reported as
/// [`ParamViolation::TooLong`] whether the chain is cyclic or merely long.
pub const MAX_DECLARED_PARAMS: usize = 4096;

/// Whether a host argument takes a value on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    Flag,
    Value,
}

impl From<ArgType> for ArgKind {
    fn from(arg_type: ArgType) -> Self {
        match arg_type {
            ArgType::Bool => ArgKind::Flag,
            ArgType::String
            | ArgType::Int32
            | ArgType::UInt32
            | ArgType::Int64
            | ArgType::UInt64 => ArgKind::Value,
        }
    }
}

/// One argument owned by the host tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreArg {
    pub name: &'static str,
    pub short: Option<char>,
    pub kind: ArgKind,
    pub description: &'static str,
}

impl CoreArg {
    pub const fn flag(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            short: None,
            kind: ArgKind::Flag,
            description,
        }
    }

    pub const fn value(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            short: None,
            kind: ArgKind::Value,
            description,
        }
    }

    pub const fn with_short(mut self, short: char) -> Self {
        self.short = Some(short);
        self
    }
}

/// Read-only view over the host's argument table.
#[derive(Debug, Clone, Copy)]
pub struct CoreArgTable<'host> {
    args: &'host [CoreArg],
}

impl<'host> CoreArgTable<'host> {
    pub fn new(args: &'host [CoreArg]) -> Self {
        Self { args }
    }

    /// Index of the argument called `name`.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.args.iter().position(|arg| arg.name == name)
    }

    /// Index and row of the argument called `name`.
    pub fn lookup(&self, name: &str) -> Option<(usize, &'host CoreArg)> {
        let index = self.find(name)?;
        Some((index, &self.args[index]))
    }
}

/// A declared parameter copied out of a module's list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredParam {
    pub name: String,
    pub description: String,
    pub tag: u32,
}

impl DeclaredParam {
    pub fn arg_type(&self) -> Option<ArgType> {
        ArgType::from_raw(self.tag)
    }
}

/// How a declared parameter relates to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamClass<'a> {
    /// Refers to an argument the host already defines.
    Core,
    /// Namespaced to the module; carries the part after `plugin-<type>-`.
    Private { suffix: &'a str },
}

/// Classify `name` by its prefix, checking private names against `token_type`.
pub fn classify<'a>(name: &'a str, token_type: &str) -> Result<ParamClass<'a>, ParamViolation> {
    let Some(rest) = name.strip_prefix(PRIVATE_PREFIX) else {
        return Ok(ParamClass::Core);
    };

    let suffix = rest
        .strip_prefix(token_type)
        .and_then(|tail| tail.strip_prefix('-'))
        .filter(|suffix| !suffix.is_empty());

    match suffix {
        Some(suffix) => Ok(ParamClass::Private { suffix }),
        None => {
            debug!("Invalid argument {name} name (expected: plugin-{token_type}-<name>).");
            Err(ParamViolation::MalformedPrivateName {
                name: name.to_string(),
                token_type: token_type.to_string(),
            })
        }
    }
}

/// Counters filled in by validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamCounts {
    pub args: usize,
    pub private_args: usize,
}

/// Check every declared parameter, bumping `counts` for each accepted one.
///
/// The first violation stops the walk; `counts` then reflects only the
/// parameters accepted before it. A name may appear only once, so every
/// option row built from the list has a distinct long name.
pub fn validate_params(
    params: &[DeclaredParam],
    token_type: &str,
    core: CoreArgTable<'_>,
    counts: &mut ParamCounts,
) -> Result<(), ParamViolation> {
    let mut seen = HashSet::with_capacity(params.len());
    for param in params {
        if param.name.is_empty() {
            return Err(ParamViolation::EmptyName);
        }
        if param.arg_type().is_none() {
            return Err(ParamViolation::TypeOutOfRange {
                name: param.name.clone(),
                tag: param.tag,
            });
        }
        debug!(
            "Validating plugin parameter {} (type {}).",
            param.name, param.tag
        );

        if !seen.insert(param.name.as_str()) {
            debug!("Plugin parameter {} declared more than once.", param.name);
            return Err(ParamViolation::Duplicate(param.name.clone()));
        }

        match classify(&param.name, token_type)? {
            ParamClass::Private { .. } => counts.private_args += 1,
            ParamClass::Core => {
                if core.find(&param.name).is_none() {
                    debug!(
                        "Plugin requests access to undefined core argument {}.",
                        param.name
                    );
                    return Err(ParamViolation::UnknownCoreArgument(param.name.clone()));
                }
            }
        }

        counts.args += 1;
    }

    Ok(())
}

/// Copy a module's declared-parameter list into owned records.
///
/// # Safety
/// `head` must be null or point to a list of valid nodes whose strings are
/// NUL-terminated, all alive for the duration of the call.
pub unsafe fn read_params(
    head: *const CryptTokenArgItem,
) -> Result<Vec<DeclaredParam>, ParamViolation> {
    let mut params = Vec::new();
    let mut node = head;
    while let Some(item) = node.as_ref() {
        if params.len() == MAX_DECLARED_PARAMS {
            return Err(ParamViolation::TooLong(MAX_DECLARED_PARAMS));
        }
        let name = match c_str(item.name) {
            Some(text) => text
                .to_str()
                .map_err(|_| ParamViolation::NonUtf8Name(text.to_string_lossy().into_owned()))?
                .to_string(),
            None => String::new(),
        };
        // Descriptions are only displayed.
        let description = c_str(item.desc)
            .map(|text| text.to_string_lossy().into_owned())
            .unwrap_or_default();
        params.push(DeclaredParam {
            name,
            description,
            tag: item.arg_type,
        });
        node = item.next;
    }
    Ok(params)
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a CStr> {
    (!ptr.is_null()).then(|| CStr::from_ptr(ptr))
}
