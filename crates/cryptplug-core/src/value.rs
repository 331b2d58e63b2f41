//! Typed values for module-private command-line arguments.

use crate::abi::ArgType;
use crate::error::{TokenError, TokenResult};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// A parsed private argument value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    String(String),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
}

impl ArgValue {
    /// Parse the raw command-line text for `option` according to `arg_type`.
    ///
    /// Boolean parameters are flags and must not carry text; every other
    /// type requires it. Numbers are range-checked against their type.
    pub fn parse(arg_type: ArgType, option: &str, raw: Option<&str>) -> TokenResult<Self> {
        match arg_type {
            ArgType::Bool => match raw {
                None => Ok(ArgValue::Bool(true)),
                Some(text) => Err(invalid(option, text, "option does not take a value")),
            },
            ArgType::String => required(option, raw).map(|text| ArgValue::String(text.to_string())),
            ArgType::Int32 => number(option, raw).map(ArgValue::Int32),
            ArgType::UInt32 => number(option, raw).map(ArgValue::UInt32),
            ArgType::Int64 => number(option, raw).map(ArgValue::Int64),
            ArgType::UInt64 => number(option, raw).map(ArgValue::UInt64),
        }
    }
}

fn invalid(option: &str, value: &str, reason: impl Into<String>) -> TokenError {
    TokenError::InvalidValue {
        option: option.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn required<'a>(option: &str, raw: Option<&'a str>) -> TokenResult<&'a str> {
    raw.ok_or_else(|| invalid(option, "", "option requires a value"))
}

fn number<T>(option: &str, raw: Option<&str>) -> TokenResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let text = required(option, raw)?;
    text.parse::<T>()
        .map_err(|err| invalid(option, text, err.to_string()))
}
