//! Binary contract between the host tool and an external token module.
//!
//! Symbol names, the declared-parameter node layout and the module file name
//! template are fixed; modules built against them must keep working across
//! host releases.

use crate::error::{TokenError, TokenResult};
use std::ffi::{c_char, c_int, c_void, CString, NulError};
use std::ptr;

pub const SYMBOL_HANDLE_INIT: &str = "crypt_token_handle_init";
pub const SYMBOL_HANDLE_FREE: &str = "crypt_token_handle_free";
pub const SYMBOL_PARAMS: &str = "crypt_token_params";
pub const SYMBOL_VALIDATE_CREATE_PARAMS: &str = "crypt_token_validate_create_params";
pub const SYMBOL_CREATE: &str = "crypt_token_create";
pub const SYMBOL_VALIDATE_REMOVE_PARAMS: &str = "crypt_token_validate_remove_params";
pub const SYMBOL_REMOVE: &str = "crypt_token_remove";

/// Size of the module file name buffer, terminating NUL included.
pub const MODULE_NAME_MAX: usize = 64;

const MODULE_NAME_PREFIX: &str = "libcryptsetup-token-";
const MODULE_NAME_SUFFIX: &str = ".so";

pub type TokenHandleInitFn = unsafe extern "C" fn(cli: *mut c_void, handle: *mut *mut c_void) -> c_int;
pub type TokenHandleFreeFn = unsafe extern "C" fn(handle: *mut c_void);
pub type TokenParamsFn = unsafe extern "C" fn() -> *const CryptTokenArgItem;
pub type TokenValidateParamsFn = unsafe extern "C" fn(cli: *mut c_void, handle: *mut c_void) -> c_int;
pub type TokenCreateFn = unsafe extern "C" fn(cli: *mut c_void, handle: *mut c_void) -> c_int;
pub type TokenRemoveFn = unsafe extern "C" fn(cli: *mut c_void, handle: *mut c_void) -> c_int;

/// Value type of a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum ArgType {
    Bool = 0,
    String = 1,
    Int32 = 2,
    UInt32 = 3,
    Int64 = 4,
    UInt64 = 5,
}

impl ArgType {
    /// Decode a raw tag; anything past `UInt64` is out of range.
    pub fn from_raw(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Bool),
            1 => Some(Self::String),
            2 => Some(Self::Int32),
            3 => Some(Self::UInt32),
            4 => Some(Self::Int64),
            5 => Some(Self::UInt64),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::String => "string",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Int64 => "int64",
            Self::UInt64 => "uint64",
        }
    }
}

/// One node of the declared-parameter list exported by `crypt_token_params`.
#[repr(C)]
#[derive(Debug)]
pub struct CryptTokenArgItem {
    pub name: *const c_char,
    pub desc: *const c_char,
    pub arg_type: u32,
    pub next: *const CryptTokenArgItem,
}

/// Build the module file name for `token_type`.
///
/// Names that would not fit in [`MODULE_NAME_MAX`] are rejected rather than
/// truncated. Path separators and NUL bytes are refused so the name can only
/// ever select a file through the loader search path or the configured
/// module directory.
pub fn module_file_name(token_type: &str) -> TokenResult<String> {
    let invalid = |reason: &str| TokenError::InvalidType {
        token_type: token_type.to_string(),
        reason: reason.to_string(),
    };

    if token_type.is_empty() {
        return Err(invalid("type name is empty"));
    }
    if token_type.contains('/') || token_type.contains('\0') {
        return Err(invalid("type name contains a path separator or NUL byte"));
    }

    let name = format!("{MODULE_NAME_PREFIX}{token_type}{MODULE_NAME_SUFFIX}");
    if name.len() >= MODULE_NAME_MAX {
        return Err(invalid(&format!(
            "module file name exceeds {} bytes",
            MODULE_NAME_MAX - 1
        )));
    }
    Ok(name)
}

/// Owned, C-compatible declared-parameter list.
///
/// Token modules written in Rust can keep one of these in a static and hand
/// out [`ParamList::head`] from their `crypt_token_params` export; every call
/// then yields the identical sequence.
pub struct ParamList {
    nodes: Box<[CryptTokenArgItem]>,
    _strings: Vec<CString>,
}

// SAFETY: the nodes only point into `_strings` and into `nodes` itself, both
// owned by the list and never mutated after construction.
unsafe impl Send for ParamList {}
unsafe impl Sync for ParamList {}

impl ParamList {
    /// Build a list from `(name, description, type)` entries.
    pub fn new(entries: &[(&str, &str, ArgType)]) -> Result<Self, NulError> {
        let raw: Vec<(&str, &str, u32)> = entries
            .iter()
            .map(|(name, desc, ty)| (*name, *desc, ty.as_raw()))
            .collect();
        Self::from_raw_tags(&raw)
    }

    /// Build a list with unchecked type tags.
    pub fn from_raw_tags(entries: &[(&str, &str, u32)]) -> Result<Self, NulError> {
        let mut strings = Vec::with_capacity(entries.len() * 2);
        let mut nodes = Vec::with_capacity(entries.len());
        for (name, desc, tag) in entries {
            let name = CString::new(*name)?;
            let desc = CString::new(*desc)?;
            nodes.push(CryptTokenArgItem {
                name: name.as_ptr(),
                desc: desc.as_ptr(),
                arg_type: *tag,
                next: ptr::null(),
            });
            strings.push(name);
            strings.push(desc);
        }

        let mut nodes = nodes.into_boxed_slice();
        // Boxed slice storage does not move with the list.
        let base = nodes.as_mut_ptr();
        for idx in 1..nodes.len() {
            // SAFETY: both indices are within the slice.
            unsafe { (*base.add(idx - 1)).next = base.add(idx) };
        }

        Ok(Self {
            nodes,
            _strings: strings,
        })
    }

    /// First node of the list, or null when the list is empty.
    pub fn head(&self) -> *const CryptTokenArgItem {
        if self.nodes.is_empty() {
            ptr::null()
        } else {
            self.nodes.as_ptr()
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
