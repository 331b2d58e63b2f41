use std::path::PathBuf;
use thiserror::Error;

/// Result alias for token handler operations.
pub type TokenResult<T> = Result<T, TokenError>;

/// Reason a declared parameter list was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamViolation {
    #[error("parameter with empty name")]
    EmptyName,

    #[error("parameter {name} has unknown type {tag}")]
    TypeOutOfRange { name: String, tag: u32 },

    #[error("invalid argument {name} name (expected: plugin-{token_type}-<name>)")]
    MalformedPrivateName { name: String, token_type: String },

    #[error("plugin requests access to undefined core argument {0}")]
    UnknownCoreArgument(String),

    #[error("parameter name is not valid UTF-8: {0}")]
    NonUtf8Name(String),

    #[error("parameter {0} declared more than once")]
    Duplicate(String),

    #[error("parameter list changed between traversals")]
    Diverged,

    /// The list hit the traversal cap. Lists are bounded so a cyclic `next`
    /// chain cannot hang the host; longer finite lists are refused as well.
    #[error("parameter list exceeds {0} entries")]
    TooLong(usize),
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("[TK1000] external token modules are not supported in this build")]
    Unsupported,

    #[error("[TK1100] invalid token type `{token_type}`: {reason}")]
    InvalidType { token_type: String, reason: String },

    #[error("[TK1200] failed to load cryptsetup plugin: {reason}")]
    LoadFailed { module: PathBuf, reason: String },

    #[error("[TK1201] failed to load mandatory plugin symbol {symbol} ({reason})")]
    MissingMandatorySymbol { symbol: &'static str, reason: String },

    #[error("[TK1300] plugin {token_type} has invalid parameters: {violation}")]
    InvalidParameterDeclaration {
        token_type: String,
        violation: ParamViolation,
    },

    #[error("[TK1400] failed to allocate {what}")]
    AllocationFailure { what: &'static str },

    #[error("[TK1500] option --{option} is not provided by plugin {token_type}")]
    UnknownOption { token_type: String, option: String },

    #[error("[TK1501] invalid value `{value}` for --{option}: {reason}")]
    InvalidValue {
        option: String,
        value: String,
        reason: String,
    },

    #[error("[TK1600] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[TK1601] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[TK1602] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[TK1603] configuration error: {0}")]
    InvalidConfig(String),
}

impl TokenError {
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::Unsupported => "TK1000",
            TokenError::InvalidType { .. } => "TK1100",
            TokenError::LoadFailed { .. } => "TK1200",
            TokenError::MissingMandatorySymbol { .. } => "TK1201",
            TokenError::InvalidParameterDeclaration { .. } => "TK1300",
            TokenError::AllocationFailure { .. } => "TK1400",
            TokenError::UnknownOption { .. } => "TK1500",
            TokenError::InvalidValue { .. } => "TK1501",
            TokenError::Io(_) => "TK1600",
            TokenError::Toml(_) => "TK1601",
            TokenError::Yaml(_) => "TK1602",
            TokenError::InvalidConfig(_) => "TK1603",
        }
    }

    /// Negative errno reported to callers that speak the C return convention.
    pub fn errno(&self) -> i32 {
        match self {
            TokenError::Unsupported => -libc::ENOTSUP,
            TokenError::AllocationFailure { .. } => -libc::ENOMEM,
            TokenError::Io(err) => -err.raw_os_error().unwrap_or(libc::EIO),
            _ => -libc::EINVAL,
        }
    }

    /// Process exit status for the command-line tool.
    pub fn exit_code(&self) -> i32 {
        exit_code_for_errno(self.errno())
    }
}

/// Map a negative errno onto the tool's exit status table.
pub fn exit_code_for_errno(errno: i32) -> i32 {
    match -errno {
        0 => 0,
        libc::EPERM => 2,
        libc::ENOMEM => 3,
        libc::ENODEV | libc::ENOTBLK => 4,
        libc::EBUSY | libc::EEXIST => 5,
        _ => 1,
    }
}
