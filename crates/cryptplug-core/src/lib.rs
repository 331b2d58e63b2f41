//! Loader and command-line integration for external crypto-token modules.

pub mod abi;
pub mod config;
pub mod error;
pub mod handler;
pub mod loader;
pub mod logging;
pub mod options;
pub mod params;
pub mod value;

#[cfg(test)]
mod test_log;

pub use abi::{ArgType, ParamList};
pub use config::PluginConfig;
pub use error::{ParamViolation, TokenError, TokenResult};
pub use handler::{HandlerState, TokenCapabilities, TokenHandler};
pub use loader::{DylibLoader, EntryPoints, ModuleLoader, TokenModule};
pub use options::{IncludeTable, OptionRow, OptionTable, PluginCallback, PrivateArg};
pub use params::{ArgKind, CoreArg, CoreArgTable, DeclaredParam};
pub use value::ArgValue;
