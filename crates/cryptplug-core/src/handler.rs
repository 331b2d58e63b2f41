//! Token handler lifecycle: load, validate, build, tear down.

use crate::error::{ParamViolation, TokenError, TokenResult};
use crate::loader::{self, EntryPoints, ModuleLoader, TokenModule};
use crate::options::{
    self, IncludeTable, OptionTable, PluginCallback, PrivateArg, PLUGIN_OPTIONS_TITLE,
};
use crate::params::{self, CoreArgTable, DeclaredParam, ParamCounts};
use crate::value::ArgValue;
use log::{debug, error};
use serde::Serialize;
use std::fmt;

/// Where a handler stands in the load sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerState {
    #[default]
    NotLoaded,
    Loaded,
    Validated,
    Configured,
}

/// Optional entry points a module exports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenCapabilities {
    pub validate_create_params: bool,
    pub create: bool,
    pub validate_remove_params: bool,
    pub remove: bool,
}

/// One external token module and the option table built from it.
///
/// A default handler is empty. [`TokenHandler::load`] walks it through
/// `Loaded`, `Validated` and `Configured`; any failure on the way tears it
/// back down to the empty state. Rows aliasing host arguments borrow from
/// the core table for `'host`.
#[derive(Default)]
pub struct TokenHandler<'host> {
    token_type: Option<String>,
    entry_points: Option<EntryPoints>,
    module: Option<Box<dyn TokenModule>>,
    state: HandlerState,
    counts: ParamCounts,
    declared: Vec<DeclaredParam>,
    options: Option<OptionTable<'host>>,
    private_args: Vec<PrivateArg>,
}

impl fmt::Debug for TokenHandler<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenHandler")
            .field("token_type", &self.token_type)
            .field("loaded", &self.is_loaded())
            .field("state", &self.state)
            .field("args_count", &self.counts.args)
            .field("private_args_count", &self.counts.private_args)
            .field("options", &self.options)
            .field("private_args", &self.private_args)
            .finish()
    }
}

impl<'host> TokenHandler<'host> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the module for `token_type` and build its merged option table.
    ///
    /// Anything the handler held before is released first. On failure the
    /// handler is torn down and the originating error returned.
    pub fn load(
        &mut self,
        loader: &dyn ModuleLoader,
        token_type: &str,
        core: CoreArgTable<'host>,
        callback: PluginCallback,
        quiet: bool,
    ) -> TokenResult<()> {
        if !loader.supported() {
            return Err(TokenError::Unsupported);
        }

        self.unload();
        let result = self.try_load(loader, token_type, core, callback, quiet);
        if result.is_err() {
            self.unload();
        }
        result
    }

    fn try_load(
        &mut self,
        loader: &dyn ModuleLoader,
        token_type: &str,
        core: CoreArgTable<'host>,
        callback: PluginCallback,
        quiet: bool,
    ) -> TokenResult<()> {
        self.token_type = Some(token_type.to_string());

        let (module, entry_points) = loader::load_module(loader, token_type, quiet)?;
        self.module = Some(module);
        self.entry_points = Some(entry_points);
        self.state = HandlerState::Loaded;

        if let Err(err) = self.validate(token_type, core) {
            if !quiet {
                error!("Plugin {token_type} has invalid parameters.");
            }
            return Err(err);
        }
        self.state = HandlerState::Validated;

        self.build(token_type, core, callback)?;
        self.state = HandlerState::Configured;

        debug!(
            "Plugin {token_type} configured with {} arguments ({} private).",
            self.counts.args, self.counts.private_args
        );
        Ok(())
    }

    fn validate(&mut self, token_type: &str, core: CoreArgTable<'host>) -> TokenResult<()> {
        let declared = self.traverse(token_type)?;
        params::validate_params(&declared, token_type, core, &mut self.counts)
            .map_err(|violation| invalid(token_type, violation))?;
        self.declared = declared;
        Ok(())
    }

    fn build(
        &mut self,
        token_type: &str,
        core: CoreArgTable<'host>,
        callback: PluginCallback,
    ) -> TokenResult<()> {
        if self.counts.args == 0 {
            return Ok(());
        }

        let second = self.traverse(token_type)?;
        if second != self.declared {
            debug!("Plugin {token_type} returned a different parameter list on re-read.");
            return Err(invalid(token_type, ParamViolation::Diverged));
        }

        let (table, private_args) =
            options::build_option_table(token_type, &second, self.counts, core, callback)?;
        self.options = Some(table);
        self.private_args = private_args;
        Ok(())
    }

    /// Ask the module for its declared parameters and copy them out.
    fn traverse(&self, token_type: &str) -> TokenResult<Vec<DeclaredParam>> {
        let Some(entry_points) = self.entry_points else {
            return Ok(Vec::new());
        };
        // SAFETY: `crypt_token_params` resolved from the module this handler
        // keeps mapped; the list it returns is owned by that module.
        unsafe { params::read_params((entry_points.params)()) }
            .map_err(|violation| invalid(token_type, violation))
    }

    /// Release the module and everything built from it.
    ///
    /// Safe on a default handler, on a partially loaded one and when called
    /// repeatedly.
    pub fn unload(&mut self) {
        let Some(token_type) = &self.token_type else {
            return;
        };
        debug!("Unloading plugin {token_type}.");
        // Entry points go before the module that backs them.
        self.entry_points = None;
        self.module = None;
        *self = Self::default();
    }

    pub fn token_type(&self) -> Option<&str> {
        self.token_type.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        self.module.is_some()
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn args_count(&self) -> usize {
        self.counts.args
    }

    pub fn private_args_count(&self) -> usize {
        self.counts.private_args
    }

    pub fn entry_points(&self) -> Option<&EntryPoints> {
        self.entry_points.as_ref()
    }

    pub fn capabilities(&self) -> TokenCapabilities {
        self.entry_points
            .map(|entry| TokenCapabilities {
                validate_create_params: entry.validate_create_params.is_some(),
                create: entry.create.is_some(),
                validate_remove_params: entry.validate_remove_params.is_some(),
                remove: entry.remove.is_some(),
            })
            .unwrap_or_default()
    }

    /// Merged option table; absent when the module declares no parameters.
    pub fn option_table(&self) -> Option<&OptionTable<'host>> {
        self.options.as_ref()
    }

    pub fn private_args(&self) -> &[PrivateArg] {
        &self.private_args
    }

    /// Include row for the host parser, available once configured.
    pub fn plugin_options(&self) -> Option<IncludeTable<'_, 'host>> {
        (self.state == HandlerState::Configured).then(|| IncludeTable {
            description: PLUGIN_OPTIONS_TITLE,
            table: self.options.as_ref(),
        })
    }

    /// Route a parsed private option through the table's callback.
    ///
    /// `raw` is the text given on the command line, `None` for flags.
    pub fn dispatch(&self, long_name: &str, raw: Option<&str>) -> TokenResult<ArgValue> {
        let unknown = || TokenError::UnknownOption {
            token_type: self.token_type.clone().unwrap_or_default(),
            option: long_name.to_string(),
        };

        let table = self.options.as_ref().ok_or_else(unknown)?;
        let arg = table
            .private_index(long_name)
            .and_then(|index| self.private_args.get(index))
            .ok_or_else(unknown)?;
        let callback = table.callback().ok_or_else(unknown)?;

        let value = ArgValue::parse(arg.arg_type, long_name, raw)?;
        callback(self, arg, &value)?;
        Ok(value)
    }
}

fn invalid(token_type: &str, violation: ParamViolation) -> TokenError {
    TokenError::InvalidParameterDeclaration {
        token_type: token_type.to_string(),
        violation,
    }
}
