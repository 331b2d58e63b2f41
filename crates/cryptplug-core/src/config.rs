use crate::abi::module_file_name;
use crate::error::{TokenError, TokenResult};
use crate::loader::DylibLoader;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment override for `loader.module_dir`.
pub const MODULE_DIR_ENV: &str = "CRYPTPLUG_MODULE_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct LoaderCfg {
    /// Directory holding `libcryptsetup-token-<type>.so` files. When unset
    /// the platform loader search path is used.
    #[serde(default)]
    pub module_dir: Option<String>,

    /// Suppress error logging for load and validation failures.
    #[serde(default)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TokensCfg {
    /// Token types loaded when no type is given on the command line.
    #[serde(default)]
    pub preload: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PluginConfig {
    #[serde(default)]
    pub loader: LoaderCfg,

    #[serde(default)]
    pub tokens: TokensCfg,

    #[serde(skip)]
    #[schemars(skip)]
    pub path: PathBuf,
}

impl PluginConfig {
    /// Read a TOML (by `.toml` extension) or YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> TokenResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = if matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"))
        {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();

        if let Some(dir) = &cfg.loader.module_dir {
            if dir.trim().is_empty() {
                return Err(TokenError::InvalidConfig(
                    "loader.module_dir must not be empty".to_string(),
                ));
            }
        }

        Ok(cfg)
    }

    /// Load `path` when it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> TokenResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Human-readable problems with the configuration; empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if let Some(dir) = &self.loader.module_dir {
            if !Path::new(dir).is_absolute() {
                issues.push(format!("loader.module_dir `{dir}` must be an absolute path"));
            }
        }

        for (idx, token_type) in self.tokens.preload.iter().enumerate() {
            if let Err(err) = module_file_name(token_type) {
                issues.push(format!("tokens.preload[{idx}]: {err}"));
            }
            if self.tokens.preload[..idx].contains(token_type) {
                issues.push(format!("tokens.preload[{idx}]: `{token_type}` listed twice"));
            }
        }

        issues
    }

    /// Module directory, honouring the environment override.
    pub fn module_dir(&self) -> Option<PathBuf> {
        env::var(MODULE_DIR_ENV)
            .ok()
            .filter(|dir| !dir.is_empty())
            .or_else(|| self.loader.module_dir.clone())
            .map(PathBuf::from)
    }

    /// Platform loader configured for this deployment.
    pub fn dylib_loader(&self) -> DylibLoader {
        match self.module_dir() {
            Some(dir) => DylibLoader::with_module_dir(dir),
            None => DylibLoader::new(),
        }
    }
}
