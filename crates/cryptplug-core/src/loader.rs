//! Locates a token module by type, maps it into the process and resolves its
//! entry points.
//!
//! Mapping goes through a [`ModuleLoader`] so hosts and tests can substitute
//! the platform loader. A mapped module lives in a `Box<dyn TokenModule>`;
//! dropping the box unmaps it, so every early return below releases the
//! module exactly once.

use crate::abi::{
    self, TokenCreateFn, TokenHandleFreeFn, TokenHandleInitFn, TokenParamsFn, TokenRemoveFn,
    TokenValidateParamsFn,
};
use crate::error::{TokenError, TokenResult};
use log::{debug, error};
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// A module mapped into the process.
pub trait TokenModule {
    /// Resolve an exported symbol, returning the loader diagnostic on failure.
    fn symbol(&self, name: &str) -> Result<*mut c_void, String>;
}

/// Maps token modules into the process.
pub trait ModuleLoader {
    /// Map the module at `path`, returning the loader diagnostic on failure.
    fn open(&self, path: &Path) -> Result<Box<dyn TokenModule>, String>;

    /// Where the module file for `file_name` is looked up.
    fn module_path(&self, file_name: &str) -> PathBuf {
        PathBuf::from(file_name)
    }

    /// Whether this loader can map modules at all in the current build.
    fn supported(&self) -> bool {
        true
    }
}

/// Entry points resolved from a loaded module.
#[derive(Clone, Copy)]
pub struct EntryPoints {
    pub init: TokenHandleInitFn,
    pub free: TokenHandleFreeFn,
    pub params: TokenParamsFn,
    pub validate_create_params: Option<TokenValidateParamsFn>,
    pub create: Option<TokenCreateFn>,
    pub validate_remove_params: Option<TokenValidateParamsFn>,
    pub remove: Option<TokenRemoveFn>,
}

impl fmt::Debug for EntryPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryPoints")
            .field("validate_create_params", &self.validate_create_params.is_some())
            .field("create", &self.create.is_some())
            .field("validate_remove_params", &self.validate_remove_params.is_some())
            .field("remove", &self.remove.is_some())
            .finish_non_exhaustive()
    }
}

/// Map the module for `token_type` and resolve its entry points.
///
/// Missing mandatory symbols unmap the module and fail; missing optional
/// symbols only leave the matching field empty.
pub(crate) fn load_module(
    loader: &dyn ModuleLoader,
    token_type: &str,
    quiet: bool,
) -> TokenResult<(Box<dyn TokenModule>, EntryPoints)> {
    let file_name = abi::module_file_name(token_type)?;
    let path = loader.module_path(&file_name);

    debug!("Loading plugin {}.", path.display());

    let module = loader.open(&path).map_err(|reason| {
        if !quiet {
            error!("Failed to load cryptsetup plugin: {reason}.");
        }
        TokenError::LoadFailed {
            module: path.clone(),
            reason,
        }
    })?;

    // SAFETY: each symbol is cast to the signature fixed by the module
    // contract; a module that resolves a name with another signature is
    // outside what the host can defend against.
    let entry_points = unsafe {
        EntryPoints {
            init: cast(mandatory(module.as_ref(), abi::SYMBOL_HANDLE_INIT, quiet)?),
            free: cast(mandatory(module.as_ref(), abi::SYMBOL_HANDLE_FREE, quiet)?),
            params: cast(mandatory(module.as_ref(), abi::SYMBOL_PARAMS, quiet)?),
            validate_create_params: optional(module.as_ref(), abi::SYMBOL_VALIDATE_CREATE_PARAMS)
                .map(|sym| cast(sym)),
            create: optional(module.as_ref(), abi::SYMBOL_CREATE).map(|sym| cast(sym)),
            validate_remove_params: optional(module.as_ref(), abi::SYMBOL_VALIDATE_REMOVE_PARAMS)
                .map(|sym| cast(sym)),
            remove: optional(module.as_ref(), abi::SYMBOL_REMOVE).map(|sym| cast(sym)),
        }
    };

    Ok((module, entry_points))
}

fn mandatory(
    module: &dyn TokenModule,
    symbol: &'static str,
    quiet: bool,
) -> TokenResult<NonNull<c_void>> {
    let resolved = module
        .symbol(symbol)
        .and_then(|ptr| NonNull::new(ptr).ok_or_else(|| "symbol resolves to NULL".to_string()));

    resolved.map_err(|reason| {
        if !quiet {
            error!("Failed to load mandatory plugin symbol {symbol} ({reason}).");
        }
        TokenError::MissingMandatorySymbol { symbol, reason }
    })
}

fn optional(module: &dyn TokenModule, symbol: &str) -> Option<NonNull<c_void>> {
    match module.symbol(symbol) {
        Ok(ptr) => {
            let resolved = NonNull::new(ptr);
            if resolved.is_none() {
                debug!("Optional plugin symbol {symbol} resolves to NULL.");
            }
            resolved
        }
        Err(reason) => {
            debug!("Failed to load optional plugin symbol {symbol} ({reason}).");
            None
        }
    }
}

/// Reinterpret a resolved symbol address as a function pointer.
///
/// # Safety
/// `F` must be an `extern "C"` function pointer type matching the symbol.
unsafe fn cast<F: Copy>(symbol: NonNull<c_void>) -> F {
    debug_assert_eq!(
        std::mem::size_of::<F>(),
        std::mem::size_of::<*mut c_void>()
    );
    std::mem::transmute_copy::<*mut c_void, F>(&symbol.as_ptr())
}

/// Platform loader backed by `dlopen` with lazy symbol binding.
#[derive(Debug, Clone, Default)]
pub struct DylibLoader {
    module_dir: Option<PathBuf>,
}

impl DylibLoader {
    /// Search the platform loader path for module files.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look module files up in `dir` instead of the loader search path.
    pub fn with_module_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            module_dir: Some(dir.into()),
        }
    }
}

#[cfg(all(unix, feature = "external-tokens"))]
mod dylib {
    use super::{DylibLoader, ModuleLoader, TokenModule};
    use libloading::os::unix::{Library, RTLD_LAZY};
    use std::ffi::c_void;
    use std::path::{Path, PathBuf};

    struct DylibModule {
        library: Library,
    }

    impl TokenModule for DylibModule {
        fn symbol(&self, name: &str) -> Result<*mut c_void, String> {
            let mut symbol = Vec::with_capacity(name.len() + 1);
            symbol.extend_from_slice(name.as_bytes());
            symbol.push(0);
            // SAFETY: the symbol is read as an untyped address and only cast
            // to a function type by the caller.
            let resolved = unsafe { self.library.get::<*mut c_void>(&symbol) };
            resolved.map(|sym| *sym).map_err(|err| err.to_string())
        }
    }

    impl ModuleLoader for DylibLoader {
        fn open(&self, path: &Path) -> Result<Box<dyn TokenModule>, String> {
            // SAFETY: module initialisers run on load; trust in a module is
            // assumed once the host decides to load it.
            let library =
                unsafe { Library::open(Some(path), RTLD_LAZY) }.map_err(|err| err.to_string())?;
            Ok(Box::new(DylibModule { library }))
        }

        fn module_path(&self, file_name: &str) -> PathBuf {
            match &self.module_dir {
                Some(dir) => dir.join(file_name),
                None => PathBuf::from(file_name),
            }
        }
    }
}

#[cfg(not(all(unix, feature = "external-tokens")))]
impl ModuleLoader for DylibLoader {
    fn open(&self, _path: &Path) -> Result<Box<dyn TokenModule>, String> {
        Err("external token modules are not supported in this build".to_string())
    }

    fn supported(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::CryptTokenArgItem;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::ffi::c_int;
    use std::rc::Rc;

    unsafe extern "C" fn fake_init(_cli: *mut c_void, _handle: *mut *mut c_void) -> c_int {
        0
    }
    unsafe extern "C" fn fake_free(_handle: *mut c_void) {}
    unsafe extern "C" fn fake_params() -> *const CryptTokenArgItem {
        std::ptr::null()
    }
    unsafe extern "C" fn fake_create(_cli: *mut c_void, _handle: *mut c_void) -> c_int {
        7
    }

    #[derive(Default)]
    struct Log {
        opened: Vec<PathBuf>,
        unmapped: usize,
    }

    struct FakeModule {
        symbols: HashMap<&'static str, *mut c_void>,
        log: Rc<RefCell<Log>>,
    }

    impl TokenModule for FakeModule {
        fn symbol(&self, name: &str) -> Result<*mut c_void, String> {
            self.symbols
                .get(name)
                .copied()
                .ok_or_else(|| format!("undefined symbol: {name}"))
        }
    }

    impl Drop for FakeModule {
        fn drop(&mut self) {
            self.log.borrow_mut().unmapped += 1;
        }
    }

    struct FakeLoader {
        symbols: Vec<(&'static str, *mut c_void)>,
        fail_open: bool,
        log: Rc<RefCell<Log>>,
    }

    impl FakeLoader {
        fn with_symbols(symbols: Vec<(&'static str, *mut c_void)>) -> Self {
            Self {
                symbols,
                fail_open: false,
                log: Rc::default(),
            }
        }
    }

    impl ModuleLoader for FakeLoader {
        fn open(&self, path: &Path) -> Result<Box<dyn TokenModule>, String> {
            if self.fail_open {
                return Err(format!("{}: cannot open shared object file", path.display()));
            }
            self.log.borrow_mut().opened.push(path.to_path_buf());
            Ok(Box::new(FakeModule {
                symbols: self.symbols.iter().copied().collect(),
                log: Rc::clone(&self.log),
            }))
        }
    }

    fn mandatory_symbols() -> Vec<(&'static str, *mut c_void)> {
        vec![
            (abi::SYMBOL_HANDLE_INIT, fake_init as *mut c_void),
            (abi::SYMBOL_HANDLE_FREE, fake_free as *mut c_void),
            (abi::SYMBOL_PARAMS, fake_params as *mut c_void),
        ]
    }

    #[test]
    fn loads_module_with_mandatory_symbols_only() {
        let loader = FakeLoader::with_symbols(mandatory_symbols());
        let (module, entry) = load_module(&loader, "test", true).unwrap();

        assert_eq!(
            loader.log.borrow().opened,
            vec![PathBuf::from("libcryptsetup-token-test.so")]
        );
        assert!(entry.validate_create_params.is_none());
        assert!(entry.create.is_none());
        assert!(entry.validate_remove_params.is_none());
        assert!(entry.remove.is_none());
        assert!(unsafe { (entry.params)() }.is_null());

        drop(module);
        assert_eq!(loader.log.borrow().unmapped, 1);
    }

    #[test]
    fn resolves_optional_symbols_when_present() {
        let mut symbols = mandatory_symbols();
        symbols.push((abi::SYMBOL_CREATE, fake_create as *mut c_void));
        let loader = FakeLoader::with_symbols(symbols);

        let (_module, entry) = load_module(&loader, "test", true).unwrap();
        let create = entry.create.expect("create entry point");
        assert_eq!(unsafe { create(std::ptr::null_mut(), std::ptr::null_mut()) }, 7);
        assert!(entry.remove.is_none());
    }

    #[test]
    fn every_missing_mandatory_symbol_fails_and_unmaps_once() {
        for missing in [abi::SYMBOL_HANDLE_INIT, abi::SYMBOL_HANDLE_FREE, abi::SYMBOL_PARAMS] {
            let symbols = mandatory_symbols()
                .into_iter()
                .filter(|(name, _)| *name != missing)
                .collect();
            let loader = FakeLoader::with_symbols(symbols);

            let err = load_module(&loader, "test", true).err().unwrap();
            match err {
                TokenError::MissingMandatorySymbol { symbol, .. } => assert_eq!(symbol, missing),
                other => panic!("unexpected error {other:?}"),
            }
            assert_eq!(loader.log.borrow().opened.len(), 1);
            assert_eq!(loader.log.borrow().unmapped, 1);
        }
    }

    #[test]
    fn null_mandatory_symbol_is_missing() {
        let mut symbols = mandatory_symbols();
        symbols[2].1 = std::ptr::null_mut();
        let loader = FakeLoader::with_symbols(symbols);

        let err = load_module(&loader, "test", true).err().unwrap();
        assert!(matches!(
            err,
            TokenError::MissingMandatorySymbol { symbol: abi::SYMBOL_PARAMS, .. }
        ));
        assert_eq!(loader.log.borrow().unmapped, 1);
    }

    #[test]
    fn open_failure_reports_loader_diagnostic() {
        let mut loader = FakeLoader::with_symbols(mandatory_symbols());
        loader.fail_open = true;

        let err = load_module(&loader, "missing", true).err().unwrap();
        match err {
            TokenError::LoadFailed { module, reason } => {
                assert_eq!(module, PathBuf::from("libcryptsetup-token-missing.so"));
                assert!(reason.contains("cannot open shared object file"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(loader.log.borrow().unmapped, 0);
    }

    #[test]
    fn load_failures_are_logged_unless_quiet() {
        let mut loader = FakeLoader::with_symbols(mandatory_symbols());
        loader.fail_open = true;

        crate::test_log::start();
        assert!(load_module(&loader, "missing", true).is_err());
        assert!(crate::test_log::errors().is_empty());

        assert!(load_module(&loader, "missing", false).is_err());
        let errors = crate::test_log::errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Failed to load cryptsetup plugin:"));
    }

    #[test]
    fn missing_symbol_is_logged_unless_quiet() {
        let symbols = mandatory_symbols()
            .into_iter()
            .filter(|(name, _)| *name != abi::SYMBOL_PARAMS)
            .collect();
        let loader = FakeLoader::with_symbols(symbols);

        crate::test_log::start();
        assert!(load_module(&loader, "test", true).is_err());
        assert!(crate::test_log::errors().is_empty());

        assert!(load_module(&loader, "test", false).is_err());
        let errors = crate::test_log::errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("mandatory plugin symbol crypt_token_params"));
        assert_eq!(loader.log.borrow().unmapped, 2);
    }

    #[test]
    fn overlong_type_is_rejected_before_open() {
        let loader = FakeLoader::with_symbols(mandatory_symbols());
        let err = load_module(&loader, &"x".repeat(64), true).err().unwrap();
        assert!(matches!(err, TokenError::InvalidType { .. }));
        assert!(loader.log.borrow().opened.is_empty());
    }

    #[cfg(all(unix, feature = "external-tokens"))]
    #[test]
    fn dylib_loader_joins_module_dir() {
        let loader = DylibLoader::with_module_dir("/usr/lib/cryptsetup");
        assert_eq!(
            loader.module_path("libcryptsetup-token-test.so"),
            PathBuf::from("/usr/lib/cryptsetup/libcryptsetup-token-test.so")
        );
        assert_eq!(
            DylibLoader::new().module_path("libcryptsetup-token-test.so"),
            PathBuf::from("libcryptsetup-token-test.so")
        );
    }

    #[cfg(all(unix, feature = "external-tokens"))]
    #[test]
    fn dylib_loader_reports_missing_module() {
        let loader = DylibLoader::with_module_dir("/nonexistent/cryptplug");
        let err = load_module(&loader, "absent", true).err().unwrap();
        assert!(matches!(err, TokenError::LoadFailed { .. }));
    }
}
