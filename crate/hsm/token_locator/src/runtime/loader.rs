use std::{
    collections::HashMap,
    env,
    ffi::OsString,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock, Weak},
};

use tracing::{debug, info};

use crate::{
    TError, TResult, TokenConfig,
    runtime::{HsmLib, ModuleLoader, ModuleSource, Pkcs11Runtime},
    token_error,
};

/// Environment variable naming the default module when none is configured
pub const PKCS11_MODULE_ENV: &str = "PKCS11_MODULE";

/// The modules alive in a process, by path.
///
/// A module is instantiated once and handed out again while any handle to it
/// is alive, so it is initialized once and finalized when the last handle drops,
/// whichever loader or resolver asked for it.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Mutex<HashMap<PathBuf, Weak<dyn Pkcs11Runtime>>>,
}

impl ModuleRegistry {
    /// The registry shared by every [`DynamicModuleLoader`] of the process
    #[must_use]
    pub fn global() -> &'static Self {
        static REGISTRY: OnceLock<ModuleRegistry> = OnceLock::new();
        REGISTRY.get_or_init(Self::default)
    }

    /// The live module at `path`, or the one `instantiate` builds.
    ///
    /// The registry stays locked while `instantiate` runs: two threads never
    /// initialize the same module concurrently.
    pub fn get_or_load<F>(&self, path: &Path, instantiate: F) -> TResult<Arc<dyn Pkcs11Runtime>>
    where
        F: FnOnce(&Path) -> TResult<Arc<dyn Pkcs11Runtime>>,
    {
        let mut modules = self
            .modules
            .lock()
            .map_err(|e| token_error!("loaded modules lock poisoned: {e}"))?;
        if let Some(module) = modules.get(path).and_then(Weak::upgrade) {
            debug!("Reusing PKCS#11 module {}", path.display());
            return Ok(module);
        }
        let module = instantiate(path)?;
        modules.retain(|_, module| module.strong_count() > 0);
        modules.insert(path.to_path_buf(), Arc::downgrade(&module));
        Ok(module)
    }

    /// Number of modules with a live handle
    pub fn live_modules(&self) -> TResult<usize> {
        let modules = self
            .modules
            .lock()
            .map_err(|e| token_error!("loaded modules lock poisoned: {e}"))?;
        Ok(modules
            .values()
            .filter(|module| module.strong_count() > 0)
            .count())
    }
}

/// The configured default module, else the one named by `PKCS11_MODULE`
fn default_module(configured: Option<&Path>, from_env: Option<OsString>) -> Option<PathBuf> {
    configured
        .map(Path::to_path_buf)
        .or_else(|| from_env.filter(|value| !value.is_empty()).map(PathBuf::from))
}

/// Loads PKCS#11 modules from the file system.
///
/// Modules go through [`ModuleRegistry::global`]: every loader of the process
/// shares the same instance of a module.
pub struct DynamicModuleLoader {
    config: TokenConfig,
}

impl DynamicModuleLoader {
    #[must_use]
    pub const fn new(config: TokenConfig) -> Self {
        Self { config }
    }

    /// The file to load for `source`.
    ///
    /// A `module-name` is mapped to the platform library file name
    /// (`libname.so`, `libname.dylib`, `name.dll`) and looked up in the configured
    /// module directories, or left to the system library search when none is set.
    /// The default module is the configured one, else the `PKCS11_MODULE` variable.
    pub(crate) fn module_path(&self, source: ModuleSource<'_>) -> TResult<PathBuf> {
        match source {
            ModuleSource::Path(path) => Ok(path.to_path_buf()),
            ModuleSource::Name(name) => {
                let file_name = libloading::library_filename(name);
                if self.config.module_directories.is_empty() {
                    return Ok(PathBuf::from(file_name));
                }
                self.config
                    .module_directories
                    .iter()
                    .map(|directory| directory.join(&file_name))
                    .find(|candidate| candidate.is_file())
                    .ok_or_else(|| {
                        TError::NoModule(format!(
                            "module {name} not found in {:?}",
                            self.config.module_directories
                        ))
                    })
            }
            ModuleSource::Default => default_module(
                self.config.pkcs11_module.as_deref(),
                env::var_os(PKCS11_MODULE_ENV),
            )
            .ok_or_else(|| {
                TError::NoModule(format!(
                    "the URI names no module, no default module is configured and \
                     {PKCS11_MODULE_ENV} is not set"
                ))
            }),
        }
    }
}

impl ModuleLoader for DynamicModuleLoader {
    fn load(&self, source: ModuleSource<'_>) -> TResult<Arc<dyn Pkcs11Runtime>> {
        let path = self.module_path(source)?;
        ModuleRegistry::global().get_or_load(&path, |path| {
            info!("Loading PKCS#11 module {}", path.display());
            Ok(Arc::new(HsmLib::instantiate(path)?) as Arc<dyn Pkcs11Runtime>)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        ffi::OsString,
        path::{Path, PathBuf},
    };

    use super::{DynamicModuleLoader, default_module};
    use crate::{TError, TResult, TokenConfig, runtime::ModuleSource};

    #[test]
    fn test_module_path_precedence() -> TResult<()> {
        let loader = DynamicModuleLoader::new(TokenConfig {
            pkcs11_module: Some(PathBuf::from("/usr/lib/default.so")),
            ..TokenConfig::default()
        });
        assert_eq!(
            loader.module_path(ModuleSource::Path(Path::new("/opt/p11.so")))?,
            PathBuf::from("/opt/p11.so")
        );
        assert_eq!(
            loader.module_path(ModuleSource::Default)?,
            PathBuf::from("/usr/lib/default.so")
        );
        assert_eq!(
            loader.module_path(ModuleSource::Name("softhsm2"))?,
            PathBuf::from(libloading::library_filename("softhsm2"))
        );
        Ok(())
    }

    #[test]
    fn test_module_name_searched_in_directories() -> TResult<()> {
        let dir = tempfile::tempdir()?;
        let file_name = libloading::library_filename("vendorp11");
        std::fs::write(dir.path().join(&file_name), b"")?;
        let loader = DynamicModuleLoader::new(TokenConfig {
            module_directories: vec![PathBuf::from("/nonexistent"), dir.path().to_path_buf()],
            ..TokenConfig::default()
        });
        assert_eq!(
            loader.module_path(ModuleSource::Name("vendorp11"))?,
            dir.path().join(file_name)
        );
        assert!(matches!(
            loader.module_path(ModuleSource::Name("other")),
            Err(TError::NoModule(_))
        ));
        Ok(())
    }

    #[test]
    fn test_default_module_falls_back_to_environment() {
        let from_env = || Some(OsString::from("/usr/lib/env/p11.so"));
        assert_eq!(
            default_module(None, from_env()),
            Some(PathBuf::from("/usr/lib/env/p11.so"))
        );
        // the configured module wins over the environment
        assert_eq!(
            default_module(Some(Path::new("/usr/lib/default.so")), from_env()),
            Some(PathBuf::from("/usr/lib/default.so"))
        );
        assert_eq!(default_module(None, Some(OsString::new())), None);
        assert_eq!(default_module(None, None), None);
    }

    #[test]
    fn test_no_default_module() {
        if std::env::var_os(super::PKCS11_MODULE_ENV).is_some() {
            return;
        }
        let loader = DynamicModuleLoader::new(TokenConfig::default());
        assert!(matches!(
            loader.module_path(ModuleSource::Default),
            Err(TError::NoModule(_))
        ));
    }
}
