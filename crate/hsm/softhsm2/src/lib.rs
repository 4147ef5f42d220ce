//! Copyright 2024 Cosmian Tech SAS

use std::path::PathBuf;

use cosmian_token_locator::TokenConfig;


/// Default location of the SoftHSM2 module on Linux
pub const SOFTHSM2_PKCS11_LIB: &str = "/usr/local/lib/softhsm/libsofthsm2.so";

/// Directories where distributions install `libsofthsm2.so`
pub const SOFTHSM2_MODULE_DIRECTORIES: [&str; 3] = [
    "/usr/local/lib/softhsm",
    "/usr/lib/softhsm",
    "/usr/lib/x86_64-linux-gnu/softhsm",
];

/// Locator configuration with SoftHSM2 as the default module.
///
/// `module-name=softhsm2` URIs are searched in [`SOFTHSM2_MODULE_DIRECTORIES`].
#[must_use]
pub fn softhsm2_config(lib_path: Option<&str>) -> TokenConfig {
    TokenConfig {
        pkcs11_module: Some(PathBuf::from(lib_path.unwrap_or(SOFTHSM2_PKCS11_LIB))),
        module_directories: SOFTHSM2_MODULE_DIRECTORIES
            .iter()
            .map(PathBuf::from)
            .collect(),
        ..TokenConfig::default()
    }
}
