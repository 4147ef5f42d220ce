use std::path::PathBuf;

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::objects::MatchPolicy;

#[derive(Args, Clone, Serialize, Deserialize, Default, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct TokenConfig {
    /// Path of the PKCS#11 module used when the URI carries neither
    /// `module-path` nor `module-name`.
    /// When unset, the module loader still reads `PKCS11_MODULE` at load time.
    #[clap(verbatim_doc_comment, long, env = "PKCS11_MODULE")]
    pub pkcs11_module: Option<PathBuf>,

    /// Directory searched for modules given by `module-name`.
    /// Repeat this option to search several directories, in order.
    /// When none is given, the system library search path is used
    #[clap(verbatim_doc_comment, long = "pkcs11-module-dir")]
    pub module_directories: Vec<PathBuf>,

    /// Fail instead of picking the first handle when several objects match the URI
    #[clap(long)]
    pub strict_object_match: bool,

    /// Also consider slots with no token present during slot selection
    #[clap(long)]
    pub all_slots: bool,
}

impl TokenConfig {
    #[must_use]
    pub const fn match_policy(&self) -> MatchPolicy {
        if self.strict_object_match {
            MatchPolicy::Strict
        } else {
            MatchPolicy::FirstMatch
        }
    }
}
