//! Copyright 2024 Cosmian Tech SAS

use pkcs11_sys::CK_RV;
use thiserror::Error;

pub type TResult<T> = Result<T, TError>;

#[derive(Error, Debug)]
pub enum TError {
    // Parse-time errors, never retried
    #[error("Not a PKCS#11 URI: {0}")]
    NotALocator(String),

    #[error("Malformed PKCS#11 URI: {0}")]
    MalformedLocator(String),

    // Resolution errors: any session opened on the way is closed before these surface
    #[error(
        "PKCS#11 library does not correspond to URI parameters: {attribute} -> {expected} != \
         {actual}"
    )]
    LibraryMismatch {
        attribute: String,
        expected: String,
        actual: String,
    },

    #[error("No slot matches the PKCS#11 URI: {0}")]
    NoMatchingSlot(String),

    #[error("Session attribute mismatch: {attribute} is of value {actual}, expected {expected}")]
    SessionAttributeMismatch {
        attribute: String,
        expected: String,
        actual: String,
    },

    #[error("Login is required, but no PIN was provided")]
    LoginRequiredNoPin,

    #[error("Login failed: {0}")]
    LoginFailure(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("{candidates} objects match {template}")]
    AmbiguousObjectMatch { candidates: usize, template: String },

    #[error("The URI requests object type {requested} but {expected} is required")]
    ObjectClassMismatch { requested: String, expected: String },

    #[error("Unknown object type: {0}")]
    UnknownObjectType(String),

    #[error("No PKCS#11 module: {0}")]
    NoModule(String),

    // Device runtime errors, propagated as-is
    #[error("PKCS#11 Error: {context}: {rv:#x}")]
    Pkcs11 { context: String, rv: CK_RV },

    #[error("Error loading the library: {0}")]
    LibLoading(#[from] libloading::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),

    #[error("{0}")]
    Default(String),
}

impl TError {
    /// The PKCS#11 return value, when the error comes from the device
    #[must_use]
    pub const fn rv(&self) -> Option<CK_RV> {
        match self {
            Self::Pkcs11 { rv, .. } => Some(*rv),
            _ => None,
        }
    }
}

/// Return early with an error if a condition is not satisfied.
///
/// This macro is equivalent to `if !$cond { return Err(From::from($err)); }`.
#[macro_export]
macro_rules! token_ensure {
    ($cond:expr, $msg:literal $(,)?) => {
        if !$cond {
            return ::core::result::Result::Err($crate::token_error!($msg));
        }
    };
    ($cond:expr, $err:expr $(,)?) => {
        if !$cond {
            return ::core::result::Result::Err($err);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !$cond {
            return ::core::result::Result::Err($crate::token_error!($fmt, $($arg)*));
        }
    };
}

/// Construct a token error from a string.
#[macro_export]
macro_rules! token_error {
    ($msg:literal) => {
        $crate::TError::Default(::core::format_args!($msg).to_string())
    };
    ($err:expr $(,)?) => ({
        $crate::TError::Default($err.to_string())
    });
    ($fmt:expr, $($arg:tt)*) => {
        $crate::TError::Default(::core::format_args!($fmt, $($arg)*).to_string())
    };
}
