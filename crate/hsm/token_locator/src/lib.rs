//! Copyright 2024 Cosmian Tech SAS
//!
//! Locate PKCS#11 keys and certificates from a PKCS#11 URI.
//!
//! The resolution pipeline runs in four blocking stages against a live token:
//! 1. [`Locator::parse`] turns the URI into location and query attributes,
//! 2. [`SessionResolver::resolve`] loads the module, selects the slot, opens and
//!    authenticates a [`Session`],
//! 3. [`ObjectLocator`] searches the token for the key or certificate,
//! 4. [`derive_capabilities`] and [`Session::mechanisms`] report what the object
//!    and the slot can do.
//!
//! Nothing is cached between resolutions: every call negotiates with the device again.

#![allow(non_snake_case)]

mod admin;
mod capabilities;
mod config;
mod error;
mod keys;
mod mechanisms;
mod objects;
mod resolver;
mod runtime;
mod session;
mod uri;

#[cfg(test)]
mod tests;

pub use admin::{TokenAdmin, list_token_labels, open_token_session};
pub use capabilities::{
    CapabilityRecord, KeyObjectClass, ObjectClass, OperationKind, class_template,
    usage_attribute, usage_attributes, usage_from_attributes,
};
pub use config::TokenConfig;
pub use error::{TError, TResult};
pub use keys::{
    KeyAdapter, KeyAdapterFactory, KeyType, SupportedOperations, TokenKey,
    open_labelled_token_key, open_token_key,
};
pub use mechanisms::{
    MechanismDescriptor, MechanismIter, MechanismOperation, Mechanisms, derive_capabilities,
    enumerate_mechanisms,
};
pub use objects::{
    AmbiguousMatch, FoundObject, KeyIdent, MatchPolicy, ObjectLocator, PrivateKeyInfo,
    object_template,
};
pub use resolver::{NoPin, PinProvider, SessionResolver, SelectedSlot, check_library, select_slot};
pub use runtime::{
    Attribute, AttributeValue, DynamicModuleLoader, HsmLib, LibraryInfo, MechanismInfo,
    ModuleLoader, ModuleRegistry, ModuleSource, PKCS11_MODULE_ENV, Pkcs11Runtime, SessionInfo,
    SlotInfo, TokenInfo, UserType, bool_value, ulong_value,
};
pub use session::{LoginState, Session, SessionState};
pub use uri::{AttributeScope, LocationAttribute, Locator, PKCS11_SCHEME, QueryAttribute};
