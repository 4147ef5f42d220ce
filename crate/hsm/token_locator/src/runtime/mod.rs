//! The device runtime boundary.
//!
//! Everything the resolver needs from a PKCS#11 module goes through [`Pkcs11Runtime`]:
//! the `libloading` backed [`HsmLib`] in production, an in-memory token in tests.
//! All calls are blocking.

mod hsm_lib;
mod loader;

use std::{fmt, path::Path, sync::Arc};

pub use hsm_lib::HsmLib;
pub use loader::{DynamicModuleLoader, ModuleRegistry, PKCS11_MODULE_ENV};
use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_FALSE, CK_FLAGS, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE,
    CK_SESSION_HANDLE, CK_SLOT_ID, CK_STATE, CK_TRUE, CK_ULONG, CK_USER_TYPE, CKF_LOGIN_REQUIRED,
    CKU_SO, CKU_USER,
};

use crate::TResult;

/// `C_GetInfo` result, strings trimmed of their blank padding
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryInfo {
    pub cryptoki_version: (u8, u8),
    pub manufacturer_id: String,
    pub flags: CK_FLAGS,
    pub library_description: String,
    pub library_version: (u8, u8),
}

impl fmt::Display for LibraryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cryptoki Version: {}.{}\nManufacturer ID: {}\nFlags: {}\nLibrary Description: \
             {}\nLibrary Version: {}.{}",
            self.cryptoki_version.0,
            self.cryptoki_version.1,
            self.manufacturer_id,
            self.flags,
            self.library_description,
            self.library_version.0,
            self.library_version.1
        )
    }
}

/// `C_GetSlotInfo` result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot_description: String,
    pub manufacturer_id: String,
    pub flags: CK_FLAGS,
}

/// `C_GetTokenInfo` result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer_id: String,
    pub model: String,
    pub serial_number: String,
    pub flags: CK_FLAGS,
}

impl TokenInfo {
    #[must_use]
    pub const fn login_required(&self) -> bool {
        self.flags & CKF_LOGIN_REQUIRED != 0
    }
}

/// `C_GetSessionInfo` result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub slot_id: CK_SLOT_ID,
    pub state: CK_STATE,
    pub flags: CK_FLAGS,
    pub device_error: CK_ULONG,
}

/// `C_GetMechanismInfo` result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MechanismInfo {
    pub min_key_size: CK_ULONG,
    pub max_key_size: CK_ULONG,
    pub flags: CK_FLAGS,
}

/// The user logging in to a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UserType {
    #[default]
    User,
    SecurityOfficer,
}

impl UserType {
    #[must_use]
    pub const fn ck_user_type(self) -> CK_USER_TYPE {
        match self {
            Self::User => CKU_USER,
            Self::SecurityOfficer => CKU_SO,
        }
    }
}

/// One entry of a search template: an attribute type and its encoded value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: CK_ATTRIBUTE_TYPE,
    pub value: Vec<u8>,
}

impl Attribute {
    #[must_use]
    pub fn ulong(kind: CK_ATTRIBUTE_TYPE, value: CK_ULONG) -> Self {
        Self {
            kind,
            value: value.to_ne_bytes().to_vec(),
        }
    }

    #[must_use]
    pub fn bool(kind: CK_ATTRIBUTE_TYPE, value: bool) -> Self {
        let value: CK_BBOOL = if value { CK_TRUE } else { CK_FALSE };
        Self {
            kind,
            value: vec![value],
        }
    }

    #[must_use]
    pub fn bytes(kind: CK_ATTRIBUTE_TYPE, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Raw attribute value read from an object; `None` when the device reports it unavailable
pub type AttributeValue = Option<Vec<u8>>;

/// Decode a `CK_ULONG` attribute value
#[must_use]
pub fn ulong_value(raw: &[u8]) -> Option<CK_ULONG> {
    <[u8; size_of::<CK_ULONG>()]>::try_from(raw)
        .ok()
        .map(CK_ULONG::from_ne_bytes)
}

/// Decode a `CK_BBOOL` attribute value
#[must_use]
pub fn bool_value(raw: &[u8]) -> Option<bool> {
    match raw {
        [value] => Some(*value != CK_FALSE),
        _ => None,
    }
}

/// The PKCS#11 calls the resolver relies on.
///
/// At most one call may be in flight per session handle.
pub trait Pkcs11Runtime: Send + Sync {
    fn get_info(&self) -> TResult<LibraryInfo>;

    fn get_slot_list(&self, token_present: bool) -> TResult<Vec<CK_SLOT_ID>>;

    fn get_slot_info(&self, slot_id: CK_SLOT_ID) -> TResult<SlotInfo>;

    fn get_token_info(&self, slot_id: CK_SLOT_ID) -> TResult<TokenInfo>;

    fn open_session(&self, slot_id: CK_SLOT_ID, flags: CK_FLAGS) -> TResult<CK_SESSION_HANDLE>;

    fn close_session(&self, session: CK_SESSION_HANDLE) -> TResult<()>;

    fn get_session_info(&self, session: CK_SESSION_HANDLE) -> TResult<SessionInfo>;

    fn login(&self, session: CK_SESSION_HANDLE, user_type: UserType, pin: &str) -> TResult<()>;

    fn logout(&self, session: CK_SESSION_HANDLE) -> TResult<()>;

    /// Objects matching every attribute of `template`, in device order
    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> TResult<Vec<CK_OBJECT_HANDLE>>;

    /// One value per requested attribute, in request order
    fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attributes: &[CK_ATTRIBUTE_TYPE],
    ) -> TResult<Vec<AttributeValue>>;

    fn get_mechanism_list(&self, slot_id: CK_SLOT_ID) -> TResult<Vec<CK_MECHANISM_TYPE>>;

    fn get_mechanism_info(
        &self,
        slot_id: CK_SLOT_ID,
        mechanism: CK_MECHANISM_TYPE,
    ) -> TResult<MechanismInfo>;
}

/// Where the PKCS#11 module comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSource<'a> {
    /// `module-path` query attribute
    Path(&'a Path),
    /// `module-name` query attribute
    Name(&'a str),
    /// configured default
    Default,
}

/// Loads and initializes a PKCS#11 module.
///
/// Handles to the same module share one initialization; the module is finalized
/// when the last handle, held by sessions or callers, is dropped.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, source: ModuleSource<'_>) -> TResult<Arc<dyn Pkcs11Runtime>>;
}

#[cfg(test)]
mod tests {
    use pkcs11_sys::{CK_ULONG, CKA_CLASS, CKA_TOKEN, CKO_PRIVATE_KEY};

    use super::{Attribute, bool_value, ulong_value};

    #[test]
    fn test_attribute_encoding() {
        let class = Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY);
        assert_eq!(class.value.len(), size_of::<CK_ULONG>());
        assert_eq!(ulong_value(&class.value), Some(CKO_PRIVATE_KEY));
        let token = Attribute::bool(CKA_TOKEN, true);
        assert_eq!(bool_value(&token.value), Some(true));
        assert_eq!(bool_value(&[]), None);
        assert_eq!(ulong_value(&[1, 2]), None);
    }
}
