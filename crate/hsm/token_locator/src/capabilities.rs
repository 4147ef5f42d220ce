//! Static capability tables.
//!
//! Two axes: the object class drives the search head template, and the
//! (class, operation) pair selects the attribute bit that expresses a capability.
//! A missing entry means the capability class does not apply to the object kind.

use std::collections::HashMap;

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_OBJECT_CLASS, CKA_CLASS, CKA_DECRYPT, CKA_DERIVE, CKA_ENCRYPT,
    CKA_PRIVATE, CKA_SIGN, CKA_SIGN_RECOVER, CKA_UNWRAP, CKA_VERIFY, CKA_VERIFY_RECOVER, CKA_WRAP,
    CKO_CERTIFICATE, CKO_DATA, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKO_SECRET_KEY,
};
use strum::{Display, EnumString};

use crate::runtime::Attribute;

/// Object classes addressable with the URI `type` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum ObjectClass {
    #[strum(to_string = "public")]
    PublicKey,
    #[strum(to_string = "private")]
    PrivateKey,
    #[strum(to_string = "cert", serialize = "certificate")]
    Certificate,
    #[strum(to_string = "secret-key")]
    SecretKey,
    #[strum(to_string = "data")]
    Data,
}

impl ObjectClass {
    #[must_use]
    pub const fn ck_class(self) -> CK_OBJECT_CLASS {
        match self {
            Self::PublicKey => CKO_PUBLIC_KEY,
            Self::PrivateKey => CKO_PRIVATE_KEY,
            Self::Certificate => CKO_CERTIFICATE,
            Self::SecretKey => CKO_SECRET_KEY,
            Self::Data => CKO_DATA,
        }
    }

    #[must_use]
    pub const fn from_ck_class(class: CK_OBJECT_CLASS) -> Option<Self> {
        match class {
            CKO_PUBLIC_KEY => Some(Self::PublicKey),
            CKO_PRIVATE_KEY => Some(Self::PrivateKey),
            CKO_CERTIFICATE => Some(Self::Certificate),
            CKO_SECRET_KEY => Some(Self::SecretKey),
            CKO_DATA => Some(Self::Data),
            _ => None,
        }
    }
}

/// The classes for which usage is derived from attribute bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyObjectClass {
    Private,
    Public,
    Certificate,
}

impl KeyObjectClass {
    #[must_use]
    pub const fn from_ck_class(class: CK_OBJECT_CLASS) -> Option<Self> {
        match class {
            CKO_PRIVATE_KEY => Some(Self::Private),
            CKO_PUBLIC_KEY => Some(Self::Public),
            CKO_CERTIFICATE => Some(Self::Certificate),
            _ => None,
        }
    }

    #[must_use]
    pub const fn ck_class(self) -> CK_OBJECT_CLASS {
        match self {
            Self::Private => CKO_PRIVATE_KEY,
            Self::Public => CKO_PUBLIC_KEY,
            Self::Certificate => CKO_CERTIFICATE,
        }
    }
}

/// Operation kinds of a capability record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum OperationKind {
    #[strum(to_string = "crypt")]
    Crypt,
    #[strum(to_string = "sign")]
    Sign,
    #[strum(to_string = "wrap")]
    Wrap,
    #[strum(to_string = "derive")]
    Derive,
    #[strum(to_string = "recover")]
    Recover,
}

impl OperationKind {
    pub const ALL: [Self; 5] = [
        Self::Crypt,
        Self::Sign,
        Self::Wrap,
        Self::Derive,
        Self::Recover,
    ];
}

/// The head of a search template identifying a key object class
#[must_use]
pub fn class_template(class: KeyObjectClass) -> Vec<Attribute> {
    let private = matches!(class, KeyObjectClass::Private);
    vec![
        Attribute::ulong(CKA_CLASS, class.ck_class()),
        Attribute::bool(CKA_PRIVATE, private),
    ]
}

/// The attribute bit expressing `kind` for `class`, if the capability applies
#[must_use]
pub const fn usage_attribute(
    class: KeyObjectClass,
    kind: OperationKind,
) -> Option<CK_ATTRIBUTE_TYPE> {
    match (class, kind) {
        (KeyObjectClass::Private, OperationKind::Crypt) => Some(CKA_DECRYPT),
        (KeyObjectClass::Private, OperationKind::Sign) => Some(CKA_SIGN),
        (KeyObjectClass::Private, OperationKind::Wrap) => Some(CKA_UNWRAP),
        (KeyObjectClass::Private, OperationKind::Derive) => Some(CKA_DERIVE),
        (KeyObjectClass::Private, OperationKind::Recover) => Some(CKA_SIGN_RECOVER),
        (KeyObjectClass::Public, OperationKind::Crypt) => Some(CKA_ENCRYPT),
        (KeyObjectClass::Public, OperationKind::Sign) => Some(CKA_VERIFY),
        (KeyObjectClass::Public, OperationKind::Wrap) => Some(CKA_WRAP),
        (KeyObjectClass::Public, OperationKind::Recover) => Some(CKA_VERIFY_RECOVER),
        (KeyObjectClass::Public, OperationKind::Derive) | (KeyObjectClass::Certificate, _) => None,
    }
}

/// Every applicable (kind, attribute) pair of a class, to be read in one batch
#[must_use]
pub fn usage_attributes(class: KeyObjectClass) -> Vec<(OperationKind, CK_ATTRIBUTE_TYPE)> {
    OperationKind::ALL
        .iter()
        .filter_map(|kind| usage_attribute(class, *kind).map(|attribute| (*kind, attribute)))
        .collect()
}

/// Which operations an object supports.
///
/// `Some(true)`: supported and asserted, `Some(false)`: explicitly disabled,
/// `None`: the capability does not apply to this object kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityRecord {
    pub crypt: Option<bool>,
    pub sign: Option<bool>,
    pub wrap: Option<bool>,
    pub derive: Option<bool>,
    pub recover: Option<bool>,
}

impl CapabilityRecord {
    #[must_use]
    pub const fn all() -> Self {
        Self {
            crypt: Some(true),
            sign: Some(true),
            wrap: Some(true),
            derive: Some(true),
            recover: Some(true),
        }
    }

    #[must_use]
    pub const fn all_no_derive() -> Self {
        Self {
            derive: Some(false),
            ..Self::all()
        }
    }

    #[must_use]
    pub const fn get(&self, kind: OperationKind) -> Option<bool> {
        match kind {
            OperationKind::Crypt => self.crypt,
            OperationKind::Sign => self.sign,
            OperationKind::Wrap => self.wrap,
            OperationKind::Derive => self.derive,
            OperationKind::Recover => self.recover,
        }
    }

    pub const fn set(&mut self, kind: OperationKind, value: Option<bool>) {
        match kind {
            OperationKind::Crypt => self.crypt = value,
            OperationKind::Sign => self.sign = value,
            OperationKind::Wrap => self.wrap = value,
            OperationKind::Derive => self.derive = value,
            OperationKind::Recover => self.recover = value,
        }
    }
}

/// Build the record of an object from the attribute bits read on it.
///
/// Returns `None` if `object_class` is not a key or certificate class.
/// Attributes missing from `bits` (not returned by the device) stay absent.
#[must_use]
pub fn usage_from_attributes(
    object_class: CK_OBJECT_CLASS,
    bits: &HashMap<CK_ATTRIBUTE_TYPE, bool>,
) -> Option<CapabilityRecord> {
    let class = KeyObjectClass::from_ck_class(object_class)?;
    let mut record = CapabilityRecord::default();
    for (kind, attribute) in usage_attributes(class) {
        record.set(kind, bits.get(&attribute).copied());
    }
    Some(record)
}
