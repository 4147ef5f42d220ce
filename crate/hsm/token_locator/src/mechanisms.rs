//! Capability derivation of a found object and mechanism enumeration of a slot.

use std::{collections::{HashMap, VecDeque}, fmt, sync::Arc, vec};

use pkcs11_sys::{
    CK_FLAGS, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_SLOT_ID, CKA_CLASS, CKF_DECRYPT,
    CKF_DERIVE, CKF_DIGEST, CKF_ENCRYPT, CKF_EXTENSION, CKF_GENERATE, CKF_GENERATE_KEY_PAIR,
    CKF_HW, CKF_SIGN, CKF_SIGN_RECOVER, CKF_UNWRAP, CKF_VERIFY, CKF_VERIFY_RECOVER, CKF_WRAP,
};
use strum::Display;
use tracing::trace;

use crate::{
    TResult,
    capabilities::{CapabilityRecord, KeyObjectClass, usage_attributes, usage_from_attributes},
    runtime::{Pkcs11Runtime, bool_value, ulong_value},
    session::Session,
};

/// Operation flags of `C_GetMechanismInfo`, labelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum MechanismOperation {
    #[strum(to_string = "HW")]
    Hardware,
    #[strum(to_string = "ENCRYPT")]
    Encrypt,
    #[strum(to_string = "DECRYPT")]
    Decrypt,
    #[strum(to_string = "DIGEST")]
    Digest,
    #[strum(to_string = "SIGN")]
    Sign,
    #[strum(to_string = "SIGN_RECOVER")]
    SignRecover,
    #[strum(to_string = "VERIFY")]
    Verify,
    #[strum(to_string = "VERIFY_RECOVER")]
    VerifyRecover,
    #[strum(to_string = "GENERATE")]
    Generate,
    #[strum(to_string = "GENERATE_KEY_PAIR")]
    GenerateKeyPair,
    #[strum(to_string = "WRAP")]
    Wrap,
    #[strum(to_string = "UNWRAP")]
    Unwrap,
    #[strum(to_string = "DERIVE")]
    Derive,
    #[strum(to_string = "EXTENSION")]
    Extension,
}

impl MechanismOperation {
    /// In flag bit order
    pub const ALL: [Self; 14] = [
        Self::Hardware,
        Self::Encrypt,
        Self::Decrypt,
        Self::Digest,
        Self::Sign,
        Self::SignRecover,
        Self::Verify,
        Self::VerifyRecover,
        Self::Generate,
        Self::GenerateKeyPair,
        Self::Wrap,
        Self::Unwrap,
        Self::Derive,
        Self::Extension,
    ];

    #[must_use]
    pub const fn flag(self) -> CK_FLAGS {
        match self {
            Self::Hardware => CKF_HW,
            Self::Encrypt => CKF_ENCRYPT,
            Self::Decrypt => CKF_DECRYPT,
            Self::Digest => CKF_DIGEST,
            Self::Sign => CKF_SIGN,
            Self::SignRecover => CKF_SIGN_RECOVER,
            Self::Verify => CKF_VERIFY,
            Self::VerifyRecover => CKF_VERIFY_RECOVER,
            Self::Generate => CKF_GENERATE,
            Self::GenerateKeyPair => CKF_GENERATE_KEY_PAIR,
            Self::Wrap => CKF_WRAP,
            Self::Unwrap => CKF_UNWRAP,
            Self::Derive => CKF_DERIVE,
            Self::Extension => CKF_EXTENSION,
        }
    }

    /// The operations asserted by a mechanism flag set
    pub fn from_flags(flags: CK_FLAGS) -> impl Iterator<Item = Self> {
        Self::ALL
            .into_iter()
            .filter(move |operation| flags & operation.flag() != 0)
    }
}

/// One (mechanism, operation) pair supported by a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MechanismDescriptor {
    pub mechanism: CK_MECHANISM_TYPE,
    pub operation: MechanismOperation,
}

impl fmt::Display for MechanismDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{}", self.mechanism, self.operation)
    }
}

/// The mechanisms of a slot.
///
/// Every iteration queries the device again.
#[derive(Clone)]
pub struct Mechanisms {
    runtime: Arc<dyn Pkcs11Runtime>,
    slot_id: CK_SLOT_ID,
}

impl Mechanisms {
    #[must_use]
    pub fn new(runtime: Arc<dyn Pkcs11Runtime>, slot_id: CK_SLOT_ID) -> Self {
        Self { runtime, slot_id }
    }

    #[must_use]
    pub const fn slot_id(&self) -> CK_SLOT_ID {
        self.slot_id
    }

    #[must_use]
    pub fn iter(&self) -> MechanismIter {
        MechanismIter {
            runtime: self.runtime.clone(),
            slot_id: self.slot_id,
            mechanisms: None,
            pending: VecDeque::new(),
            done: false,
        }
    }

    pub fn collect(&self) -> TResult<Vec<MechanismDescriptor>> {
        self.iter().collect()
    }
}

impl IntoIterator for &Mechanisms {
    type IntoIter = MechanismIter;
    type Item = TResult<MechanismDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy walk over the mechanisms of a slot.
///
/// The mechanism list is fetched on the first call to `next`, the info of each
/// mechanism when its turn comes. The walk stops after the first device error.
pub struct MechanismIter {
    runtime: Arc<dyn Pkcs11Runtime>,
    slot_id: CK_SLOT_ID,
    mechanisms: Option<vec::IntoIter<CK_MECHANISM_TYPE>>,
    pending: VecDeque<MechanismDescriptor>,
    done: bool,
}

impl Iterator for MechanismIter {
    type Item = TResult<MechanismDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(descriptor) = self.pending.pop_front() {
                return Some(Ok(descriptor));
            }
            if self.done {
                return None;
            }
            if self.mechanisms.is_none() {
                match self.runtime.get_mechanism_list(self.slot_id) {
                    Ok(list) => {
                        trace!("slot {} exposes {} mechanisms", self.slot_id, list.len());
                        self.mechanisms = Some(list.into_iter());
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
            let Some(mechanism) = self.mechanisms.as_mut().and_then(Iterator::next) else {
                self.done = true;
                return None;
            };
            match self.runtime.get_mechanism_info(self.slot_id, mechanism) {
                Ok(info) => self.pending.extend(
                    MechanismOperation::from_flags(info.flags)
                        .map(|operation| MechanismDescriptor { mechanism, operation }),
                ),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Every (mechanism, operation) pair of `slot_id`, in device order
pub fn enumerate_mechanisms(
    session: &Session,
    slot_id: CK_SLOT_ID,
) -> TResult<Vec<MechanismDescriptor>> {
    Mechanisms::new(session.runtime().clone(), slot_id).collect()
}

/// Read the usage bits of an object.
///
/// Returns `Ok(None)` when the object class is not a key or certificate class,
/// or when the device does not disclose the class.
pub fn derive_capabilities(
    session: &Session,
    handle: CK_OBJECT_HANDLE,
) -> TResult<Option<CapabilityRecord>> {
    let class = session
        .get_attribute_value(handle, &[CKA_CLASS])?
        .into_iter()
        .next()
        .flatten()
        .and_then(|raw| ulong_value(&raw));
    let Some(object_class) = class else {
        trace!("object {handle} has no readable class");
        return Ok(None);
    };
    let Some(key_class) = KeyObjectClass::from_ck_class(object_class) else {
        trace!("object {handle} has class {object_class:#x}, no capabilities");
        return Ok(None);
    };

    let attributes: Vec<_> = usage_attributes(key_class)
        .into_iter()
        .map(|(_, attribute)| attribute)
        .collect();
    if attributes.is_empty() {
        return Ok(usage_from_attributes(object_class, &HashMap::new()));
    }
    let values = session.get_attribute_value(handle, &attributes)?;
    let bits: HashMap<_, _> = attributes
        .iter()
        .zip(values)
        .filter_map(|(attribute, value)| {
            value
                .and_then(|raw| bool_value(&raw))
                .map(|bit| (*attribute, bit))
        })
        .collect();
    Ok(usage_from_attributes(object_class, &bits))
}

#[cfg(test)]
mod tests {
    use pkcs11_sys::{CKF_DECRYPT, CKF_ENCRYPT, CKF_HW, CKF_SIGN};

    use super::MechanismOperation;

    #[test]
    fn test_operations_from_flags() {
        let operations: Vec<_> =
            MechanismOperation::from_flags(CKF_HW | CKF_ENCRYPT | CKF_DECRYPT | CKF_SIGN)
                .map(|operation| operation.to_string())
                .collect();
        assert_eq!(operations, vec!["HW", "ENCRYPT", "DECRYPT", "SIGN"]);
        assert_eq!(MechanismOperation::from_flags(0).count(), 0);
    }
}
