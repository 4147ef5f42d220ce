//! Object search on an open session.
//!
//! The search template is built from the `object`, `id` and `type` location
//! attributes. When several objects match, the first in device order wins and
//! the ambiguity is reported with the result, unless the strict policy is on.

use std::str::FromStr;

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_OBJECT_HANDLE, CKA_CLASS, CKA_ID, CKA_KEY_TYPE, CKA_LABEL, CKA_PRIVATE,
};
use tracing::{debug, warn};

use crate::{
    TError, TResult, TokenConfig,
    capabilities::{KeyObjectClass, ObjectClass, class_template},
    keys::KeyType,
    runtime::{Attribute, AttributeValue, bool_value, ulong_value},
    session::Session,
    uri::{LocationAttribute, Locator},
};

/// What to do when several objects match a template
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchPolicy {
    /// use the first handle in device order and report the ambiguity
    #[default]
    FirstMatch,
    /// fail with `AmbiguousObjectMatch`
    Strict,
}

/// Several objects matched a search; the first one was used
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbiguousMatch {
    pub candidates: usize,
    pub template: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundObject {
    pub handle: CK_OBJECT_HANDLE,
    /// `None` for objects that are not keys
    pub key_type: Option<KeyType>,
    pub id: Option<Vec<u8>>,
    pub ambiguity: Option<AmbiguousMatch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateKeyInfo {
    pub id: Option<Vec<u8>>,
    pub label: Option<String>,
    pub key_type: Option<KeyType>,
    pub handle: CK_OBJECT_HANDLE,
    pub ambiguity: Option<AmbiguousMatch>,
}

/// The search template of the object attributes of `locator`.
///
/// `forced_class` is the class the caller requires; a `type` attribute naming
/// another class is rejected rather than overridden.
pub fn object_template(
    locator: &Locator,
    forced_class: Option<ObjectClass>,
) -> TResult<Vec<Attribute>> {
    let requested_class = locator
        .location_str(LocationAttribute::Type)
        .map(|value| {
            ObjectClass::from_str(&value).map_err(|_| TError::UnknownObjectType(value.into_owned()))
        })
        .transpose()?;
    let class = match (forced_class, requested_class) {
        (Some(forced), Some(requested)) if forced != requested => {
            return Err(TError::ObjectClassMismatch {
                requested: requested.to_string(),
                expected: forced.to_string(),
            });
        }
        (forced, requested) => forced.or(requested),
    };

    let mut template = Vec::with_capacity(3);
    if let Some(class) = class {
        template.push(Attribute::ulong(CKA_CLASS, class.ck_class()));
    }
    if let Some(label) = locator.location_value(LocationAttribute::Object) {
        template.push(Attribute::bytes(CKA_LABEL, label));
    }
    if let Some(id) = locator.location_value(LocationAttribute::Id) {
        template.push(Attribute::bytes(CKA_ID, id));
    }
    Ok(template)
}

/// Readable form of a template, for logs and errors
fn describe_template(template: &[Attribute]) -> String {
    let mut description = String::new();
    for attribute in template {
        if !description.is_empty() {
            description.push(';');
        }
        let part = match attribute.kind {
            CKA_CLASS => match ulong_value(&attribute.value).and_then(ObjectClass::from_ck_class) {
                Some(class) => format!("type={class}"),
                None => format!("type={}", hex::encode(&attribute.value)),
            },
            CKA_LABEL => format!("object={}", String::from_utf8_lossy(&attribute.value)),
            CKA_ID => format!("id={}", hex::encode(&attribute.value)),
            CKA_PRIVATE => format!(
                "private={}",
                bool_value(&attribute.value).unwrap_or_default()
            ),
            kind => format!("{kind:#x}={}", hex::encode(&attribute.value)),
        };
        description.push_str(&part);
    }
    description
}

/// Searches objects with a match policy
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectLocator {
    policy: MatchPolicy,
}

impl ObjectLocator {
    #[must_use]
    pub const fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub const fn from_config(config: &TokenConfig) -> Self {
        Self::new(config.match_policy())
    }

    #[must_use]
    pub const fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Find the object designated by `locator`.
    ///
    /// # Errors
    /// * `ObjectNotFound` if nothing matches, or if the locator has no object attribute
    /// * `UnknownObjectType` / `ObjectClassMismatch` for a bad `type`
    /// * `AmbiguousObjectMatch` if several objects match under the strict policy
    pub fn find_object(
        &self,
        session: &Session,
        locator: &Locator,
        forced_class: Option<ObjectClass>,
    ) -> TResult<FoundObject> {
        let template = object_template(locator, forced_class)?;
        if template.is_empty() {
            return Err(TError::ObjectNotFound(
                "the URI carries no object attribute".to_owned(),
            ));
        }
        let Some((handle, ambiguity)) = self.search(session, &template)? else {
            return Err(TError::ObjectNotFound(describe_template(&template)));
        };
        let mut values = session
            .get_attribute_value(handle, &[CKA_KEY_TYPE, CKA_ID])?
            .into_iter();
        let key_type = values
            .next()
            .flatten()
            .as_deref()
            .and_then(ulong_value)
            .map(KeyType::from);
        let id = values.next().flatten();
        Ok(FoundObject {
            handle,
            key_type,
            id,
            ambiguity,
        })
    }

    /// Find the private key designated by `locator`.
    ///
    /// Returns `Ok(None)` when no private key matches. A locator without object
    /// attributes designates the first private key of the token.
    ///
    /// # Errors
    /// * `ObjectClassMismatch` if the locator `type` is not `private`
    pub fn find_private_key(
        &self,
        session: &Session,
        locator: &Locator,
    ) -> TResult<Option<PrivateKeyInfo>> {
        let template = object_template(locator, Some(ObjectClass::PrivateKey))?;
        let Some((handle, ambiguity)) = self.search(session, &template)? else {
            debug!("no private key matches {}", describe_template(&template));
            return Ok(None);
        };
        let mut values = session
            .get_attribute_value(handle, &[CKA_ID, CKA_LABEL, CKA_KEY_TYPE])?
            .into_iter();
        let id = values.next().flatten();
        let label = text_value(values.next().flatten());
        let key_type = values
            .next()
            .flatten()
            .as_deref()
            .and_then(ulong_value)
            .map(KeyType::from);
        Ok(Some(PrivateKeyInfo {
            id,
            label,
            key_type,
            handle,
            ambiguity,
        }))
    }

    /// Find the key or certificate of `class` identified by `ident`
    pub fn find_by_ident(
        &self,
        session: &Session,
        ident: &KeyIdent,
        class: KeyObjectClass,
    ) -> TResult<Option<CK_OBJECT_HANDLE>> {
        let template = ident.template(class);
        Ok(self.search(session, &template)?.map(|(handle, _)| handle))
    }

    fn search(
        &self,
        session: &Session,
        template: &[Attribute],
    ) -> TResult<Option<(CK_OBJECT_HANDLE, Option<AmbiguousMatch>)>> {
        let handles = session.find_objects(template)?;
        let Some(first) = handles.first().copied() else {
            return Ok(None);
        };
        if handles.len() == 1 {
            return Ok(Some((first, None)));
        }
        let ambiguity = AmbiguousMatch {
            candidates: handles.len(),
            template: describe_template(template),
        };
        if self.policy == MatchPolicy::Strict {
            return Err(TError::AmbiguousObjectMatch {
                candidates: ambiguity.candidates,
                template: ambiguity.template,
            });
        }
        warn!(
            "{} objects match {}, using the first one",
            ambiguity.candidates, ambiguity.template
        );
        Ok(Some((first, Some(ambiguity))))
    }
}

fn text_value(value: AttributeValue) -> Option<String> {
    value.map(|raw| {
        String::from_utf8_lossy(&raw)
            .trim_end_matches([' ', '\0'])
            .to_owned()
    })
}

/// The id, and optionally the label, shared by the objects of one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIdent {
    pub key_id: Vec<u8>,
    pub label: Option<String>,
}

impl KeyIdent {
    #[must_use]
    pub fn new(key_id: impl Into<Vec<u8>>, label: Option<String>) -> Self {
        Self {
            key_id: key_id.into(),
            label,
        }
    }

    /// The class head of `class` followed by the label and id
    #[must_use]
    pub fn template(&self, class: KeyObjectClass) -> Vec<Attribute> {
        let mut template = class_template(class);
        if let Some(label) = &self.label {
            template.push(Attribute::bytes(CKA_LABEL, label.as_bytes()));
        }
        template.push(Attribute::bytes(CKA_ID, self.key_id.clone()));
        template
    }

    /// The attribute types of [`Self::template`], in order
    #[must_use]
    pub fn template_kinds(&self, class: KeyObjectClass) -> Vec<CK_ATTRIBUTE_TYPE> {
        self.template(class)
            .iter()
            .map(|attribute| attribute.kind)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pkcs11_sys::{
        CK_ULONG, CKA_CLASS, CKA_ID, CKA_KEY_TYPE, CKA_LABEL, CKA_PRIVATE, CKO_PRIVATE_KEY,
        CKO_PUBLIC_KEY,
    };

    use super::{KeyIdent, describe_template, object_template};
    use crate::{
        TError, TResult,
        capabilities::{KeyObjectClass, ObjectClass},
        runtime::{Attribute, ulong_value},
        uri::Locator,
    };

    #[test]
    fn test_object_template() -> TResult<()> {
        let locator = Locator::parse("pkcs11:token=T;object=my%20key;id=%0a%0b;type=public")?;
        let template = object_template(&locator, None)?;
        assert_eq!(template.len(), 3);
        assert_eq!(template[0].kind, CKA_CLASS);
        assert_eq!(ulong_value(&template[0].value), Some(CKO_PUBLIC_KEY));
        assert_eq!(template[1], Attribute::bytes(CKA_LABEL, "my key"));
        assert_eq!(template[2], Attribute::bytes(CKA_ID, vec![0x0a, 0x0b]));
        assert_eq!(describe_template(&template), "type=public;object=my key;id=0a0b");
        Ok(())
    }

    #[test]
    fn test_forced_class() -> TResult<()> {
        let locator = Locator::parse("pkcs11:object=k")?;
        let template = object_template(&locator, Some(ObjectClass::PrivateKey))?;
        assert_eq!(ulong_value(&template[0].value), Some(CKO_PRIVATE_KEY));

        let locator = Locator::parse("pkcs11:object=k;type=private")?;
        assert_eq!(object_template(&locator, Some(ObjectClass::PrivateKey))?.len(), 2);

        let locator = Locator::parse("pkcs11:object=k;type=cert")?;
        assert!(matches!(
            object_template(&locator, Some(ObjectClass::PrivateKey)),
            Err(TError::ObjectClassMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_unknown_type() -> TResult<()> {
        let locator = Locator::parse("pkcs11:object=k;type=otp")?;
        assert!(matches!(
            object_template(&locator, None),
            Err(TError::UnknownObjectType(t)) if t == "otp"
        ));
        Ok(())
    }

    #[test]
    fn test_key_ident_template() {
        let ident = KeyIdent::new(vec![1], Some("signing".to_owned()));
        assert_eq!(
            ident.template_kinds(KeyObjectClass::Certificate),
            vec![CKA_CLASS, CKA_PRIVATE, CKA_LABEL, CKA_ID]
        );
        assert_eq!(
            KeyIdent::new(vec![1], None).template(KeyObjectClass::Public).len(),
            3
        );
    }

    #[test]
    fn test_describe_template_fallbacks() {
        // a vendor defined class has no type label
        let vendor_class: CK_ULONG = 0x8000_0001;
        let template = [
            Attribute::ulong(CKA_CLASS, vendor_class),
            Attribute::bool(CKA_PRIVATE, true),
            Attribute::bytes(CKA_KEY_TYPE, vec![0xff]),
        ];
        assert_eq!(
            describe_template(&template),
            format!(
                "type={};private=true;{CKA_KEY_TYPE:#x}=ff",
                hex::encode(vendor_class.to_ne_bytes())
            )
        );
        assert_eq!(describe_template(&[]), "");
    }
}
