//! Opening a token key and handing it to an algorithm specific adapter.
//!
//! The adapters themselves (EC, RSA signing or decryption objects) live outside
//! this crate: a [`KeyAdapterFactory`] turns a found private key into a
//! [`KeyAdapter`], which is then told every mechanism the slot supports.

use std::{fmt, sync::Arc};

use pkcs11_sys::{CK_KEY_TYPE, CK_MECHANISM_TYPE, CKK_EC, CKK_RSA};
use tracing::debug;

use crate::{
    TError, TResult,
    admin::open_token_session,
    mechanisms::{MechanismDescriptor, MechanismOperation},
    objects::{MatchPolicy, ObjectLocator, PrivateKeyInfo},
    resolver::{PinProvider, SessionResolver},
    runtime::{Pkcs11Runtime, UserType},
    session::Session,
    uri::{LocationAttribute, Locator},
};

/// Key types with a known adapter family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Ec,
    Rsa,
    Other(CK_KEY_TYPE),
}

impl From<CK_KEY_TYPE> for KeyType {
    fn from(key_type: CK_KEY_TYPE) -> Self {
        match key_type {
            CKK_EC => Self::Ec,
            CKK_RSA => Self::Rsa,
            other => Self::Other(other),
        }
    }
}

impl KeyType {
    #[must_use]
    pub const fn ck_key_type(self) -> CK_KEY_TYPE {
        match self {
            Self::Ec => CKK_EC,
            Self::Rsa => CKK_RSA,
            Self::Other(key_type) => key_type,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ec => write!(f, "EC"),
            Self::Rsa => write!(f, "RSA"),
            Self::Other(key_type) => write!(f, "{key_type:#x}"),
        }
    }
}

/// An algorithm specific object wrapping a private key handle
pub trait KeyAdapter: Send {
    /// Record that the slot supports `operation` with `mechanism`
    fn fill_operation(&mut self, descriptor: MechanismDescriptor);
}

/// Builds the adapter of a private key, or `None` when its key type is not supported
pub trait KeyAdapterFactory {
    fn create(
        &self,
        session: &Session,
        key: &PrivateKeyInfo,
    ) -> TResult<Option<Box<dyn KeyAdapter>>>;
}

/// The operations a slot supports, per mechanism, in enumeration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupportedOperations {
    descriptors: Vec<MechanismDescriptor>,
}

impl SupportedOperations {
    #[must_use]
    pub fn descriptors(&self) -> &[MechanismDescriptor] {
        &self.descriptors
    }

    #[must_use]
    pub fn supports(&self, mechanism: CK_MECHANISM_TYPE, operation: MechanismOperation) -> bool {
        self.descriptors
            .iter()
            .any(|d| d.mechanism == mechanism && d.operation == operation)
    }

    /// The operations of `mechanism`
    pub fn operations(
        &self,
        mechanism: CK_MECHANISM_TYPE,
    ) -> impl Iterator<Item = MechanismOperation> + '_ {
        self.descriptors
            .iter()
            .filter(move |d| d.mechanism == mechanism)
            .map(|d| d.operation)
    }

    /// The mechanisms supporting `operation`
    pub fn mechanisms(
        &self,
        operation: MechanismOperation,
    ) -> impl Iterator<Item = CK_MECHANISM_TYPE> + '_ {
        self.descriptors
            .iter()
            .filter(move |d| d.operation == operation)
            .map(|d| d.mechanism)
    }
}

impl KeyAdapter for SupportedOperations {
    fn fill_operation(&mut self, descriptor: MechanismDescriptor) {
        self.descriptors.push(descriptor);
    }
}

/// A private key on an open session, with its adapter.
///
/// The adapter is dropped before the session is closed.
pub struct TokenKey {
    adapter: Box<dyn KeyAdapter>,
    key: PrivateKeyInfo,
    session: Session,
}

impl TokenKey {
    #[must_use]
    pub fn adapter(&self) -> &dyn KeyAdapter {
        self.adapter.as_ref()
    }

    pub fn adapter_mut(&mut self) -> &mut dyn KeyAdapter {
        self.adapter.as_mut()
    }

    #[must_use]
    pub const fn key(&self) -> &PrivateKeyInfo {
        &self.key
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    pub fn close(self) -> TResult<()> {
        let Self {
            adapter, session, ..
        } = self;
        drop(adapter);
        session.close()
    }
}

fn attach_adapter(
    session: Session,
    locator: &Locator,
    policy: MatchPolicy,
    factory: &dyn KeyAdapterFactory,
) -> TResult<Option<TokenKey>> {
    let key = ObjectLocator::new(policy)
        .find_private_key(&session, locator)?
        .ok_or_else(|| TError::ObjectNotFound(format!("no private key matches {locator}")))?;
    let Some(mut adapter) = factory.create(&session, &key)? else {
        debug!(
            "No adapter for key type {}",
            key.key_type.map_or_else(|| "unknown".to_owned(), |t| t.to_string())
        );
        return Ok(None);
    };
    for descriptor in &session.mechanisms() {
        adapter.fill_operation(descriptor?);
    }
    Ok(Some(TokenKey {
        adapter,
        key,
        session,
    }))
}

/// Resolve `locator` to the private key it designates and build its adapter.
///
/// Returns `Ok(None)`, with the session closed, when the factory has no adapter
/// for the key type.
///
/// # Errors
/// * any resolution error
/// * `ObjectNotFound` if no private key matches
pub fn open_token_key(
    resolver: &SessionResolver,
    locator: &Locator,
    pin_provider: &dyn PinProvider,
    factory: &dyn KeyAdapterFactory,
) -> TResult<Option<TokenKey>> {
    let session = resolver.resolve(locator, true, UserType::User, pin_provider)?;
    attach_adapter(session, locator, resolver.config().match_policy(), factory)
}

/// Open the private key labelled `key_label` (or the first private key) of the
/// token labelled `token_label` (or the first token) and build its adapter
pub fn open_labelled_token_key(
    runtime: Arc<dyn Pkcs11Runtime>,
    token_label: Option<&str>,
    pin: Option<&str>,
    key_label: Option<&str>,
    factory: &dyn KeyAdapterFactory,
) -> TResult<Option<TokenKey>> {
    let session = open_token_session(runtime, token_label, pin, UserType::User)?;
    let locator = key_label.map_or_else(Locator::default, |label| {
        Locator::default().with_location(LocationAttribute::Object, label)
    });
    attach_adapter(session, &locator, MatchPolicy::FirstMatch, factory)
}
