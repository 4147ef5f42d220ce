//! Label based sessions, for callers that know the token label rather than a URI.

use std::sync::Arc;

use pkcs11_sys::CK_OBJECT_HANDLE;
use tracing::debug;

use crate::{
    TError, TResult,
    capabilities::KeyObjectClass,
    objects::{KeyIdent, ObjectLocator},
    runtime::{Pkcs11Runtime, UserType},
    session::Session,
    uri::{LocationAttribute, Locator},
};

/// Key id used when neither the token nor the caller provides one
const DEFAULT_KEY_ID: [u8; 1] = [0x01];
const DEFAULT_KEY_LABEL: &str = "default";

/// Labels of the tokens present, in slot order
pub fn list_token_labels(runtime: &dyn Pkcs11Runtime) -> TResult<Vec<String>> {
    runtime
        .get_slot_list(true)?
        .into_iter()
        .map(|slot_id| Ok(runtime.get_token_info(slot_id)?.label))
        .collect()
}

/// Open a read-write session on the token labelled `token_label`, or on the
/// first token present when no label is given, logging in when the token
/// requires it.
///
/// # Errors
/// * `NoMatchingSlot` if no token has the label
/// * `LoginRequiredNoPin` if the token requires a login and `pin` is `None`
pub fn open_token_session(
    runtime: Arc<dyn Pkcs11Runtime>,
    token_label: Option<&str>,
    pin: Option<&str>,
    user_type: UserType,
) -> TResult<Session> {
    let mut selected = None;
    for slot_id in runtime.get_slot_list(true)? {
        let token = runtime.get_token_info(slot_id)?;
        if token_label.is_none_or(|label| token.label.trim() == label.trim()) {
            selected = Some((slot_id, token.login_required()));
            break;
        }
    }
    let Some((slot_id, login_required)) = selected else {
        return Err(TError::NoMatchingSlot(format!(
            "no token labelled {}",
            token_label.unwrap_or_default()
        )));
    };
    debug!("Selected slot {slot_id} for token {token_label:?}");

    let mut session = Session::open(runtime, slot_id, true)?;
    if login_required {
        let pin = pin.ok_or(TError::LoginRequiredNoPin)?;
        session.login(user_type, pin)?;
    }
    Ok(session)
}

/// An administration session on a token, settled on the key being administered
pub struct TokenAdmin {
    session: Session,
    key_id: Vec<u8>,
    label: String,
}

impl TokenAdmin {
    /// Open a session as security officer, or as normal user when
    /// `user_type` says so, and settle on the key id and label.
    ///
    /// The first private key labelled `key_label` (or the first private key)
    /// supplies them; if there is none, or it lacks them, the given `key_id`,
    /// then `key_label`, then defaults are used.
    pub fn open(
        runtime: Arc<dyn Pkcs11Runtime>,
        token_label: Option<&str>,
        pin: Option<&str>,
        user_type: UserType,
        key_label: Option<&str>,
        key_id: Option<&[u8]>,
    ) -> TResult<Self> {
        let session = open_token_session(runtime, token_label, pin, user_type)?;
        let locator = key_label.map_or_else(Locator::default, |label| {
            Locator::default().with_location(LocationAttribute::Object, label)
        });
        let found = ObjectLocator::default().find_private_key(&session, &locator)?;
        let (found_id, found_label) = found.map_or((None, None), |key| (key.id, key.label));

        let key_id = found_id
            .or_else(|| key_id.map(<[u8]>::to_vec))
            .or_else(|| key_label.map(|label| label.as_bytes().to_vec()))
            .unwrap_or_else(|| DEFAULT_KEY_ID.to_vec());
        let label = found_label
            .or_else(|| key_label.map(str::to_owned))
            .unwrap_or_else(|| DEFAULT_KEY_LABEL.to_owned());
        debug!("Administering key {} ({label})", hex::encode(&key_id));
        Ok(Self {
            session,
            key_id,
            label,
        })
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn key_id(&self) -> &[u8] {
        &self.key_id
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn key_ident(&self) -> KeyIdent {
        KeyIdent::new(self.key_id.clone(), Some(self.label.clone()))
    }

    /// The object of `class` carrying the administered key id and label
    pub fn find(&self, class: KeyObjectClass) -> TResult<Option<CK_OBJECT_HANDLE>> {
        ObjectLocator::default().find_by_ident(&self.session, &self.key_ident(), class)
    }

    pub fn close(self) -> TResult<()> {
        self.session.close()
    }
}
