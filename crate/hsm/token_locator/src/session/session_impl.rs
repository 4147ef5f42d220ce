//! An open PKCS#11 session.
//!
//! The session owns its handle: dropping it logs out if it performed the login and
//! closes the handle, whichever way the caller leaves.

use std::{cell::Cell, marker::PhantomData, sync::Arc};

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID,
    CKF_RW_SESSION, CKF_SERIAL_SESSION, CKR_USER_ALREADY_LOGGED_IN,
};
use tracing::{debug, warn};

use crate::{
    TError, TResult,
    mechanisms::Mechanisms,
    runtime::{Attribute, AttributeValue, Pkcs11Runtime, SessionInfo, UserType},
    session::LoginState,
};

/// A session on one slot of a loaded module.
///
/// A session may move between threads but is never shared by them:
/// at most one call is in flight on a handle.
pub struct Session {
    runtime: Arc<dyn Pkcs11Runtime>,
    handle: CK_SESSION_HANDLE,
    slot_id: CK_SLOT_ID,
    login_state: LoginState,
    // false when the user was already logged in by another session
    owns_login: bool,
    closed: bool,
    _not_sync: PhantomData<Cell<()>>,
}

impl Session {
    /// Open a serial session on `slot_id`, read-write when `read_write` is set
    pub fn open(
        runtime: Arc<dyn Pkcs11Runtime>,
        slot_id: CK_SLOT_ID,
        read_write: bool,
    ) -> TResult<Self> {
        let flags: CK_FLAGS = if read_write {
            CKF_SERIAL_SESSION | CKF_RW_SESSION
        } else {
            CKF_SERIAL_SESSION
        };
        let handle = runtime.open_session(slot_id, flags)?;
        debug!("Session {handle} opened on slot {slot_id}, read-write: {read_write}");
        Ok(Self {
            runtime,
            handle,
            slot_id,
            login_state: LoginState::NotLoggedIn,
            owns_login: false,
            closed: false,
            _not_sync: PhantomData,
        })
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn Pkcs11Runtime> {
        &self.runtime
    }

    #[must_use]
    pub const fn handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    #[must_use]
    pub const fn slot_id(&self) -> CK_SLOT_ID {
        self.slot_id
    }

    /// The user this session logged in as, or found logged in.
    ///
    /// Logins are token-wide: when another session performed the login and
    /// logs out first, this value is stale. [`Self::info`] reads the live state.
    #[must_use]
    pub const fn login_state(&self) -> LoginState {
        self.login_state
    }

    /// Whether this session performed its login, and so logs out on close
    #[must_use]
    pub const fn owns_login(&self) -> bool {
        self.owns_login
    }

    pub fn info(&self) -> TResult<SessionInfo> {
        self.runtime.get_session_info(self.handle)
    }

    /// Log `user_type` in.
    ///
    /// A login rejected because the user is already logged in on the token
    /// (another session of the application) is not an error. The session then
    /// does not own the login and leaves it in place on close.
    pub fn login(&mut self, user_type: UserType, pin: &str) -> TResult<()> {
        self.owns_login = match self.runtime.login(self.handle, user_type, pin) {
            Ok(()) => true,
            Err(e) if e.rv() == Some(CKR_USER_ALREADY_LOGGED_IN) => {
                warn!("user already logged in on slot {}, ignoring login", self.slot_id);
                false
            }
            Err(e) => return Err(TError::LoginFailure(e.to_string())),
        };
        debug!("Logged in as {user_type:?} on session {}", self.handle);
        self.login_state = LoginState::from(user_type);
        Ok(())
    }

    pub fn find_objects(&self, template: &[Attribute]) -> TResult<Vec<CK_OBJECT_HANDLE>> {
        self.runtime.find_objects(self.handle, template)
    }

    pub fn get_attribute_value(
        &self,
        object: CK_OBJECT_HANDLE,
        attributes: &[CK_ATTRIBUTE_TYPE],
    ) -> TResult<Vec<AttributeValue>> {
        self.runtime
            .get_attribute_value(self.handle, object, attributes)
    }

    /// The mechanisms of the session slot
    #[must_use]
    pub fn mechanisms(&self) -> Mechanisms {
        Mechanisms::new(self.runtime.clone(), self.slot_id)
    }

    /// Log out and close, reporting the close failure
    pub fn close(mut self) -> TResult<()> {
        self.close_()
    }

    fn close_(&mut self) -> TResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.owns_login {
            if let Err(e) = self.runtime.logout(self.handle) {
                warn!("Failed logging out of session {}: {e}", self.handle);
            }
        }
        self.login_state = LoginState::NotLoggedIn;
        self.runtime.close_session(self.handle)?;
        debug!("Session {} closed", self.handle);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close_() {
            warn!("{e}");
        }
    }
}
