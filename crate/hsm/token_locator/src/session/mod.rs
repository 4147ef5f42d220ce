mod session_impl;

use pkcs11_sys::{
    CK_STATE, CKS_RO_PUBLIC_SESSION, CKS_RO_USER_FUNCTIONS, CKS_RW_PUBLIC_SESSION,
    CKS_RW_SO_FUNCTIONS, CKS_RW_USER_FUNCTIONS,
};
pub use session_impl::Session;
use strum::{Display, EnumString};

use crate::runtime::UserType;

/// Who is logged in on a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoginState {
    #[default]
    NotLoggedIn,
    User,
    SecurityOfficer,
}

impl From<UserType> for LoginState {
    fn from(user_type: UserType) -> Self {
        match user_type {
            UserType::User => Self::User,
            UserType::SecurityOfficer => Self::SecurityOfficer,
        }
    }
}

/// Session states, named as in the `session-state` URI attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum SessionState {
    #[strum(to_string = "ro-public")]
    ReadOnlyPublic,
    #[strum(to_string = "ro-user")]
    ReadOnlyUser,
    #[strum(to_string = "rw-public")]
    ReadWritePublic,
    #[strum(to_string = "rw-user")]
    ReadWriteUser,
    #[strum(to_string = "rw-so")]
    ReadWriteSecurityOfficer,
}

impl SessionState {
    #[must_use]
    pub const fn from_ck_state(state: CK_STATE) -> Option<Self> {
        match state {
            CKS_RO_PUBLIC_SESSION => Some(Self::ReadOnlyPublic),
            CKS_RO_USER_FUNCTIONS => Some(Self::ReadOnlyUser),
            CKS_RW_PUBLIC_SESSION => Some(Self::ReadWritePublic),
            CKS_RW_USER_FUNCTIONS => Some(Self::ReadWriteUser),
            CKS_RW_SO_FUNCTIONS => Some(Self::ReadWriteSecurityOfficer),
            _ => None,
        }
    }

    #[must_use]
    pub const fn ck_state(self) -> CK_STATE {
        match self {
            Self::ReadOnlyPublic => CKS_RO_PUBLIC_SESSION,
            Self::ReadOnlyUser => CKS_RO_USER_FUNCTIONS,
            Self::ReadWritePublic => CKS_RW_PUBLIC_SESSION,
            Self::ReadWriteUser => CKS_RW_USER_FUNCTIONS,
            Self::ReadWriteSecurityOfficer => CKS_RW_SO_FUNCTIONS,
        }
    }
}
