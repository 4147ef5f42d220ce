use std::sync::Arc;

use pkcs11_sys::CKK_EC;

use super::mock::{MockObject, MockRuntime, MockSlot, SO_PIN, USER_PIN};
use crate::{
    KeyObjectClass, LoginState, Pkcs11Runtime, TError, TResult, TokenAdmin, UserType,
    list_token_labels, open_token_session,
};

fn tokens() -> Vec<MockSlot> {
    vec![
        MockSlot::new(1, "First"),
        MockSlot::new(2, "Gone").without_token(),
        MockSlot::new(3, "Admin")
            .login_required()
            .with_object(MockObject::private_key(30, "managed", &[0x42], CKK_EC))
            .with_object(MockObject::public_key(31, "managed", &[0x42], CKK_EC)),
        MockSlot::new(4, "Empty").login_required(),
    ]
}

fn runtime() -> (Arc<MockRuntime>, Arc<dyn Pkcs11Runtime>) {
    cosmian_logger::log_init(None);
    let runtime = MockRuntime::arc(tokens());
    let dyn_runtime = runtime.clone() as Arc<dyn Pkcs11Runtime>;
    (runtime, dyn_runtime)
}

#[test]
fn test_list_token_labels() -> TResult<()> {
    let (_, runtime) = runtime();
    assert_eq!(
        list_token_labels(runtime.as_ref())?,
        vec!["First", "Admin", "Empty"]
    );
    Ok(())
}

#[test]
fn test_open_token_session() -> TResult<()> {
    let (mock, runtime) = runtime();

    let session = open_token_session(runtime.clone(), None, None, UserType::User)?;
    assert_eq!(session.slot_id(), 1);
    assert_eq!(session.login_state(), LoginState::NotLoggedIn);
    drop(session);

    let session = open_token_session(
        runtime.clone(),
        Some("Admin"),
        Some(USER_PIN),
        UserType::User,
    )?;
    assert_eq!(session.slot_id(), 3);
    assert_eq!(session.login_state(), LoginState::User);
    drop(session);

    assert!(matches!(
        open_token_session(runtime.clone(), Some("Admin"), None, UserType::User),
        Err(TError::LoginRequiredNoPin)
    ));
    assert!(matches!(
        open_token_session(runtime, Some("Nowhere"), None, UserType::User),
        Err(TError::NoMatchingSlot(_))
    ));
    assert_eq!(mock.open_sessions(), 0);
    Ok(())
}

#[test]
fn test_token_admin_uses_the_found_key() -> TResult<()> {
    let (mock, runtime) = runtime();

    let admin = TokenAdmin::open(
        runtime,
        Some("Admin"),
        Some(SO_PIN),
        UserType::SecurityOfficer,
        None,
        Some(b"ignored"),
    )?;
    assert_eq!(admin.session().login_state(), LoginState::SecurityOfficer);
    assert_eq!(admin.key_id(), [0x42]);
    assert_eq!(admin.label(), "managed");
    assert_eq!(admin.find(KeyObjectClass::Public)?, Some(31));
    assert_eq!(admin.find(KeyObjectClass::Certificate)?, None);
    admin.close()?;
    assert_eq!(mock.open_sessions(), 0);
    Ok(())
}

#[test]
fn test_token_admin_fallbacks() -> TResult<()> {
    let (_, runtime) = runtime();

    let admin = TokenAdmin::open(
        runtime.clone(),
        Some("Empty"),
        Some(SO_PIN),
        UserType::SecurityOfficer,
        None,
        None,
    )?;
    assert_eq!(admin.key_id(), [0x01]);
    assert_eq!(admin.label(), "default");
    drop(admin);

    let admin = TokenAdmin::open(
        runtime.clone(),
        Some("Empty"),
        Some(SO_PIN),
        UserType::SecurityOfficer,
        Some("new-key"),
        None,
    )?;
    assert_eq!(admin.key_id(), b"new-key");
    assert_eq!(admin.label(), "new-key");
    drop(admin);

    let admin = TokenAdmin::open(
        runtime,
        Some("Empty"),
        Some(USER_PIN),
        UserType::User,
        Some("new-key"),
        Some(&[0x07]),
    )?;
    assert_eq!(admin.session().login_state(), LoginState::User);
    assert_eq!(admin.key_id(), [0x07]);
    assert_eq!(admin.label(), "new-key");
    Ok(())
}
