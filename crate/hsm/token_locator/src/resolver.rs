//! Session resolution.
//!
//! A locator is resolved against live device state on every call:
//! the module is loaded, its library info checked, the first slot whose
//! slot and token info match the locator is selected, then a session is
//! opened on it and authenticated when the token requires a login.

use std::{path::Path, sync::Arc};

use pkcs11_sys::CK_SLOT_ID;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::{
    TError, TResult, TokenConfig,
    runtime::{
        DynamicModuleLoader, LibraryInfo, ModuleLoader, ModuleSource, Pkcs11Runtime, SlotInfo,
        TokenInfo, UserType,
    },
    session::{Session, SessionState},
    uri::{AttributeScope, LocationAttribute, Locator, QueryAttribute},
};

/// Supplies the PIN of the requested user when the URI carries none
pub trait PinProvider {
    fn pin(&self, user_type: UserType) -> Option<Zeroizing<String>>;
}

impl<F> PinProvider for F
where
    F: Fn(UserType) -> Option<String>,
{
    fn pin(&self, user_type: UserType) -> Option<Zeroizing<String>> {
        self(user_type).map(Zeroizing::new)
    }
}

/// A provider that never has a PIN
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPin;

impl PinProvider for NoPin {
    fn pin(&self, _user_type: UserType) -> Option<Zeroizing<String>> {
        None
    }
}

/// The slot chosen for a locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedSlot {
    pub slot_id: CK_SLOT_ID,
    pub login_required: bool,
    pub token: TokenInfo,
}

fn text(value: &[u8]) -> String {
    String::from_utf8_lossy(value).trim().to_owned()
}

fn describe_scope(locator: &Locator, scopes: &[AttributeScope]) -> String {
    locator
        .location_attributes()
        .filter(|(attribute, _)| scopes.contains(&attribute.scope()))
        .map(|(attribute, value)| format!("{attribute}={}", text(value)))
        .collect::<Vec<_>>()
        .join(";")
}

/// `major[.minor]` as numbers, a missing minor being `0`
fn parse_version(version: &str) -> Option<(u8, u8)> {
    let (major, minor) = version.split_once('.').unwrap_or((version, "0"));
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Check the library attributes of `locator` against the library info.
///
/// Only the attributes present in the locator are checked. A `library-version`
/// is compared as numbers: `2.06` is version 2.6 and `2` is version 2.0.
pub fn check_library(info: &LibraryInfo, locator: &Locator) -> TResult<()> {
    for (attribute, value) in locator.scoped_attributes(AttributeScope::Library) {
        let expected = text(value);
        let actual = match attribute {
            LocationAttribute::LibraryManufacturer => info.manufacturer_id.trim().to_owned(),
            LocationAttribute::LibraryDescription => info.library_description.trim().to_owned(),
            LocationAttribute::LibraryVersion => {
                if parse_version(&expected) == Some(info.library_version) {
                    continue;
                }
                format!("{}.{}", info.library_version.0, info.library_version.1)
            }
            _ => continue,
        };
        if expected != actual {
            return Err(TError::LibraryMismatch {
                attribute: attribute.to_string(),
                expected,
                actual,
            });
        }
    }
    Ok(())
}

fn slot_matches(
    locator: &Locator,
    slot_id: CK_SLOT_ID,
    slot: &SlotInfo,
    token: Option<&TokenInfo>,
) -> bool {
    locator
        .location_attributes()
        .filter(|(attribute, _)| {
            matches!(attribute.scope(), AttributeScope::Slot | AttributeScope::Token)
        })
        .all(|(attribute, value)| {
            let expected = text(value);
            let actual = match attribute {
                LocationAttribute::SlotDescription => Some(slot.slot_description.as_str()),
                LocationAttribute::SlotManufacturer => Some(slot.manufacturer_id.as_str()),
                LocationAttribute::SlotId => {
                    return expected.parse::<CK_SLOT_ID>().ok() == Some(slot_id);
                }
                LocationAttribute::Token => token.map(|t| t.label.as_str()),
                LocationAttribute::Manufacturer => token.map(|t| t.manufacturer_id.as_str()),
                LocationAttribute::Model => token.map(|t| t.model.as_str()),
                LocationAttribute::Serial => token.map(|t| t.serial_number.as_str()),
                _ => return true,
            };
            actual.is_some_and(|actual| actual.trim() == expected)
        })
}

/// Select the first slot whose slot and token info match every slot and token
/// attribute of `locator`, in enumeration order.
///
/// # Errors
/// * `NoMatchingSlot` if the locator has no slot or token attribute, or if no slot matches
pub fn select_slot(
    runtime: &dyn Pkcs11Runtime,
    locator: &Locator,
    token_present: bool,
) -> TResult<SelectedSlot> {
    if !locator.has_scope(AttributeScope::Slot) && !locator.has_scope(AttributeScope::Token) {
        return Err(TError::NoMatchingSlot(
            "the URI has no slot or token attribute".to_owned(),
        ));
    }
    for slot_id in runtime.get_slot_list(token_present)? {
        let slot = runtime.get_slot_info(slot_id)?;
        let token = match runtime.get_token_info(slot_id) {
            Ok(token) => Some(token),
            Err(e) => {
                trace!("no token info for slot {slot_id}: {e}");
                None
            }
        };
        if slot_matches(locator, slot_id, &slot, token.as_ref()) {
            let token = token.unwrap_or_default();
            debug!("Selected slot {slot_id}, token {:?}", token.label);
            return Ok(SelectedSlot {
                slot_id,
                login_required: token.login_required(),
                token,
            });
        }
    }
    Err(TError::NoMatchingSlot(describe_scope(
        locator,
        &[AttributeScope::Slot, AttributeScope::Token],
    )))
}

fn check_session_state(session: &Session, locator: &Locator) -> TResult<()> {
    let Some(expected) = locator.location_str(LocationAttribute::SessionState) else {
        return Ok(());
    };
    let expected = expected.trim();
    let state = session.info()?.state;
    let actual = SessionState::from_ck_state(state)
        .map_or_else(|| format!("{state:#x}"), |state| state.to_string());
    if actual != expected {
        return Err(TError::SessionAttributeMismatch {
            attribute: LocationAttribute::SessionState.to_string(),
            expected: expected.to_owned(),
            actual,
        });
    }
    Ok(())
}

fn query_str(locator: &Locator, attribute: QueryAttribute) -> TResult<Option<&str>> {
    locator
        .query_value(attribute)
        .map(|value| {
            std::str::from_utf8(value)
                .map_err(|_| TError::MalformedLocator(format!("{attribute} is not valid UTF-8")))
        })
        .transpose()
}

/// The first line of the file designated by a `pin-source` value
fn read_pin_source(source: &str) -> TResult<Zeroizing<String>> {
    let path = source
        .strip_prefix("file://")
        .or_else(|| source.strip_prefix("file:"))
        .unwrap_or(source);
    let content = Zeroizing::new(std::fs::read_to_string(path)?);
    Ok(Zeroizing::new(
        content.lines().next().unwrap_or_default().to_owned(),
    ))
}

/// `pin-value`, then `pin-source`, then the provider
fn resolve_pin(
    locator: &Locator,
    user_type: UserType,
    pin_provider: &dyn PinProvider,
) -> TResult<Option<Zeroizing<String>>> {
    if let Some(pin) = query_str(locator, QueryAttribute::PinValue)? {
        return Ok(Some(Zeroizing::new(pin.to_owned())));
    }
    if let Some(source) = query_str(locator, QueryAttribute::PinSource)? {
        debug!("Reading PIN from {source}");
        return read_pin_source(source).map(Some);
    }
    Ok(pin_provider.pin(user_type))
}

/// Resolves locators to open sessions
#[derive(Clone)]
pub struct SessionResolver {
    loader: Arc<dyn ModuleLoader>,
    config: TokenConfig,
}

impl SessionResolver {
    #[must_use]
    pub fn new(loader: Arc<dyn ModuleLoader>, config: TokenConfig) -> Self {
        Self { loader, config }
    }

    /// A resolver loading modules from the file system
    #[must_use]
    pub fn from_config(config: TokenConfig) -> Self {
        Self::new(Arc::new(DynamicModuleLoader::new(config.clone())), config)
    }

    #[must_use]
    pub const fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Load the module named by `module-path` or `module-name`, or the default one
    pub fn load_runtime(&self, locator: &Locator) -> TResult<Arc<dyn Pkcs11Runtime>> {
        let source = if let Some(path) = query_str(locator, QueryAttribute::ModulePath)? {
            ModuleSource::Path(Path::new(path))
        } else if let Some(name) = query_str(locator, QueryAttribute::ModuleName)? {
            ModuleSource::Name(name)
        } else {
            ModuleSource::Default
        };
        debug!("Loading module from {source:?}");
        self.loader.load(source)
    }

    /// Open a session on the slot designated by `locator`.
    ///
    /// The session is read-write. When the token requires a login and
    /// `authenticate` is set, `user_type` logs in with the PIN from the URI or
    /// from `pin_provider`.
    ///
    /// # Errors
    /// Any session opened on the way is closed before an error is returned.
    pub fn resolve(
        &self,
        locator: &Locator,
        authenticate: bool,
        user_type: UserType,
        pin_provider: &dyn PinProvider,
    ) -> TResult<Session> {
        let runtime = self.load_runtime(locator)?;
        let info = runtime.get_info()?;
        trace!("Library info:\n{info}");
        check_library(&info, locator)?;

        let selected = select_slot(runtime.as_ref(), locator, !self.config.all_slots)?;
        let mut session = Session::open(runtime, selected.slot_id, true)?;
        check_session_state(&session, locator)?;

        if selected.login_required && authenticate {
            let pin = resolve_pin(locator, user_type, pin_provider)?
                .ok_or(TError::LoginRequiredNoPin)?;
            session.login(user_type, &pin)?;
        }
        Ok(session)
    }
}
