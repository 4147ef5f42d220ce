use std::{ffi::c_void, ptr};

use libloading::Library;
use pkcs11_sys::*;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::{
    TError, TResult,
    runtime::{
        Attribute, AttributeValue, LibraryInfo, MechanismInfo, Pkcs11Runtime, SessionInfo,
        SlotInfo, TokenInfo, UserType,
    },
    token_ensure, token_error,
};

/// Value of `ulValueLen` for an attribute the object does not expose (`CK_UNAVAILABLE_INFORMATION`)
const UNAVAILABLE_INFORMATION: CK_ULONG = CK_ULONG::MAX;

/// Object handles fetched per `C_FindObjects` call
const FIND_BATCH_SIZE: usize = 64;

/// Call a PKCS#11 function of the library and bail out on anything but `CKR_OK`
macro_rules! hsm_call {
    ($hsm:expr, $context:expr, $function:ident $(, $arg:expr)* $(,)?) => {{
        let rv = unsafe {
            $hsm.$function.ok_or_else(|| {
                token_error!("{} not available on library", stringify!($function))
            })?($($arg),*)
        };
        if rv != CKR_OK {
            return Err(TError::Pkcs11 {
                context: ($context).to_string(),
                rv,
            });
        }
    }};
}

/// A PKCS#11 module loaded with `libloading`.
///
/// The module is initialized with OS locking on load and finalized on drop,
/// unless another handle in the process had already initialized it.
/// [`crate::ModuleRegistry`] keeps one instance per module path, so the drop
/// only happens once no resolver or session holds the module.
pub struct HsmLib {
    _library: Library,
    owns_initialization: bool,
    C_Initialize: CK_C_Initialize,
    C_Finalize: CK_C_Finalize,
    C_GetInfo: CK_C_GetInfo,
    C_GetSlotList: CK_C_GetSlotList,
    C_GetSlotInfo: CK_C_GetSlotInfo,
    C_GetTokenInfo: CK_C_GetTokenInfo,
    C_GetMechanismList: CK_C_GetMechanismList,
    C_GetMechanismInfo: CK_C_GetMechanismInfo,
    C_OpenSession: CK_C_OpenSession,
    C_CloseSession: CK_C_CloseSession,
    C_GetSessionInfo: CK_C_GetSessionInfo,
    C_Login: CK_C_Login,
    C_Logout: CK_C_Logout,
    C_FindObjectsInit: CK_C_FindObjectsInit,
    C_FindObjects: CK_C_FindObjects,
    C_FindObjectsFinal: CK_C_FindObjectsFinal,
    C_GetAttributeValue: CK_C_GetAttributeValue,
}

impl HsmLib {
    /// Load the module at `path` and initialize it.
    ///
    /// # Errors
    /// * the library cannot be loaded or lacks one of the required functions
    /// * `C_Initialize` fails
    pub fn instantiate<P>(path: P) -> TResult<Self>
    where
        P: AsRef<std::ffi::OsStr>,
    {
        unsafe {
            let library = Library::new(path.as_ref())?;
            let mut hsm_lib = Self {
                owns_initialization: false,
                C_Initialize: Some(*library.get(b"C_Initialize")?),
                C_Finalize: Some(*library.get(b"C_Finalize")?),
                C_GetInfo: Some(*library.get(b"C_GetInfo")?),
                C_GetSlotList: Some(*library.get(b"C_GetSlotList")?),
                C_GetSlotInfo: Some(*library.get(b"C_GetSlotInfo")?),
                C_GetTokenInfo: Some(*library.get(b"C_GetTokenInfo")?),
                C_GetMechanismList: Some(*library.get(b"C_GetMechanismList")?),
                C_GetMechanismInfo: Some(*library.get(b"C_GetMechanismInfo")?),
                C_OpenSession: Some(*library.get(b"C_OpenSession")?),
                C_CloseSession: Some(*library.get(b"C_CloseSession")?),
                C_GetSessionInfo: Some(*library.get(b"C_GetSessionInfo")?),
                C_Login: Some(*library.get(b"C_Login")?),
                C_Logout: Some(*library.get(b"C_Logout")?),
                C_FindObjectsInit: Some(*library.get(b"C_FindObjectsInit")?),
                C_FindObjects: Some(*library.get(b"C_FindObjects")?),
                C_FindObjectsFinal: Some(*library.get(b"C_FindObjectsFinal")?),
                C_GetAttributeValue: Some(*library.get(b"C_GetAttributeValue")?),
                // we need to keep the library alive
                _library: library,
            };
            hsm_lib.owns_initialization = hsm_lib.initialize()?;
            Ok(hsm_lib)
        }
    }

    /// Returns whether this handle performed the initialization
    fn initialize(&self) -> TResult<bool> {
        let init_args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        let rv = unsafe {
            let initialize = self
                .C_Initialize
                .ok_or_else(|| token_error!("C_Initialize not available on library"))?;
            initialize(ptr::from_ref(&init_args).cast_mut().cast::<c_void>())
        };
        match rv {
            CKR_OK => Ok(true),
            CKR_CRYPTOKI_ALREADY_INITIALIZED => {
                warn!("PKCS#11 module already initialized in this process");
                Ok(false)
            }
            rv => Err(TError::Pkcs11 {
                context: "Failed initializing the PKCS#11 module".to_owned(),
                rv,
            }),
        }
    }

    fn finalize(&self) -> TResult<()> {
        hsm_call!(
            self,
            "Failed to finalize the PKCS#11 module",
            C_Finalize,
            ptr::null_mut()
        );
        Ok(())
    }

    fn collect_found_objects(
        &self,
        session: CK_SESSION_HANDLE,
    ) -> TResult<Vec<CK_OBJECT_HANDLE>> {
        let mut object_handles = Vec::new();
        let mut handles_buf = vec![CK_OBJECT_HANDLE::default(); FIND_BATCH_SIZE];
        let batch_size = CK_ULONG::try_from(FIND_BATCH_SIZE)?;
        loop {
            let mut object_count: CK_ULONG = 0;
            hsm_call!(
                self,
                "Failed to find objects",
                C_FindObjects,
                session,
                handles_buf.as_mut_ptr(),
                batch_size,
                &raw mut object_count
            );
            if object_count == 0 {
                break;
            }
            let count = usize::try_from(object_count)?;
            token_ensure!(
                count <= handles_buf.len(),
                "C_FindObjects returned {count} objects, at most {FIND_BATCH_SIZE} requested"
            );
            object_handles.extend_from_slice(&handles_buf[..count]);
        }
        trace!("Found {} objects", object_handles.len());
        Ok(object_handles)
    }

    fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> TResult<()> {
        hsm_call!(
            self,
            "Failed to finalize object search",
            C_FindObjectsFinal,
            session
        );
        Ok(())
    }

    /// `C_GetAttributeValue` tolerating sensitive and invalid attributes,
    /// which come back with an unavailable length
    fn call_get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: &mut [CK_ATTRIBUTE],
    ) -> TResult<()> {
        let get_attribute_value = self
            .C_GetAttributeValue
            .ok_or_else(|| token_error!("C_GetAttributeValue not available on library"))?;
        let count = CK_ULONG::try_from(template.len())?;
        let rv = unsafe { get_attribute_value(session, object, template.as_mut_ptr(), count) };
        match rv {
            CKR_OK | CKR_ATTRIBUTE_SENSITIVE | CKR_ATTRIBUTE_TYPE_INVALID => Ok(()),
            rv => Err(TError::Pkcs11 {
                context: format!("Failed to get the attributes of object {object}"),
                rv,
            }),
        }
    }
}

impl Drop for HsmLib {
    fn drop(&mut self) {
        if self.owns_initialization {
            if let Err(e) = self.finalize() {
                warn!("{e}");
            }
        }
    }
}

/// PKCS#11 info strings are blank padded, not NUL terminated
fn padded_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches([' ', '\0'])
        .to_owned()
}

impl Pkcs11Runtime for HsmLib {
    fn get_info(&self) -> TResult<LibraryInfo> {
        let mut info = CK_INFO::default();
        hsm_call!(self, "Failed getting the library info", C_GetInfo, &raw mut info);
        Ok(LibraryInfo {
            cryptoki_version: (info.cryptokiVersion.major, info.cryptokiVersion.minor),
            manufacturer_id: padded_string(&info.manufacturerID),
            flags: info.flags,
            library_description: padded_string(&info.libraryDescription),
            library_version: (info.libraryVersion.major, info.libraryVersion.minor),
        })
    }

    fn get_slot_list(&self, token_present: bool) -> TResult<Vec<CK_SLOT_ID>> {
        let token_present: CK_BBOOL = if token_present { CK_TRUE } else { CK_FALSE };
        let mut count: CK_ULONG = 0;
        hsm_call!(
            self,
            "Failed counting slots",
            C_GetSlotList,
            token_present,
            ptr::null_mut(),
            &raw mut count
        );
        let mut slots = vec![CK_SLOT_ID::default(); usize::try_from(count)?];
        hsm_call!(
            self,
            "Failed listing slots",
            C_GetSlotList,
            token_present,
            slots.as_mut_ptr(),
            &raw mut count
        );
        slots.truncate(usize::try_from(count)?);
        Ok(slots)
    }

    fn get_slot_info(&self, slot_id: CK_SLOT_ID) -> TResult<SlotInfo> {
        let mut info = CK_SLOT_INFO::default();
        hsm_call!(
            self,
            format!("Failed getting info of slot {slot_id}"),
            C_GetSlotInfo,
            slot_id,
            &raw mut info
        );
        Ok(SlotInfo {
            slot_description: padded_string(&info.slotDescription),
            manufacturer_id: padded_string(&info.manufacturerID),
            flags: info.flags,
        })
    }

    fn get_token_info(&self, slot_id: CK_SLOT_ID) -> TResult<TokenInfo> {
        let mut info = CK_TOKEN_INFO::default();
        hsm_call!(
            self,
            format!("Failed getting token info of slot {slot_id}"),
            C_GetTokenInfo,
            slot_id,
            &raw mut info
        );
        Ok(TokenInfo {
            label: padded_string(&info.label),
            manufacturer_id: padded_string(&info.manufacturerID),
            model: padded_string(&info.model),
            serial_number: padded_string(&info.serialNumber),
            flags: info.flags,
        })
    }

    fn open_session(&self, slot_id: CK_SLOT_ID, flags: CK_FLAGS) -> TResult<CK_SESSION_HANDLE> {
        let mut session_handle: CK_SESSION_HANDLE = 0;
        hsm_call!(
            self,
            format!("Failed opening a session on slot {slot_id}"),
            C_OpenSession,
            slot_id,
            flags,
            ptr::null_mut(),
            None,
            &raw mut session_handle
        );
        debug!("Opened session {session_handle} on slot {slot_id}");
        Ok(session_handle)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> TResult<()> {
        hsm_call!(self, "Failed closing a session", C_CloseSession, session);
        Ok(())
    }

    fn get_session_info(&self, session: CK_SESSION_HANDLE) -> TResult<SessionInfo> {
        let mut info = CK_SESSION_INFO::default();
        hsm_call!(
            self,
            "Failed getting the session info",
            C_GetSessionInfo,
            session,
            &raw mut info
        );
        Ok(SessionInfo {
            slot_id: info.slotID,
            state: info.state,
            flags: info.flags,
            device_error: info.ulDeviceError,
        })
    }

    fn login(&self, session: CK_SESSION_HANDLE, user_type: UserType, pin: &str) -> TResult<()> {
        let mut pin_bytes = Zeroizing::new(pin.as_bytes().to_vec());
        let pin_len = CK_ULONG::try_from(pin_bytes.len())?;
        hsm_call!(
            self,
            "Failed logging in",
            C_Login,
            session,
            user_type.ck_user_type(),
            pin_bytes.as_mut_ptr(),
            pin_len
        );
        Ok(())
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> TResult<()> {
        hsm_call!(self, "Failed logging out", C_Logout, session);
        Ok(())
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> TResult<Vec<CK_OBJECT_HANDLE>> {
        // the module only reads the template values
        let mut ck_template = template
            .iter()
            .map(|attribute| {
                Ok(CK_ATTRIBUTE {
                    type_: attribute.kind,
                    pValue: attribute.value.as_ptr().cast_mut().cast::<c_void>(),
                    ulValueLen: CK_ULONG::try_from(attribute.value.len())?,
                })
            })
            .collect::<TResult<Vec<_>>>()?;
        hsm_call!(
            self,
            "Failed to initialize object search: C_FindObjectsInit failed",
            C_FindObjectsInit,
            session,
            ck_template.as_mut_ptr(),
            CK_ULONG::try_from(ck_template.len())?
        );
        let found = self.collect_found_objects(session);
        let finalized = self.find_objects_final(session);
        let found = found?;
        finalized?;
        Ok(found)
    }

    fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attributes: &[CK_ATTRIBUTE_TYPE],
    ) -> TResult<Vec<AttributeValue>> {
        // first pass: lengths only
        let mut template: Vec<CK_ATTRIBUTE> = attributes
            .iter()
            .map(|kind| CK_ATTRIBUTE {
                type_: *kind,
                pValue: ptr::null_mut(),
                ulValueLen: 0,
            })
            .collect();
        self.call_get_attribute_value(session, object, &mut template)?;

        let mut values: Vec<AttributeValue> = Vec::with_capacity(attributes.len());
        for attribute in &template {
            if attribute.ulValueLen == UNAVAILABLE_INFORMATION {
                values.push(None);
            } else {
                values.push(Some(vec![0_u8; usize::try_from(attribute.ulValueLen)?]));
            }
        }

        // second pass: values of the available attributes
        let mut indexes = Vec::with_capacity(values.len());
        let mut template = Vec::with_capacity(values.len());
        for (index, (kind, value)) in attributes.iter().zip(values.iter_mut()).enumerate() {
            if let Some(buffer) = value {
                indexes.push(index);
                template.push(CK_ATTRIBUTE {
                    type_: *kind,
                    pValue: buffer.as_mut_ptr().cast::<c_void>(),
                    ulValueLen: CK_ULONG::try_from(buffer.len())?,
                });
            }
        }
        if !template.is_empty() {
            self.call_get_attribute_value(session, object, &mut template)?;
        }
        for (index, attribute) in indexes.into_iter().zip(&template) {
            if attribute.ulValueLen == UNAVAILABLE_INFORMATION {
                if let Some(value) = values.get_mut(index) {
                    *value = None;
                }
            }
        }
        Ok(values)
    }

    fn get_mechanism_list(&self, slot_id: CK_SLOT_ID) -> TResult<Vec<CK_MECHANISM_TYPE>> {
        let mut count: CK_ULONG = 0;
        hsm_call!(
            self,
            format!("Failed counting the mechanisms of slot {slot_id}"),
            C_GetMechanismList,
            slot_id,
            ptr::null_mut(),
            &raw mut count
        );
        let mut mechanisms = vec![CK_MECHANISM_TYPE::default(); usize::try_from(count)?];
        hsm_call!(
            self,
            format!("Failed listing the mechanisms of slot {slot_id}"),
            C_GetMechanismList,
            slot_id,
            mechanisms.as_mut_ptr(),
            &raw mut count
        );
        mechanisms.truncate(usize::try_from(count)?);
        Ok(mechanisms)
    }

    fn get_mechanism_info(
        &self,
        slot_id: CK_SLOT_ID,
        mechanism: CK_MECHANISM_TYPE,
    ) -> TResult<MechanismInfo> {
        let mut info = CK_MECHANISM_INFO::default();
        hsm_call!(
            self,
            format!("Failed getting info of mechanism {mechanism:#x}"),
            C_GetMechanismInfo,
            slot_id,
            mechanism,
            &raw mut info
        );
        Ok(MechanismInfo {
            min_key_size: info.ulMinKeySize,
            max_key_size: info.ulMaxKeySize,
            flags: info.flags,
        })
    }
}
