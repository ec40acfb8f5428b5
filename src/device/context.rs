//! Keys held on a device.

use std::{fmt, sync::Arc};

use crate::device::{
    Device, DeviceGuard,
    capability::{Actions, Capability},
    error::DeviceError,
    mechanism::{Algorithm, AlgorithmClass, Mode},
    token::ObjectHandle,
    traced,
    util::Curve,
};

//------------ Permissions ---------------------------------------------------

/// What a key may be used for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Permissions {
    pub actions: Actions,
    /// The key may only be used by this layer itself, never handed out for
    /// direct use.
    pub internal_only: bool,
}

impl Permissions {
    pub fn all(actions: Actions) -> Self {
        Permissions {
            actions,
            internal_only: false,
        }
    }

    pub fn allows(&self, actions: Actions) -> bool {
        self.actions.contains(actions)
    }
}

//------------ PublicKeyData -------------------------------------------------

/// The public half of a key pair, as read from the device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PublicKeyData {
    Rsa { modulus: Vec<u8>, exponent: Vec<u8> },
    Dsa { p: Vec<u8>, q: Vec<u8>, g: Vec<u8>, y: Vec<u8> },
    Ec { curve: Curve, point: Vec<u8> },
    Dh { p: Vec<u8>, g: Vec<u8>, y: Vec<u8> },
}

//------------ DeviceContext -------------------------------------------------

/// A key that lives on a device, or is about to.
///
/// Dropping the context destroys the device objects behind it unless they
/// are persistent, in which case only the handle is let go.
pub struct DeviceContext {
    device: Arc<Device>,
    id: u64,
    algorithm: Algorithm,
    mode: Mode,
    persistent: bool,
    label: Option<String>,
    pub(crate) key_id: Option<Vec<u8>>,
    pub(crate) key_size: usize,
    pub(crate) permissions: Permissions,
    pub(crate) object: Option<ObjectHandle>,
    /// The second object of a pair, such as the public half of a DH key.
    pub(crate) alt_object: Option<ObjectHandle>,
    pub(crate) public: Option<PublicKeyData>,
    pub(crate) iv: Vec<u8>,
    /// The DH private key's own public value, for agreement phase one.
    pub(crate) dh_public_value: Option<Vec<u8>>,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("mode", &self.mode)
            .field("persistent", &self.persistent)
            .field("label", &self.label)
            .field("object", &self.object)
            .finish()
    }
}

impl Device {
    /// Creates a context for a key that is yet to be loaded or generated.
    pub fn create_context(self: &Arc<Self>, algorithm: Algorithm, mode: Mode) -> Result<DeviceContext, DeviceError> {
        let cap = self.capability(algorithm)?;
        let mode = match algorithm.class() {
            AlgorithmClass::Conventional => {
                cap.record(mode).ok_or(DeviceError::NotAvailable)?;
                mode
            }
            _ => Mode::None,
        };
        let mut ctx = DeviceContext::new(self.clone(), algorithm, mode, Permissions::all(cap.actions));
        ctx.key_size = cap.key_size;
        Ok(ctx)
    }
}

impl DeviceContext {
    pub(crate) fn new(device: Arc<Device>, algorithm: Algorithm, mode: Mode, permissions: Permissions) -> Self {
        let id = device.next_context_id();
        DeviceContext {
            device,
            id,
            algorithm,
            mode,
            persistent: false,
            label: None,
            key_id: None,
            key_size: 0,
            permissions,
            object: None,
            alt_object: None,
            public: None,
            iv: vec![],
            dh_public_value: None,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub(crate) fn lock(&self) -> DeviceGuard<'_> {
        self.device.lock()
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Key size in bytes.
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn key_id(&self) -> Option<&[u8]> {
        self.key_id.as_deref()
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn object_handle(&self) -> Option<ObjectHandle> {
        self.object
    }

    pub fn public_key_data(&self) -> Option<&PublicKeyData> {
        self.public.as_ref()
    }

    pub fn has_key(&self) -> bool {
        self.object.is_some()
    }

    /// Makes the key a token object that outlives the session.
    ///
    /// Persistent keys need a label. Both have to be set before the key is
    /// loaded or generated.
    pub fn set_persistent(&mut self, label: &str) -> Result<(), DeviceError> {
        if self.object.is_some() {
            return Err(DeviceError::AlreadyInitialized);
        }
        if label.is_empty() || label.len() > crate::constants::MAX_LABEL_SIZE {
            return Err(DeviceError::argument("label must be 1 to 64 bytes"));
        }
        self.persistent = true;
        self.label = Some(label.to_string());
        Ok(())
    }

    pub fn set_label(&mut self, label: &str) {
        self.label = Some(label.to_string())
    }

    pub(crate) fn mark_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Sets the IV for a mode that needs one.
    pub fn set_iv(&mut self, iv: &[u8]) -> Result<(), DeviceError> {
        if !self.mode.needs_iv() || self.algorithm.is_stream_cipher() {
            return Err(DeviceError::NotAvailable);
        }
        if iv.len() != self.algorithm.native().block_size {
            return Err(DeviceError::argument("IV must be one block long"));
        }
        self.iv = iv.to_vec();
        Ok(())
    }

    pub(crate) fn capability(&self) -> Result<Capability, DeviceError> {
        self.device.capability(self.algorithm)
    }

    pub(crate) fn object(&self) -> Result<ObjectHandle, DeviceError> {
        self.object.ok_or(DeviceError::NotInitialized)
    }

    pub(crate) fn check_permission(&self, actions: Actions) -> Result<(), DeviceError> {
        if self.permissions.allows(actions) {
            Ok(())
        } else {
            Err(DeviceError::Permission)
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        let mut guard = self.device.lock();
        let Ok(session) = guard.session() else {
            return;
        };
        if guard.active_signer == Some(self.id) {
            guard.active_signer = None;
            if let Err(rv) = traced("C_SignFinal", guard.token().sign_final(session)) {
                debug!("Abandoned MAC could not be finished: {}", rv);
            }
        }
        if self.persistent {
            return;
        }
        for object in [self.object.take(), self.alt_object.take()].into_iter().flatten() {
            if let Err(rv) = traced("C_DestroyObject", guard.token().destroy_object(session, object)) {
                error!("Failed to destroy session object {}: {}", object, rv);
            }
        }
    }
}
