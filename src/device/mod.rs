//! Devices: a session with one token slot, and everything done through it.
//!
//! A [`Device`] is shared between threads as an `Arc<Device>`. All mutable
//! state sits behind one mutex and is reached through a [`DeviceGuard`],
//! which keeps the lock for as long as it lives. Key objects on the device
//! are represented by [`DeviceContext`][context::DeviceContext] values that
//! hold on to their device.

pub mod bridge;
pub mod capability;
pub mod cert;
pub mod context;
pub mod driver;
pub mod error;
pub mod mechanism;
pub mod object;
pub mod operation;
pub mod search;
pub mod session;
pub mod token;
pub mod util;

use std::{
    fmt,
    ops::{Deref, DerefMut},
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use secrecy::SecretString;

use crate::{
    config::DeviceOptions,
    device::{
        capability::{Capability, CapabilityList},
        error::DeviceError,
        mechanism::Algorithm,
        token::{Rv, SessionHandle, SlotId, Token, soft::SoftToken},
    },
};

pub use self::error::{DriverBug, map_error};

//------------ DeviceKind ----------------------------------------------------

/// Where a device's token lives.
#[derive(Clone, Debug)]
pub enum DeviceKind {
    /// A vendor library.
    External { driver_name: String, lib_path: PathBuf },
    /// The built-in software token.
    Soft(Arc<SoftToken>),
}

impl DeviceKind {
    pub fn driver_name(&self) -> &str {
        match self {
            DeviceKind::External { driver_name, .. } => driver_name,
            DeviceKind::Soft(_) => crate::constants::SOFT_TOKEN_DRIVER_NAME,
        }
    }
}

//------------ DeviceFlags ---------------------------------------------------

#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct DeviceFlags(u32);

impl DeviceFlags {
    pub const NEEDS_LOGIN: u32 = 0x01;
    pub const READ_ONLY: u32 = 0x02;
    pub const REMOVABLE: u32 = 0x04;
    pub const ACTIVE: u32 = 0x08;
    pub const LOGGED_IN: u32 = 0x10;
    pub const HAS_CLOCK: u32 = 0x20;
    pub const HAS_RNG: u32 = 0x40;

    pub fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u32) {
        self.0 |= flag
    }

    pub fn clear(&mut self, flag: u32) {
        self.0 &= !flag
    }
}

impl fmt::Debug for DeviceFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names = [
            (Self::NEEDS_LOGIN, "needs-login"),
            (Self::READ_ONLY, "read-only"),
            (Self::REMOVABLE, "removable"),
            (Self::ACTIVE, "active"),
            (Self::LOGGED_IN, "logged-in"),
            (Self::HAS_CLOCK, "has-clock"),
            (Self::HAS_RNG, "has-rng"),
        ];
        f.debug_list()
            .entries(names.iter().filter(|(flag, _)| self.has(*flag)).map(|(_, name)| name))
            .finish()
    }
}

//------------ DeviceState ---------------------------------------------------

/// The mutable part of a device.
#[derive(Debug)]
pub struct DeviceState {
    pub(crate) session: Option<SessionHandle>,
    pub(crate) flags: DeviceFlags,
    pub(crate) label: String,
    pub(crate) min_pin_size: usize,
    pub(crate) max_pin_size: usize,
    pub(crate) capabilities: Arc<CapabilityList>,
    /// The context running the one multi-stage operation a session allows.
    pub(crate) active_signer: Option<u64>,
    /// The SO PIN set during initialisation, kept until it is changed.
    pub(crate) so_pin: Option<SecretString>,
}

impl DeviceState {
    fn new(label: String) -> Self {
        DeviceState {
            session: None,
            flags: DeviceFlags::default(),
            label,
            min_pin_size: crate::constants::MIN_PIN_SIZE,
            max_pin_size: crate::constants::DEFAULT_MAX_PIN_SIZE,
            capabilities: Arc::new(CapabilityList::default()),
            active_signer: None,
            so_pin: None,
        }
    }

    /// The open session, if there is one.
    pub fn session(&self) -> Result<SessionHandle, DeviceError> {
        self.session.ok_or(DeviceError::NotInitialized)
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }
}

//------------ Device --------------------------------------------------------

pub struct Device {
    token: Arc<dyn Token>,
    kind: DeviceKind,
    slot: SlotId,
    options: DeviceOptions,
    state: Mutex<DeviceState>,
    next_context_id: AtomicU64,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("kind", &self.kind)
            .field("slot", &self.slot)
            .finish()
    }
}

impl Device {
    fn new(token: Arc<dyn Token>, kind: DeviceKind, slot: SlotId, options: DeviceOptions) -> Self {
        let label = kind.driver_name().to_string();
        Device {
            token,
            kind,
            slot,
            options,
            state: Mutex::new(DeviceState::new(label)),
            next_context_id: AtomicU64::new(1),
        }
    }

    /// Takes the device lock.
    ///
    /// A poisoned lock is taken over as is: the state it protects only
    /// mirrors the token, which is asked again on the next operation.
    pub fn lock(&self) -> DeviceGuard<'_> {
        DeviceGuard {
            device: self,
            state: self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    pub fn token(&self) -> &dyn Token {
        self.token.as_ref()
    }

    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub fn label(&self) -> String {
        self.lock().label.clone()
    }

    pub fn flags(&self) -> DeviceFlags {
        self.lock().flags
    }

    pub fn capabilities(&self) -> Arc<CapabilityList> {
        self.lock().capabilities.clone()
    }

    /// The capability for an algorithm, or `NotAvailable`.
    pub fn capability(&self, algorithm: Algorithm) -> Result<Capability, DeviceError> {
        self.lock()
            .capabilities
            .find(algorithm)
            .cloned()
            .ok_or(DeviceError::NotAvailable)
    }

    pub(crate) fn next_context_id(&self) -> u64 {
        self.next_context_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let mut guard = self.lock();
        if guard.flags.has(DeviceFlags::ACTIVE) {
            if let Err(err) = guard.shut_down() {
                error!("Failed to close device '{}': {}", guard.label, err);
            }
        }
    }
}

//------------ DeviceGuard ---------------------------------------------------

/// Exclusive access to a device's state.
///
/// The lock is released when the guard is dropped, whichever way the
/// holder leaves.
pub struct DeviceGuard<'a> {
    device: &'a Device,
    state: MutexGuard<'a, DeviceState>,
}

impl<'a> DeviceGuard<'a> {
    pub fn device(&self) -> &'a Device {
        self.device
    }

    pub fn token(&self) -> &'a dyn Token {
        self.device.token.as_ref()
    }

    /// Runs `op` with the device lock released.
    ///
    /// Only for long-running work that does not touch the session, such as
    /// generating domain parameters in software. The lock is taken again
    /// before this returns.
    pub fn unlocked<R>(self, op: impl FnOnce() -> R) -> (DeviceGuard<'a>, R) {
        let device = self.device;
        drop(self);
        let res = op();
        (device.lock(), res)
    }
}

impl Deref for DeviceGuard<'_> {
    type Target = DeviceState;

    fn deref(&self) -> &DeviceState {
        &self.state
    }
}

impl DerefMut for DeviceGuard<'_> {
    fn deref_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }
}

//------------ Helpers -------------------------------------------------------

/// Logs the outcome of a token call.
pub(crate) fn traced<T>(call: &str, res: Result<T, Rv>) -> Result<T, Rv> {
    match &res {
        Ok(_) => trace!("{}: OK", call),
        Err(rv) => trace!("{}: {}", call, rv),
    }
    res
}
