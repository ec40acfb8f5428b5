//! Opening, closing and logging in to a device.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::{
    config::DeviceOptions,
    constants::{
        DEFAULT_MAX_PIN_SIZE, DEFAULT_SLOT, MAX_PIN_SIZE, MAX_SLOTS, MIN_PIN_SIZE, SOFT_TOKEN_DRIVER_NAME,
        TOKEN_CLOCK_TOLERANCE_SECS, TOKEN_LABEL_SIZE,
    },
    device::{
        Device, DeviceFlags, DeviceGuard, DeviceKind,
        capability::CapabilityList,
        error::{DeviceError, DriverBug, map_error},
        token::{
            Attribute, KeyType, Mechanism, MechanismType, ObjectClass, Rv, SessionHandle, SlotFlags, SlotId, Token,
            TokenFlags, TokenInfo, UserType, soft::SoftToken, trim_padded,
        },
        traced,
    },
};

//------------ Opening -------------------------------------------------------

impl Device {
    /// Opens a device on a slot of `token`.
    ///
    /// The `selector` picks the slot: a single digit is an index into the
    /// slots that have a token present, anything else is matched against
    /// the token labels. Without a selector the first slot is used.
    pub fn open(
        token: Arc<dyn Token>,
        kind: DeviceKind,
        selector: Option<&str>,
        options: DeviceOptions,
    ) -> Result<Arc<Device>, DeviceError> {
        let slot = select_slot(token.as_ref(), selector)?;
        let device = Arc::new(Device::new(token, kind, slot, options));
        device.lock().start()?;
        Ok(device)
    }

    /// Opens a device on the built-in software token.
    pub fn open_soft(token: Arc<SoftToken>, options: DeviceOptions) -> Result<Arc<Device>, DeviceError> {
        Device::open(token.clone(), DeviceKind::Soft(token), None, options)
    }

    /// Logs out, closes the session and forgets the capabilities.
    pub fn close(&self) -> Result<(), DeviceError> {
        self.lock().shut_down()
    }

    /// Logs in to the token.
    ///
    /// A token that answers with an existing login is checked for drivers
    /// that report one without anybody being logged in. The login fails
    /// either way, with the driver bug if one is found.
    pub fn login(&self, user_type: UserType, pin: &SecretString) -> Result<(), DeviceError> {
        self.lock().login(user_type, pin.expose_secret())
    }

    pub fn logout(&self) -> Result<(), DeviceError> {
        let mut guard = self.lock();
        let session = guard.session()?;
        guard.flags.clear(DeviceFlags::LOGGED_IN);
        match traced("C_Logout", guard.token().logout(session)) {
            Ok(()) | Err(Rv::UserNotLoggedIn) => Ok(()),
            Err(rv) => Err(map_error(rv, DeviceError::Failed)),
        }
    }

    /// Whether the device is logged in.
    ///
    /// Removable tokens are asked every time since drivers report their
    /// removal unreliably.
    pub fn is_logged_in(&self) -> bool {
        let flags = self.flags();
        if !flags.has(DeviceFlags::LOGGED_IN) {
            return false;
        }
        if flags.has(DeviceFlags::REMOVABLE) {
            return self.check_logged_in().is_ok();
        }
        true
    }

    /// Checks that the token is still there.
    pub fn check_logged_in(&self) -> Result<(), DeviceError> {
        let token = self.token();
        traced("C_GetTokenInfo", token.token_info(self.slot))
            .map_err(|rv| map_error(rv, DeviceError::Signalled))?;
        let slot_info = traced("C_GetSlotInfo", token.slot_info(self.slot))
            .map_err(|rv| map_error(rv, DeviceError::Signalled))?;
        if !slot_info.flags.has(SlotFlags::TOKEN_PRESENT) {
            return Err(DeviceError::Signalled);
        }
        Ok(())
    }

    /// Initialises the token and leaves it logged in as SO.
    ///
    /// This wipes everything on the token. The SO PIN is remembered so it
    /// can be changed with [`set_so_pin`][Self::set_so_pin] as the next
    /// bootstrap step.
    pub fn initialise(&self, so_pin: &SecretString) -> Result<(), DeviceError> {
        self.lock().init_token(so_pin.expose_secret(), false)
    }

    /// Initialises the token and stops there.
    pub fn zeroise(&self, so_pin: &SecretString) -> Result<(), DeviceError> {
        self.lock().init_token(so_pin.expose_secret(), true)
    }

    /// Replaces the SO PIN set by [`initialise`][Self::initialise].
    pub fn set_so_pin(&self, new_pin: &SecretString) -> Result<(), DeviceError> {
        let mut guard = self.lock();
        guard.check_pin_size(new_pin.expose_secret())?;
        let session = guard.session()?;
        let old_pin = guard.so_pin.take().ok_or(DeviceError::NotInitialized)?;
        traced(
            "C_SetPIN",
            guard
                .token()
                .set_pin(session, old_pin.expose_secret(), new_pin.expose_secret()),
        )
        .map_err(|rv| map_error(rv, DeviceError::Failed))
    }

    /// Sets the user PIN, which needs an SO login.
    pub fn set_user_pin(&self, pin: &SecretString) -> Result<(), DeviceError> {
        let guard = self.lock();
        guard.check_pin_size(pin.expose_secret())?;
        let session = guard.session()?;
        traced("C_InitPIN", guard.token().init_pin(session, pin.expose_secret()))
            .map_err(|rv| map_error(rv, DeviceError::Failed))
    }

    /// The time according to the token's clock.
    pub fn token_time(&self) -> Result<DateTime<Utc>, DeviceError> {
        if !self.flags().has(DeviceFlags::HAS_CLOCK) {
            return Err(DeviceError::NotAvailable);
        }
        let info = traced("C_GetTokenInfo", self.token().token_info(self.slot))
            .map_err(|rv| map_error(rv, DeviceError::Signalled))?;
        parse_token_time(&info.utc_time).ok_or(DeviceError::NotAvailable)
    }

    /// There is no self-test in the token interface.
    pub fn self_test(&self) -> Result<(), DeviceError> {
        Err(DeviceError::NotAvailable)
    }
}

fn select_slot(token: &dyn Token, selector: Option<&str>) -> Result<SlotId, DeviceError> {
    let mut slots = traced("C_GetSlotList", token.slot_list()).map_err(|rv| map_error(rv, DeviceError::Open))?;
    slots.truncate(MAX_SLOTS);
    if slots.is_empty() {
        return Err(DeviceError::Open);
    }

    let selector = match selector {
        None => return Ok(slots[DEFAULT_SLOT]),
        Some(selector) => selector,
    };
    if selector.len() == 1 {
        if let Some(index) = selector.chars().next().and_then(|c| c.to_digit(10)) {
            return slots.get(index as usize).copied().ok_or(DeviceError::NotFound);
        }
    }
    for slot in slots {
        if let Ok(info) = traced("C_GetTokenInfo", token.token_info(slot)) {
            if trim_padded(&info.label) == selector {
                return Ok(slot);
            }
        }
    }
    Err(DeviceError::NotFound)
}

/// Parses the `YYYYMMDDhhmmss00` form of the token clock.
fn parse_token_time(utc_time: &str) -> Option<DateTime<Utc>> {
    let digits = utc_time.get(..14)?;
    NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S")
        .ok()
        .map(|time| time.and_utc())
}

//------------ DeviceGuard: session handling ----------------------------------

impl DeviceGuard<'_> {
    /// Reads the token state, opens a session and works out capabilities.
    fn start(&mut self) -> Result<(), DeviceError> {
        let token = self.token();
        let slot = self.device().slot;

        let slot_info =
            traced("C_GetSlotInfo", token.slot_info(slot)).map_err(|rv| map_error(rv, DeviceError::Open))?;
        if slot_info.flags.has(SlotFlags::REMOVABLE_DEVICE) {
            self.flags.set(DeviceFlags::REMOVABLE);
        }
        let token_info =
            traced("C_GetTokenInfo", token.token_info(slot)).map_err(|rv| map_error(rv, DeviceError::Open))?;
        self.apply_token_info(&token_info);

        let session = match traced("C_OpenSession", token.open_session(slot, true)) {
            Ok(session) => session,
            Err(Rv::TokenWriteProtected) => {
                debug!("Token '{}' is write-protected, opening read-only", self.label);
                let session = traced("C_OpenSession", token.open_session(slot, false))
                    .map_err(|rv| self.open_error(rv, &token_info))?;
                self.flags.set(DeviceFlags::READ_ONLY);
                session
            }
            Err(rv) => return Err(self.open_error(rv, &token_info)),
        };
        self.session = Some(session);

        let capabilities = CapabilityList::build(token, slot, self.device().options.hardware_only);
        if capabilities.is_empty() {
            debug!("Token '{}' offers no usable capabilities", self.label);
            ignore_failure("C_CloseSession", token.close_session(session));
            self.session = None;
            return Err(DeviceError::NotAvailable);
        }
        self.capabilities = Arc::new(capabilities);
        self.flags.set(DeviceFlags::ACTIVE);
        debug!("Opened device '{}' on slot {}, flags {:?}", self.label, slot, self.flags);
        Ok(())
    }

    /// Maps a failed open, telling an uninitialised token from others.
    fn open_error(&self, rv: Rv, token_info: &TokenInfo) -> DeviceError {
        match map_error(rv, DeviceError::Open) {
            DeviceError::Open if !token_info.flags.has(TokenFlags::USER_PIN_INITIALIZED) => DeviceError::NotInitialized,
            err => err,
        }
    }

    fn apply_token_info(&mut self, info: &TokenInfo) {
        if info.flags.has(TokenFlags::LOGIN_REQUIRED) {
            self.flags.set(DeviceFlags::NEEDS_LOGIN);
        }
        if info.flags.has(TokenFlags::RNG) {
            self.flags.set(DeviceFlags::HAS_RNG);
        }

        let (min, max) = (info.min_pin_len as usize, info.max_pin_len as usize);
        let min_pin_size = min.max(MIN_PIN_SIZE);
        let max_pin_size = if max < MIN_PIN_SIZE {
            DEFAULT_MAX_PIN_SIZE
        } else {
            max.min(MAX_PIN_SIZE)
        };
        if min < MIN_PIN_SIZE || max < MIN_PIN_SIZE || max < min {
            let bug = DriverBug::BadPinBounds {
                min: info.min_pin_len,
                max: info.max_pin_len,
            };
            warn!("Driver bug: {}", bug);
        }
        self.min_pin_size = min_pin_size;
        self.max_pin_size = max_pin_size.max(min_pin_size);

        let label = trim_padded(&info.label);
        if !label.is_empty() {
            self.label = label;
        }

        if info.flags.has(TokenFlags::CLOCK_ON_TOKEN) {
            if let Some(time) = parse_token_time(&info.utc_time) {
                let now = Utc::now();
                let drift = (time - now).num_seconds().abs();
                if drift <= TOKEN_CLOCK_TOLERANCE_SECS {
                    self.flags.set(DeviceFlags::HAS_CLOCK);
                }
                if drift == 0 && self.device().kind.driver_name() != SOFT_TOKEN_DRIVER_NAME {
                    warn!("Driver bug: {}", DriverBug::FakedClock);
                }
            }
        }
    }

    pub(crate) fn shut_down(&mut self) -> Result<(), DeviceError> {
        let token = self.token();
        let logged_in = self.flags.has(DeviceFlags::LOGGED_IN);
        self.flags.clear(DeviceFlags::ACTIVE | DeviceFlags::LOGGED_IN);
        self.capabilities = Arc::new(CapabilityList::default());
        self.active_signer = None;
        self.so_pin = None;

        if let Some(session) = self.session.take() {
            if logged_in {
                ignore_failure("C_Logout", token.logout(session));
            }
            traced("C_CloseSession", token.close_session(session)).map_err(|rv| map_error(rv, DeviceError::Failed))?;
        }
        debug!("Closed device '{}'", self.label);
        Ok(())
    }

    pub(crate) fn check_pin_size(&self, pin: &str) -> Result<(), DeviceError> {
        if pin.len() < self.min_pin_size || pin.len() > self.max_pin_size {
            return Err(DeviceError::Argument(format!(
                "PIN must be {} to {} characters",
                self.min_pin_size, self.max_pin_size
            )));
        }
        Ok(())
    }

    fn login(&mut self, user_type: UserType, pin: &str) -> Result<(), DeviceError> {
        self.check_pin_size(pin)?;
        let token = self.token();
        let session = self.session()?;

        if self.flags.has(DeviceFlags::LOGGED_IN) {
            ignore_failure("C_Logout", token.logout(session));
            self.flags.clear(DeviceFlags::LOGGED_IN);
        }

        match traced("C_Login", token.login(session, user_type, pin)) {
            Ok(()) => {}
            Err(Rv::UserAlreadyLoggedIn) => {
                debug!("Token '{}' reports an existing login, checking it", self.label);
                self.check_driver_bugs(session)?;
                return Err(DeviceError::Failed);
            }
            Err(rv) => return Err(map_error(rv, DeviceError::Failed)),
        }
        self.flags.set(DeviceFlags::LOGGED_IN);
        debug!("Logged in to '{}'", self.label);
        Ok(())
    }

    /// Makes sure a login actually took effect.
    ///
    /// Some drivers claim a user is logged in when nobody is. Using an
    /// object that needs a login shows whether that is true.
    fn check_driver_bugs(&self, session: SessionHandle) -> Result<(), DeviceError> {
        let token = self.token();
        let template = [
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::KeyType(KeyType::DES),
            Attribute::Token(false),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Encrypt(true),
            Attribute::Value(b"12345678".to_vec()),
        ];
        let object = match traced("C_CreateObject", token.create_object(session, &template)) {
            Ok(object) => object,
            Err(Rv::UserNotLoggedIn) => return Err(report(DriverBug::LoginNotEffective)),
            Err(rv) => return Err(map_error(rv, DeviceError::Failed)),
        };

        let res = traced(
            "C_EncryptInit",
            token.encrypt_init(session, &Mechanism::new(MechanismType::DES_ECB), object),
        )
        .and_then(|()| traced("C_Encrypt", token.encrypt(session, &[0; 8])).map(|_| ()));
        ignore_failure("C_DestroyObject", token.destroy_object(session, object));

        match res {
            Ok(()) | Err(Rv::MechanismInvalid) => Ok(()),
            Err(Rv::UserNotLoggedIn) => Err(report(DriverBug::LoginNotEffective)),
            Err(rv) => Err(report(DriverBug::ObjectUnusableAfterLogin(rv))),
        }
    }

    fn init_token(&mut self, so_pin: &str, zeroise: bool) -> Result<(), DeviceError> {
        self.check_pin_size(so_pin)?;
        let token = self.token();
        let slot = self.device().slot;

        if let Some(session) = self.session.take() {
            if self.flags.has(DeviceFlags::LOGGED_IN) {
                ignore_failure("C_Logout", token.logout(session));
            }
            ignore_failure("C_CloseSession", token.close_session(session));
        }
        self.flags.clear(DeviceFlags::LOGGED_IN);
        self.active_signer = None;

        let label = " ".repeat(TOKEN_LABEL_SIZE);
        traced("C_InitToken", token.init_token(slot, so_pin, &label))
            .map_err(|rv| map_error(rv, DeviceError::Failed))?;
        let session = traced("C_OpenSession", token.open_session(slot, true))
            .map_err(|rv| map_error(rv, DeviceError::Open))?;
        self.session = Some(session);
        if zeroise {
            debug!("Zeroised token '{}'", self.label);
            return Ok(());
        }

        if let Err(rv) = traced("C_Login", token.login(session, UserType::So, so_pin)) {
            ignore_failure("C_CloseSession", token.close_session(session));
            self.session = None;
            self.flags.clear(DeviceFlags::ACTIVE);
            return Err(map_error(rv, DeviceError::Failed));
        }
        if let Err(err) = self.check_driver_bugs(session) {
            ignore_failure("C_Logout", token.logout(session));
            ignore_failure("C_CloseSession", token.close_session(session));
            self.session = None;
            self.flags.clear(DeviceFlags::ACTIVE);
            return Err(err);
        }
        self.so_pin = Some(SecretString::new(so_pin.to_string()));
        self.flags.set(DeviceFlags::LOGGED_IN);
        debug!("Initialised token '{}'", self.label);
        Ok(())
    }
}

/// Runs a clean-up call whose failure changes nothing.
fn ignore_failure(call: &str, res: Result<(), Rv>) {
    if let Err(rv) = traced(call, res) {
        debug!("{} failed: {}", call, rv);
    }
}

fn report(bug: DriverBug) -> DeviceError {
    warn!("Driver bug: {}", bug);
    DeviceError::DriverBug(bug)
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::token::soft::{SOFT_TOKEN_SLOT, SoftTokenSettings};

    fn soft(settings: SoftTokenSettings) -> Arc<SoftToken> {
        Arc::new(SoftToken::new(settings))
    }

    #[test]
    fn slot_selection() {
        let token = soft(SoftTokenSettings {
            label: "Alpha".to_string(),
            ..Default::default()
        });
        assert_eq!(select_slot(token.as_ref(), None).unwrap(), SOFT_TOKEN_SLOT);
        assert_eq!(select_slot(token.as_ref(), Some("0")).unwrap(), SOFT_TOKEN_SLOT);
        assert_eq!(select_slot(token.as_ref(), Some("Alpha")).unwrap(), SOFT_TOKEN_SLOT);
        assert!(matches!(select_slot(token.as_ref(), Some("1")), Err(DeviceError::NotFound)));
        assert!(matches!(select_slot(token.as_ref(), Some("Beta")), Err(DeviceError::NotFound)));
    }

    #[test]
    fn token_time_format() {
        let time = parse_token_time("2024051712301500").unwrap();
        assert_eq!(time.to_rfc3339(), "2024-05-17T12:30:15+00:00");
        assert!(parse_token_time("").is_none());
        assert!(parse_token_time("garbage-garbage-").is_none());
    }

    #[test]
    fn pin_bounds_are_fixed_up() {
        let token = soft(SoftTokenSettings {
            min_pin_len: 0,
            max_pin_len: 0,
            ..Default::default()
        });
        let device = Device::open_soft(token, DeviceOptions::default()).unwrap();
        let guard = device.lock();
        assert_eq!((guard.min_pin_size, guard.max_pin_size), (MIN_PIN_SIZE, DEFAULT_MAX_PIN_SIZE));
        assert!(guard.check_pin_size("123").is_err());
        assert!(guard.check_pin_size("1234").is_ok());
    }

    #[test]
    fn empty_label_uses_driver_name() {
        let token = soft(SoftTokenSettings {
            label: String::new(),
            ..Default::default()
        });
        let device = Device::open_soft(token, DeviceOptions::default()).unwrap();
        assert_eq!(device.label(), SOFT_TOKEN_DRIVER_NAME);
    }

    #[test]
    fn uninitialised_token_is_reported() {
        let token = soft(SoftTokenSettings {
            user_pin: None,
            open_session_error: Some(Rv::GeneralError),
            ..Default::default()
        });
        let err = Device::open_soft(token, DeviceOptions::default()).unwrap_err();
        assert!(matches!(err, DeviceError::NotInitialized));
    }

    #[test]
    fn other_open_failures_propagate() {
        let token = soft(SoftTokenSettings {
            open_session_error: Some(Rv::DeviceRemoved),
            ..Default::default()
        });
        let err = Device::open_soft(token, DeviceOptions::default()).unwrap_err();
        assert!(matches!(err, DeviceError::Signalled));
    }
}
