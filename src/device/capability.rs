//! Working out what a device can actually do.
//!
//! The registry in [`mechanism`][crate::device::mechanism] lists everything
//! this layer knows how to drive. [`CapabilityList::build`] asks the token
//! about each of those mechanisms, discards answers that cannot be trusted
//! and condenses the rest into one [`Capability`] per algorithm.

use std::{fmt, ops};

use crate::{
    constants::{
        CONV_KEYSIZE_REPAIR, MECHANISM_INFO_CANARY_MAX, MECHANISM_INFO_CANARY_MIN, PKC_KEYSIZE_REPAIR,
        REPORTED_MAX_KEYSIZE_LIMIT, REPORTED_MIN_KEYSIZE_LIMIT,
    },
    device::{
        error::DriverBug,
        mechanism::{self, Algorithm, MechanismRecord, Mode},
        token::{MechanismFlags, MechanismInfo, MechanismType, SlotId, Token},
        traced,
    },
};

//------------ Actions -------------------------------------------------------

/// A set of operations.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct Actions(u32);

impl Actions {
    pub const ENCRYPT: Self = Actions(0x01);
    pub const DECRYPT: Self = Actions(0x02);
    pub const SIGN: Self = Actions(0x04);
    pub const VERIFY: Self = Actions(0x08);
    pub const DERIVE: Self = Actions(0x10);
    pub const GENERATE: Self = Actions(0x20);

    /// The operations that make a capability worth having.
    pub const USABLE: Self = Actions(0x1F);

    pub const fn empty() -> Self {
        Actions(0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0
    }
}

impl ops::BitOr for Actions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Actions(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Actions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs)
    }
}

impl fmt::Debug for Actions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names = [
            (Actions::ENCRYPT, "encrypt"),
            (Actions::DECRYPT, "decrypt"),
            (Actions::SIGN, "sign"),
            (Actions::VERIFY, "verify"),
            (Actions::DERIVE, "derive"),
            (Actions::GENERATE, "generate"),
        ];
        let set: Vec<_> = names
            .iter()
            .filter(|(action, _)| self.contains(*action))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", set.join(", "))
    }
}

//------------ CapabilityOverride --------------------------------------------

/// A deliberate exception to the consistency rules for one algorithm.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CapabilityOverride {
    /// Some tokens report ECDSA sign without verify. Verification happens
    /// natively anyway, so the pair is completed instead of dropping sign.
    ForceVerifyWithSign,
}

pub fn overrides_for(algorithm: Algorithm) -> &'static [CapabilityOverride] {
    match algorithm {
        Algorithm::Ecdsa => &[CapabilityOverride::ForceVerifyWithSign],
        _ => &[],
    }
}

//------------ Capability ----------------------------------------------------

/// What a device can do with one algorithm.
///
/// Key sizes are in bytes.
#[derive(Clone, Debug)]
pub struct Capability {
    pub algorithm: Algorithm,
    pub block_size: usize,
    pub min_key_size: usize,
    pub key_size: usize,
    pub max_key_size: usize,
    pub actions: Actions,
    /// The registry rows for every mode the device supports.
    pub records: Vec<&'static MechanismRecord>,
}

impl Capability {
    fn new(algorithm: Algorithm) -> Self {
        let native = algorithm.native();
        Capability {
            algorithm,
            block_size: native.block_size,
            min_key_size: native.min_key_size,
            key_size: native.key_size,
            max_key_size: native.max_key_size,
            actions: Actions::empty(),
            records: vec![],
        }
    }

    pub fn supports(&self, actions: Actions) -> bool {
        self.actions.contains(actions)
    }

    pub fn modes(&self) -> impl Iterator<Item = Mode> + '_ {
        self.records.iter().map(|record| record.mode)
    }

    /// The registry row for a mode.
    pub fn record(&self, mode: Mode) -> Option<&'static MechanismRecord> {
        self.records.iter().copied().find(|record| record.mode == mode)
    }

    /// The row used when the mode doesn't matter, such as for key
    /// generation.
    pub fn default_record(&self) -> Option<&'static MechanismRecord> {
        self.records.first().copied()
    }

    /// Applies the key sizes a token reported, in bits.
    fn apply_reported_sizes(&mut self, info: &MechanismInfo, diagnostics: &mut Diagnostics) {
        let native = self.algorithm.native();
        let min_bits = if info.min_key_size >= REPORTED_MIN_KEYSIZE_LIMIT {
            0
        } else {
            info.min_key_size
        };
        let max_bits = if info.max_key_size >= REPORTED_MAX_KEYSIZE_LIMIT {
            0
        } else {
            info.max_key_size
        };
        let min = bits_to_bytes(min_bits);
        let max = bits_to_bytes(max_bits);

        if min > self.min_key_size {
            self.min_key_size = min.min(native.max_key_size);
        }
        if max > 0 && max < self.max_key_size {
            self.max_key_size = max;
        }
        if self.max_key_size < self.min_key_size {
            diagnostics.report(DriverBug::InconsistentKeySizes {
                algorithm: self.algorithm,
                min: self.min_key_size,
                max: self.max_key_size,
            });
            let repair = if self.algorithm.is_pkc() {
                PKC_KEYSIZE_REPAIR
            } else {
                CONV_KEYSIZE_REPAIR
            };
            self.max_key_size = repair.max(self.min_key_size).min(native.max_key_size);
            self.min_key_size = self.min_key_size.min(self.max_key_size);
        }
        self.key_size = self.key_size.max(self.min_key_size).min(self.max_key_size);
    }

    /// Drops half-pairs of public-key operations.
    fn enforce_pairs(&mut self, diagnostics: &mut Diagnostics) {
        let overrides = overrides_for(self.algorithm);

        let encrypt = self.actions.contains(Actions::ENCRYPT);
        let decrypt = self.actions.contains(Actions::DECRYPT);
        if encrypt != decrypt {
            diagnostics.report(DriverBug::PartialCapability {
                algorithm: self.algorithm,
                operation: if encrypt { "encrypt" } else { "decrypt" },
            });
            self.actions.remove(Actions::ENCRYPT | Actions::DECRYPT);
        }

        let sign = self.actions.contains(Actions::SIGN);
        let verify = self.actions.contains(Actions::VERIFY);
        if sign && !verify && overrides.contains(&CapabilityOverride::ForceVerifyWithSign) {
            debug!("{}: sign reported without verify, adding verify", self.algorithm);
            self.actions.insert(Actions::VERIFY);
        } else if sign != verify {
            diagnostics.report(DriverBug::PartialCapability {
                algorithm: self.algorithm,
                operation: if sign { "sign" } else { "verify" },
            });
            self.actions.remove(Actions::SIGN | Actions::VERIFY);
        }
    }
}

fn bits_to_bytes(bits: u64) -> usize {
    bits.div_ceil(8) as usize
}

fn actions_from_flags(flags: MechanismFlags) -> Actions {
    let mut actions = Actions::empty();
    for (flag, action) in [
        (MechanismFlags::ENCRYPT, Actions::ENCRYPT),
        (MechanismFlags::DECRYPT, Actions::DECRYPT),
        (MechanismFlags::SIGN, Actions::SIGN),
        (MechanismFlags::VERIFY, Actions::VERIFY),
        (MechanismFlags::DERIVE, Actions::DERIVE),
    ] {
        if flags.contains(flag) {
            actions.insert(action);
        }
    }
    actions
}

//------------ Diagnostics ---------------------------------------------------

#[derive(Debug, Default)]
struct Diagnostics(Vec<DriverBug>);

impl Diagnostics {
    fn report(&mut self, bug: DriverBug) {
        warn!("Driver bug: {}", bug);
        self.0.push(bug);
    }
}

//------------ CapabilityList ------------------------------------------------

/// The capabilities of one device, plus what went wrong finding them.
#[derive(Clone, Debug, Default)]
pub struct CapabilityList {
    capabilities: Vec<Capability>,
    diagnostics: Vec<DriverBug>,
}

impl CapabilityList {
    /// Queries `token` for every registered mechanism.
    ///
    /// This never fails. Mechanisms the token doesn't know, or reports
    /// nonsense for, are left out. The result may well be empty.
    pub fn build(token: &dyn Token, slot: SlotId, hardware_only: bool) -> Self {
        let mut diagnostics = Diagnostics::default();
        let mut capabilities: Vec<Capability> = vec![];

        // Drivers that cannot list their mechanisms get asked about each.
        let listed = traced("C_GetMechanismList", token.mechanism_list(slot)).ok();
        let query = Query {
            token,
            slot,
            listed: listed.as_deref(),
        };

        for record in mechanism::records() {
            if capabilities.iter().any(|cap| cap.algorithm == record.algorithm) {
                continue;
            }
            if let Some(cap) = Self::build_one(&query, record.algorithm, hardware_only, &mut diagnostics) {
                debug!(
                    "Capability {}: key size {}..{} (default {}), actions {:?}",
                    cap.algorithm, cap.min_key_size, cap.max_key_size, cap.key_size, cap.actions
                );
                capabilities.push(cap);
            }
        }

        CapabilityList {
            capabilities,
            diagnostics: diagnostics.0,
        }
    }

    fn build_one(
        query: &Query,
        algorithm: Algorithm,
        hardware_only: bool,
        diagnostics: &mut Diagnostics,
    ) -> Option<Capability> {
        let mut cap = Capability::new(algorithm);

        for record in mechanism::modes_of(algorithm) {
            let Some(info) = query.info(record.mechanism, diagnostics) else {
                continue;
            };
            if hardware_only && !info.flags.contains(MechanismFlags::HW) {
                debug!("Skipping {} for {}, not implemented in hardware", record.mechanism, algorithm);
                continue;
            }
            if !info.flags.contains(record.required_flags) {
                diagnostics.report(DriverBug::MissingRequiredFlags {
                    mechanism: record.mechanism,
                    flags: record.required_flags.0 & !info.flags.0,
                });
            }
            if cap.records.is_empty() && algorithm.uses_reported_key_sizes() {
                cap.apply_reported_sizes(&info, diagnostics);
            }
            cap.actions |= actions_from_flags(info.flags);

            let keygen = if record.keygen_mechanism == record.mechanism {
                Some(info)
            } else {
                query.info(record.keygen_mechanism, diagnostics)
            };
            let generate_flag = if algorithm.is_pkc() {
                MechanismFlags::GENERATE_KEY_PAIR
            } else {
                MechanismFlags::GENERATE
            };
            if let Some(keygen) = keygen {
                if hardware_only && !keygen.flags.contains(MechanismFlags::HW) {
                    debug!(
                        "Not generating {} keys, {} is not implemented in hardware",
                        algorithm, record.keygen_mechanism
                    );
                } else if keygen.flags.contains(generate_flag) {
                    cap.actions.insert(Actions::GENERATE);
                }
            }
            cap.records.push(record);
        }

        if cap.records.is_empty() {
            return None;
        }
        if algorithm.is_pkc() {
            cap.enforce_pairs(diagnostics);
        }
        if !cap.actions.intersects(Actions::USABLE) {
            debug!("Dropping {}, no usable operations left", algorithm);
            return None;
        }
        Some(cap)
    }

    pub fn find(&self, algorithm: Algorithm) -> Option<&Capability> {
        self.capabilities.iter().find(|cap| cap.algorithm == algorithm)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Driver bugs spotted while building the list.
    pub fn diagnostics(&self) -> &[DriverBug] {
        &self.diagnostics
    }
}

/// The token and slot being asked, plus the mechanisms it listed.
struct Query<'a> {
    token: &'a dyn Token,
    slot: SlotId,
    listed: Option<&'a [MechanismType]>,
}

impl Query<'_> {
    /// Asks for mechanism info with canary values pre-seeded.
    fn info(&self, mechanism: MechanismType, diagnostics: &mut Diagnostics) -> Option<MechanismInfo> {
        if let Some(listed) = self.listed {
            if !listed.contains(&mechanism) {
                trace!("{} is not in the mechanism list", mechanism);
                return None;
            }
        }
        let mut info = MechanismInfo {
            min_key_size: MECHANISM_INFO_CANARY_MIN,
            max_key_size: MECHANISM_INFO_CANARY_MAX,
            flags: MechanismFlags::empty(),
        };
        match self.token.mechanism_info(self.slot, mechanism, &mut info) {
            Ok(()) => {
                if info.min_key_size == MECHANISM_INFO_CANARY_MIN && info.max_key_size == MECHANISM_INFO_CANARY_MAX {
                    diagnostics.report(DriverBug::MechanismInfoUntouched(mechanism));
                    None
                } else {
                    trace!("C_GetMechanismInfo({}): {:?}", mechanism, info);
                    Some(info)
                }
            }
            Err(rv) => {
                trace!("C_GetMechanismInfo({}): {}", mechanism, rv);
                None
            }
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::token::soft::{FnIdx, SOFT_TOKEN_SLOT, SoftToken, SoftTokenSettings};

    fn build(settings: SoftTokenSettings, hardware_only: bool) -> CapabilityList {
        let token = SoftToken::new(settings);
        CapabilityList::build(&token, SOFT_TOKEN_SLOT, hardware_only)
    }

    fn info(min: u64, max: u64, flags: MechanismFlags) -> MechanismInfo {
        MechanismInfo {
            min_key_size: min,
            max_key_size: max,
            flags,
        }
    }

    #[test]
    fn default_soft_token() {
        let list = build(SoftTokenSettings::default(), false);
        assert!(list.diagnostics().is_empty());
        for cap in list.iter() {
            assert!(cap.min_key_size <= cap.key_size, "{:?}", cap);
            assert!(cap.key_size <= cap.max_key_size, "{:?}", cap);
        }
        let rsa = list.find(Algorithm::Rsa).unwrap();
        assert_eq!((rsa.min_key_size, rsa.max_key_size), (128, 512));
        assert!(rsa.supports(Actions::ENCRYPT | Actions::DECRYPT | Actions::SIGN | Actions::GENERATE));
        let des3 = list.find(Algorithm::TripleDes).unwrap();
        assert_eq!(des3.modes().collect::<Vec<_>>(), vec![Mode::Ecb, Mode::Cbc]);
        assert!(list.find(Algorithm::Rc5).is_none());
    }

    #[test]
    fn canary_rejects_mechanism() {
        let list = build(
            SoftTokenSettings {
                untouched_mechanism_info: vec![MechanismType::ECDSA],
                ..Default::default()
            },
            false,
        );
        assert!(list.find(Algorithm::Ecdsa).is_none());
        assert_eq!(
            list.diagnostics(),
            &[DriverBug::MechanismInfoUntouched(MechanismType::ECDSA)]
        );
    }

    #[test]
    fn hardware_only_skips_software_mechanisms() {
        let mut settings = SoftTokenSettings::default();
        for (mech, info) in settings.mechanisms.iter_mut() {
            if *mech == MechanismType::AES_CBC || *mech == MechanismType::AES_KEY_GEN {
                info.flags = info.flags | MechanismFlags::HW;
            }
        }
        let list = build(settings, true);
        assert_eq!(list.len(), 1);
        let aes = list.find(Algorithm::Aes).unwrap();
        assert_eq!(aes.modes().collect::<Vec<_>>(), vec![Mode::Cbc]);
        assert!(aes.supports(Actions::GENERATE));
    }

    #[test]
    fn software_keygen_is_skipped_under_hardware_only() {
        let mut settings = SoftTokenSettings::default();
        for (mech, info) in settings.mechanisms.iter_mut() {
            if *mech == MechanismType::AES_ECB {
                info.flags = info.flags | MechanismFlags::HW;
            }
        }
        let list = build(settings, true);
        let aes = list.find(Algorithm::Aes).unwrap();
        assert!(aes.supports(Actions::ENCRYPT | Actions::DECRYPT));
        assert!(!aes.supports(Actions::GENERATE));
    }

    #[test]
    fn keygen_flag_follows_the_algorithm_class() {
        let crypt = MechanismFlags::ENCRYPT | MechanismFlags::DECRYPT;
        let settings = SoftTokenSettings {
            mechanisms: vec![
                (MechanismType::AES_ECB, info(16, 32, crypt)),
                (MechanismType::AES_KEY_GEN, info(16, 32, MechanismFlags::GENERATE_KEY_PAIR)),
                (MechanismType::RSA_PKCS, info(1024, 2048, crypt)),
                (MechanismType::RSA_PKCS_KEY_PAIR_GEN, info(1024, 2048, MechanismFlags::GENERATE)),
            ],
            ..Default::default()
        };
        let list = build(settings, false);
        assert!(!list.find(Algorithm::Aes).unwrap().supports(Actions::GENERATE));
        assert!(!list.find(Algorithm::Rsa).unwrap().supports(Actions::GENERATE));
    }

    #[test]
    fn only_listed_mechanisms_are_queried() {
        let crypt = MechanismFlags::ENCRYPT | MechanismFlags::DECRYPT;
        let token = SoftToken::new(SoftTokenSettings {
            mechanisms: vec![
                (MechanismType::AES_ECB, info(16, 32, crypt)),
                (MechanismType::AES_KEY_GEN, info(16, 32, MechanismFlags::GENERATE)),
            ],
            ..Default::default()
        });
        let list = CapabilityList::build(&token, SOFT_TOKEN_SLOT, false);
        assert_eq!(list.len(), 1);
        assert_eq!(token.call_counts().get(FnIdx::MechanismList), 1);
        assert_eq!(token.call_counts().get(FnIdx::MechanismInfo), 2);
    }

    #[test]
    fn partial_pkc_capability_is_disabled() {
        let settings = SoftTokenSettings {
            mechanisms: vec![(
                MechanismType::RSA_PKCS,
                info(1024, 2048, MechanismFlags::DECRYPT | MechanismFlags::SIGN | MechanismFlags::VERIFY),
            )],
            ..Default::default()
        };
        let list = build(settings, false);
        let rsa = list.find(Algorithm::Rsa).unwrap();
        assert!(!rsa.actions.intersects(Actions::ENCRYPT | Actions::DECRYPT));
        assert!(rsa.supports(Actions::SIGN | Actions::VERIFY));
        assert!(!rsa.supports(Actions::GENERATE));
    }

    #[test]
    fn capability_without_operations_is_dropped() {
        let settings = SoftTokenSettings {
            mechanisms: vec![(MechanismType::DSA, info(1024, 2048, MechanismFlags::SIGN))],
            ..Default::default()
        };
        let list = build(settings, false);
        assert!(list.is_empty());
        assert_eq!(list.diagnostics().len(), 1);
    }

    #[test]
    fn ecdsa_sign_only_gets_verify() {
        let flags = MechanismFlags::SIGN
            | MechanismFlags::EC_F_P
            | MechanismFlags::EC_NAMEDCURVE
            | MechanismFlags::EC_UNCOMPRESS;
        let settings = SoftTokenSettings {
            mechanisms: vec![(MechanismType::ECDSA, info(256, 384, flags))],
            ..Default::default()
        };
        let list = build(settings, false);
        let ecdsa = list.find(Algorithm::Ecdsa).unwrap();
        assert!(ecdsa.supports(Actions::SIGN | Actions::VERIFY));
        assert!(list.diagnostics().is_empty());
    }

    #[test]
    fn missing_required_flags_are_reported() {
        let settings = SoftTokenSettings {
            mechanisms: vec![(
                MechanismType::ECDSA,
                info(256, 384, MechanismFlags::SIGN | MechanismFlags::VERIFY),
            )],
            ..Default::default()
        };
        let list = build(settings, false);
        assert!(list.find(Algorithm::Ecdsa).is_some());
        assert!(matches!(
            list.diagnostics(),
            [DriverBug::MissingRequiredFlags { mechanism: MechanismType::ECDSA, .. }]
        ));
    }

    #[test]
    fn inverted_key_sizes_are_repaired() {
        let crypt = MechanismFlags::ENCRYPT | MechanismFlags::DECRYPT;
        let settings = SoftTokenSettings {
            mechanisms: vec![(MechanismType::RSA_PKCS, info(4096, 1024, crypt))],
            ..Default::default()
        };
        let list = build(settings, false);
        let rsa = list.find(Algorithm::Rsa).unwrap();
        assert_eq!((rsa.min_key_size, rsa.key_size, rsa.max_key_size), (512, 512, 512));
        assert!(matches!(
            list.diagnostics(),
            [DriverBug::InconsistentKeySizes { algorithm: Algorithm::Rsa, .. }]
        ));
    }

    #[test]
    fn junk_key_sizes_are_ignored() {
        let crypt = MechanismFlags::ENCRYPT | MechanismFlags::DECRYPT;
        let settings = SoftTokenSettings {
            mechanisms: vec![(MechanismType::RSA_PKCS, info(20_000, 200_000, crypt))],
            ..Default::default()
        };
        let list = build(settings, false);
        let rsa = list.find(Algorithm::Rsa).unwrap();
        let native = Algorithm::Rsa.native();
        assert_eq!(rsa.min_key_size, native.min_key_size);
        assert_eq!(rsa.max_key_size, native.max_key_size);
    }
}
