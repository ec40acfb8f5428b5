mod common;

use p11device::{
    config::DeviceOptions,
    device::{
        Device, DriverBug,
        capability::Actions,
        error::DeviceError,
        mechanism::{Algorithm, Mode},
        token::{
            MechanismFlags, MechanismInfo, MechanismType,
            soft::{SoftTokenSettings, default_mechanisms},
        },
    },
};

#[test]
fn capabilities_are_consistent() {
    let (_token, device) = common::default_device();
    let capabilities = device.capabilities();
    assert!(!capabilities.is_empty());

    for cap in capabilities.iter() {
        assert!(cap.min_key_size <= cap.key_size, "{}", cap.algorithm);
        assert!(cap.key_size <= cap.max_key_size, "{}", cap.algorithm);
        assert!(cap.actions.intersects(Actions::USABLE), "{}", cap.algorithm);
        if cap.algorithm.is_pkc() {
            assert_eq!(
                cap.supports(Actions::ENCRYPT),
                cap.supports(Actions::DECRYPT),
                "{}",
                cap.algorithm
            );
            assert_eq!(cap.supports(Actions::SIGN), cap.supports(Actions::VERIFY), "{}", cap.algorithm);
        }
    }

    let rsa = device.capability(Algorithm::Rsa).unwrap();
    assert_eq!((rsa.min_key_size, rsa.max_key_size), (128, 512));
    assert!(rsa.supports(Actions::GENERATE));
    assert!(matches!(device.capability(Algorithm::Blowfish), Err(DeviceError::NotAvailable)));
}

#[test]
fn untouched_mechanism_info_is_dropped() {
    let settings = SoftTokenSettings {
        untouched_mechanism_info: vec![MechanismType::AES_ECB, MechanismType::AES_CBC, MechanismType::AES_KEY_GEN],
        ..Default::default()
    };
    let (_token, device) = common::logged_in_device(settings, DeviceOptions::default());

    assert!(matches!(device.capability(Algorithm::Aes), Err(DeviceError::NotAvailable)));
    assert!(
        device
            .capabilities()
            .diagnostics()
            .iter()
            .any(|bug| matches!(bug, DriverBug::MechanismInfoUntouched(_)))
    );
    assert!(matches!(
        device.create_context(Algorithm::Aes, Mode::Cbc),
        Err(DeviceError::NotAvailable)
    ));
    device.capability(Algorithm::TripleDes).unwrap();
}

#[test]
fn half_pairs_are_removed() {
    let mut mechanisms = default_mechanisms();
    for (mechanism, info) in mechanisms.iter_mut() {
        if *mechanism == MechanismType::DSA {
            *info = MechanismInfo {
                min_key_size: 1024,
                max_key_size: 3072,
                flags: MechanismFlags::SIGN,
            };
        }
    }
    let settings = SoftTokenSettings {
        mechanisms,
        ..Default::default()
    };
    let (_token, device) = common::logged_in_device(settings, DeviceOptions::default());

    assert!(matches!(device.capability(Algorithm::Dsa), Err(DeviceError::NotAvailable)));
    assert!(
        device
            .capabilities()
            .diagnostics()
            .iter()
            .any(|bug| matches!(bug, DriverBug::PartialCapability { algorithm: Algorithm::Dsa, .. }))
    );
}

#[test]
fn hardware_only_skips_software_mechanisms() {
    let mut mechanisms = default_mechanisms();
    for (mechanism, info) in mechanisms.iter_mut() {
        if *mechanism == MechanismType::AES_ECB || *mechanism == MechanismType::AES_CBC {
            info.flags = info.flags | MechanismFlags::HW;
        }
    }
    common::init_logging();
    let token = common::soft_token(SoftTokenSettings {
        mechanisms,
        ..Default::default()
    });
    let options = DeviceOptions {
        hardware_only: true,
        ..Default::default()
    };
    let device = Device::open_soft(token, options).unwrap();
    let aes = device.capability(Algorithm::Aes).unwrap();
    assert!(aes.supports(Actions::ENCRYPT | Actions::DECRYPT));
    assert!(!aes.supports(Actions::GENERATE), "AES_KEY_GEN is not in hardware");
    assert!(matches!(device.capability(Algorithm::Rsa), Err(DeviceError::NotAvailable)));
}
