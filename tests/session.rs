mod common;

use std::io::Write;

use p11device::{
    config::{Config, DeviceOptions},
    constants::AUTODETECT_DRIVER,
    device::{
        Device, DeviceFlags, DriverBug,
        driver::DriverRegistry,
        error::DeviceError,
        mechanism::{Algorithm, Mode},
        token::{
            Rv, UserType,
            soft::{FnIdx, SoftTokenSettings},
        },
    },
};

#[test]
fn write_protected_token_opens_read_only() {
    common::init_logging();
    let token = common::soft_token(SoftTokenSettings {
        write_protected: true,
        ..Default::default()
    });
    let device = Device::open_soft(token.clone(), DeviceOptions::default()).unwrap();
    assert!(device.flags().has(DeviceFlags::READ_ONLY));
    assert!(device.flags().has(DeviceFlags::ACTIVE));
    assert_eq!(token.call_counts().get(FnIdx::OpenSession), 2);

    device.login(UserType::User, &common::pin(common::USER_PIN)).unwrap();
    let mut ctx = device.create_context(Algorithm::Aes, Mode::Cbc).unwrap();
    ctx.set_persistent("kept").unwrap();
    assert!(ctx.load_key(&[5; 16]).is_err());

    let mut ctx = device.create_context(Algorithm::Aes, Mode::Cbc).unwrap();
    ctx.load_key(&[5; 16]).unwrap();
}

#[test]
fn login_and_logout() {
    common::init_logging();
    let token = common::soft_token(SoftTokenSettings::default());
    let device = Device::open_soft(token, DeviceOptions::default()).unwrap();
    assert!(device.flags().has(DeviceFlags::NEEDS_LOGIN));
    assert!(!device.is_logged_in());

    assert!(matches!(
        device.login(UserType::User, &common::pin("9999")),
        Err(DeviceError::WrongKey)
    ));
    assert!(matches!(
        device.login(UserType::User, &common::pin("12")),
        Err(DeviceError::Argument(_))
    ));
    assert!(!device.is_logged_in());

    device.login(UserType::User, &common::pin(common::USER_PIN)).unwrap();
    assert!(device.is_logged_in());
    device.check_logged_in().unwrap();

    device.logout().unwrap();
    assert!(!device.is_logged_in());
    device.logout().unwrap();
}

#[test]
fn private_keys_need_a_login() {
    common::init_logging();
    let token = common::soft_token(SoftTokenSettings::default());
    let device = Device::open_soft(token, DeviceOptions::default()).unwrap();
    let mut ctx = device.create_context(Algorithm::Rsa, Mode::None).unwrap();
    assert!(ctx.generate_key(128).is_err());
    drop(ctx);

    device.login(UserType::User, &common::pin(common::USER_PIN)).unwrap();
    let mut ctx = device.create_context(Algorithm::Rsa, Mode::None).unwrap();
    ctx.generate_key(128).unwrap();
}

#[test]
fn false_login_is_caught() {
    common::init_logging();
    let token = common::soft_token(SoftTokenSettings {
        false_already_logged_in: true,
        ..Default::default()
    });
    let device = Device::open_soft(token, DeviceOptions::default()).unwrap();
    assert!(matches!(
        device.login(UserType::User, &common::pin(common::USER_PIN)),
        Err(DeviceError::DriverBug(DriverBug::LoginNotEffective))
    ));
    assert!(!device.is_logged_in());
}

#[test]
fn existing_login_is_not_taken_over() {
    common::init_logging();
    let token = common::soft_token(SoftTokenSettings::default());
    let first = Device::open_soft(token.clone(), DeviceOptions::default()).unwrap();
    first.login(UserType::User, &common::pin(common::USER_PIN)).unwrap();

    let second = Device::open_soft(token, DeviceOptions::default()).unwrap();
    assert!(matches!(
        second.login(UserType::User, &common::pin(common::USER_PIN)),
        Err(DeviceError::Failed)
    ));
    assert!(!second.is_logged_in());
    assert!(first.is_logged_in());
}

#[test]
fn unusable_objects_after_login_are_caught() {
    common::init_logging();
    let token = common::soft_token(SoftTokenSettings {
        encrypt_error: Some(Rv::GeneralError),
        ..Default::default()
    });
    let first = Device::open_soft(token.clone(), DeviceOptions::default()).unwrap();
    first.login(UserType::User, &common::pin(common::USER_PIN)).unwrap();

    let second = Device::open_soft(token.clone(), DeviceOptions::default()).unwrap();
    assert!(matches!(
        second.login(UserType::User, &common::pin(common::USER_PIN)),
        Err(DeviceError::DriverBug(DriverBug::ObjectUnusableAfterLogin(Rv::GeneralError)))
    ));
    assert!(!second.is_logged_in());
    assert_eq!(token.call_counts().get(FnIdx::Encrypt), 1);
}

#[test]
fn failed_initialise_closes_the_session() {
    common::init_logging();
    let token = common::soft_token(SoftTokenSettings {
        encrypt_error: Some(Rv::GeneralError),
        ..Default::default()
    });
    let device = Device::open_soft(token.clone(), DeviceOptions::default()).unwrap();
    assert!(matches!(
        device.initialise(&common::pin("12345678")),
        Err(DeviceError::DriverBug(DriverBug::ObjectUnusableAfterLogin(_)))
    ));
    assert!(!device.is_logged_in());
    assert!(!device.flags().has(DeviceFlags::ACTIVE));
    assert_eq!(token.call_counts().get(FnIdx::Logout), 1);
    assert_eq!(token.call_counts().get(FnIdx::CloseSession), 2);
    assert!(matches!(device.set_so_pin(&common::pin("87654321")), Err(DeviceError::NotInitialized)));
}

#[test]
fn removable_token_is_asked_about_its_login() {
    let settings = SoftTokenSettings {
        removable: true,
        ..Default::default()
    };
    let (token, device) = common::logged_in_device(settings, DeviceOptions::default());
    assert!(device.flags().has(DeviceFlags::REMOVABLE));
    assert!(device.is_logged_in());
    let queries = token.call_counts().get(FnIdx::TokenInfo);

    token.update_settings(|settings| settings.token_present = false);
    assert!(!device.is_logged_in());
    assert!(token.call_counts().get(FnIdx::TokenInfo) > queries);
    assert!(matches!(device.check_logged_in(), Err(DeviceError::Signalled)));

    token.update_settings(|settings| settings.token_present = true);
    assert!(device.is_logged_in());
}

#[test]
fn token_bootstrap() {
    common::init_logging();
    let token = common::soft_token(SoftTokenSettings::default());
    let device = Device::open_soft(token.clone(), DeviceOptions::default()).unwrap();

    assert!(matches!(device.set_so_pin(&common::pin("87654321")), Err(DeviceError::NotInitialized)));
    device.initialise(&common::pin("12345678")).unwrap();
    assert!(device.is_logged_in());
    assert_eq!(token.call_counts().get(FnIdx::InitToken), 1);

    device.set_so_pin(&common::pin("87654321")).unwrap();
    device.set_user_pin(&common::pin("5678")).unwrap();
    device.logout().unwrap();

    assert!(device.login(UserType::User, &common::pin(common::USER_PIN)).is_err());
    device.login(UserType::User, &common::pin("5678")).unwrap();
    device.logout().unwrap();
    device.login(UserType::So, &common::pin("87654321")).unwrap();
}

#[test]
fn zeroise_wipes_objects() {
    let (token, device) = common::default_device();
    let mut ctx = device.create_context(Algorithm::Aes, Mode::Ecb).unwrap();
    ctx.set_persistent("doomed").unwrap();
    ctx.load_key(&[7; 16]).unwrap();
    drop(ctx);
    assert_eq!(token.object_count(), 1);

    device.zeroise(&common::pin("12345678")).unwrap();
    assert_eq!(token.object_count(), 0);
    assert!(!device.is_logged_in());
}

#[test]
fn clock_and_self_test() {
    let (_token, device) = common::default_device();
    assert!(matches!(device.token_time(), Err(DeviceError::NotAvailable)));
    assert!(matches!(device.self_test(), Err(DeviceError::NotAvailable)));

    let settings = SoftTokenSettings {
        has_clock: true,
        ..Default::default()
    };
    let (_token, device) = common::logged_in_device(settings, DeviceOptions::default());
    assert!(device.flags().has(DeviceFlags::HAS_CLOCK));
    let drift = (device.token_time().unwrap() - chrono::Utc::now()).num_seconds().abs();
    assert!(drift < 60);
}

#[test]
fn close_releases_the_session() {
    let (token, device) = common::default_device();
    device.close().unwrap();
    assert!(!device.flags().has(DeviceFlags::ACTIVE));
    assert_eq!(token.call_counts().get(FnIdx::CloseSession), 1);
    assert!(matches!(
        device.create_context(Algorithm::Aes, Mode::Ecb),
        Err(DeviceError::NotAvailable)
    ));
}

#[test]
fn broken_token_is_reported() {
    common::init_logging();
    let token = common::soft_token(SoftTokenSettings {
        open_session_error: Some(Rv::DeviceRemoved),
        ..Default::default()
    });
    assert!(Device::open_soft(token, DeviceOptions::default()).is_err());
}

#[test]
fn devices_from_configuration() {
    common::init_logging();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "use_hardware_keygen = false").unwrap();
    writeln!(file, "max_chain_length = 4").unwrap();
    writeln!(file, "drivers = []").unwrap();
    let config = Config::read_config(file.path()).unwrap();
    assert!(config.drivers.is_empty());

    let mut registry = DriverRegistry::from_config(&config);
    assert!(registry.is_empty());

    let token = common::soft_token(SoftTokenSettings::default());
    registry.register_soft(token.clone()).unwrap();
    let device = registry
        .open_device(&format!("{}::Soft token", AUTODETECT_DRIVER), config.device.clone())
        .unwrap();
    assert_eq!(device.label(), "Soft token");
    assert_eq!(device.options().max_chain_length, 4);

    device.login(UserType::User, &common::pin(common::USER_PIN)).unwrap();
    let mut ctx = device.create_context(Algorithm::Aes, Mode::Ecb).unwrap();
    ctx.generate_key(16).unwrap();
    assert_eq!(token.call_counts().get(FnIdx::GenerateKey), 0);
    drop(ctx);
    drop(device);

    drop(registry);
    assert_eq!(token.call_counts().get(FnIdx::Finalize), 1);
}
