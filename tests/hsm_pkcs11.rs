//! Runs against a real PKCS#11 library, for example SoftHSM v2.
//!
//! Needs the `hsm-tests-pkcs11` feature plus the library path and user PIN
//! in the environment.
#![cfg(feature = "hsm-tests-pkcs11")]

mod common;

use std::{env, path::PathBuf};

use p11device::{
    config::DeviceOptions,
    constants::{P11DEVICE_ENV_TEST_LIB, P11DEVICE_ENV_TEST_PIN},
    device::{
        driver::DriverRegistry,
        mechanism::{Algorithm, Mode},
        search::{FoundItem, ItemType, KeyIdentifier, LookupMode},
        token::UserType,
    },
};

#[test]
fn sign_with_a_stored_key() {
    common::init_logging();
    let lib_path = PathBuf::from(env::var(P11DEVICE_ENV_TEST_LIB).unwrap());
    let pin = env::var(P11DEVICE_ENV_TEST_PIN).unwrap();

    let mut registry = DriverRegistry::new();
    let driver_name = registry.load(&lib_path, Some("Test HSM")).unwrap().name().to_string();
    let device = registry
        .open_device(&format!("{}::0", driver_name), DeviceOptions::default())
        .unwrap();
    device.login(UserType::User, &common::pin(&pin)).unwrap();

    let label = format!("p11device test {}", std::process::id());
    let mut ctx = device.create_context(Algorithm::Rsa, Mode::None).unwrap();
    ctx.set_persistent(&label).unwrap();
    ctx.generate_key(256).unwrap();
    drop(ctx);

    let FoundItem::Key(mut key) = device
        .get_item(ItemType::PrivateKey, &KeyIdentifier::Name(label.clone()), LookupMode::Full)
        .unwrap()
    else {
        panic!("expected a key");
    };
    let block = common::type1_block(&openssl::sha::sha256(b"hsm"), 256);
    let signature = key.sign(&block).unwrap();
    key.verify(&block, &signature).unwrap();
    drop(key);

    device
        .delete_item(ItemType::PrivateKey, &KeyIdentifier::Name(label))
        .unwrap();
}
