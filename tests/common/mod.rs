//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use secrecy::SecretString;

use p11device::{
    config::DeviceOptions,
    device::{
        Device,
        token::{
            UserType,
            soft::{SoftToken, SoftTokenSettings},
        },
    },
};

pub const USER_PIN: &str = "1234";

pub fn init_logging() {
    let _ = stderrlog::new().verbosity(3).init();
}

pub fn pin(pin: &str) -> SecretString {
    SecretString::new(pin.to_string())
}

pub fn soft_token(settings: SoftTokenSettings) -> Arc<SoftToken> {
    Arc::new(SoftToken::new(settings))
}

/// Opens a device on a fresh software token and logs in as the user.
pub fn logged_in_device(settings: SoftTokenSettings, options: DeviceOptions) -> (Arc<SoftToken>, Arc<Device>) {
    init_logging();
    let token = soft_token(settings);
    let device = Device::open_soft(token.clone(), options).unwrap();
    device.login(UserType::User, &pin(USER_PIN)).unwrap();
    (token, device)
}

pub fn default_device() -> (Arc<SoftToken>, Arc<Device>) {
    logged_in_device(SoftTokenSettings::default(), DeviceOptions::default())
}

/// A PKCS #1 type 2 block of `size` bytes around `payload`.
pub fn type2_block(payload: &[u8], size: usize) -> Vec<u8> {
    let mut block = vec![0x00, 0x02];
    block.resize(size - payload.len() - 1, 0x5A);
    block.push(0x00);
    block.extend_from_slice(payload);
    block
}

/// A PKCS #1 type 1 block of `size` bytes around `payload`.
pub fn type1_block(payload: &[u8], size: usize) -> Vec<u8> {
    let mut block = vec![0x00, 0x01];
    block.resize(size - payload.len() - 1, 0xFF);
    block.push(0x00);
    block.extend_from_slice(payload);
    block
}
