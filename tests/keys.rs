mod common;

use openssl::{hash::MessageDigest, pkey::PKey, sign::Signer};

use p11device::{
    config::DeviceOptions,
    device::{
        error::DeviceError,
        mechanism::{Algorithm, Mode},
        token::{
            Attribute,
            soft::{FnIdx, SoftToken, SoftTokenSettings},
        },
        util::has_odd_parity,
    },
};

fn stored_value(token: &SoftToken, handle: u64) -> Vec<u8> {
    token
        .object_attributes(handle)
        .unwrap()
        .into_iter()
        .find_map(|attr| match attr {
            Attribute::Value(value) => Some(value),
            _ => None,
        })
        .unwrap()
}

#[test]
fn des_keys_get_odd_parity() {
    let (token, device) = common::default_device();
    let mut ctx = device.create_context(Algorithm::Des, Mode::Cbc).unwrap();
    ctx.load_key(&[0x00, 0x02, 0x04, 0x06, 0x08, 0x0A, 0x0C, 0x0E]).unwrap();

    let value = stored_value(&token, ctx.object_handle().unwrap());
    assert_eq!(value.len(), 8);
    assert!(has_odd_parity(&value));
}

#[test]
fn two_key_triple_des_is_expanded() {
    let (token, device) = common::default_device();
    let mut ctx = device.create_context(Algorithm::TripleDes, Mode::Ecb).unwrap();
    let key: Vec<u8> = (1..=16).map(|b| b * 7).collect();
    ctx.load_key(&key).unwrap();

    assert_eq!(ctx.key_size(), 24);
    let value = stored_value(&token, ctx.object_handle().unwrap());
    assert_eq!(value.len(), 24);
    assert_eq!(value[..8], value[16..]);
    assert!(has_odd_parity(&value));
}

#[test]
fn key_sizes_are_checked() {
    let (_token, device) = common::default_device();
    let mut ctx = device.create_context(Algorithm::Aes, Mode::Ecb).unwrap();
    assert!(matches!(ctx.load_key(&[0; 8]), Err(DeviceError::Argument(_))));
    ctx.load_key(&[0; 16]).unwrap();
    assert!(matches!(ctx.load_key(&[0; 16]), Err(DeviceError::AlreadyInitialized)));

    let mut rsa = device.create_context(Algorithm::Rsa, Mode::None).unwrap();
    assert!(matches!(rsa.load_key(&[0; 16]), Err(DeviceError::NotAvailable)));
}

#[test]
fn cbc_chains_the_iv() {
    let (_token, device) = common::default_device();
    let mut ctx = device.create_context(Algorithm::Aes, Mode::Cbc).unwrap();
    ctx.load_key(&[0x42; 16]).unwrap();

    let plain = [0x17; 32];
    assert!(matches!(ctx.encrypt(&plain), Err(DeviceError::NotInitialized)));

    ctx.set_iv(&[0; 16]).unwrap();
    let cipher = ctx.encrypt(&plain).unwrap();
    assert_eq!(cipher.len(), 32);
    assert_eq!(ctx.iv(), &cipher[16..]);
    assert!(matches!(ctx.encrypt(&plain[..10]), Err(DeviceError::Argument(_))));

    ctx.set_iv(&[0; 16]).unwrap();
    assert_eq!(ctx.decrypt(&cipher).unwrap(), plain);
}

#[test]
fn generated_secret_keys_use_the_token() {
    let (token, device) = common::default_device();
    let mut ctx = device.create_context(Algorithm::Aes, Mode::Ecb).unwrap();
    ctx.generate_key(32).unwrap();
    assert_eq!(ctx.key_size(), 32);
    assert_eq!(token.call_counts().get(FnIdx::GenerateKey), 1);

    let options = DeviceOptions {
        use_hardware_keygen: false,
        ..Default::default()
    };
    let (token, device) = common::logged_in_device(SoftTokenSettings::default(), options);
    let mut ctx = device.create_context(Algorithm::Aes, Mode::Ecb).unwrap();
    ctx.generate_key(16).unwrap();
    assert_eq!(token.call_counts().get(FnIdx::GenerateKey), 0);
    assert_eq!(token.call_counts().get(FnIdx::CreateObject), 1);
}

#[test]
fn only_ephemeral_objects_are_destroyed() {
    let (token, device) = common::default_device();

    let mut ctx = device.create_context(Algorithm::Aes, Mode::Cbc).unwrap();
    ctx.load_key(&[1; 16]).unwrap();
    let handle = ctx.object_handle().unwrap();
    drop(ctx);
    assert_eq!(token.call_counts().get(FnIdx::DestroyObject), 1);
    assert!(token.object_attributes(handle).is_none());

    let mut ctx = device.create_context(Algorithm::Aes, Mode::Cbc).unwrap();
    ctx.set_persistent("long lived").unwrap();
    ctx.load_key(&[2; 16]).unwrap();
    let handle = ctx.object_handle().unwrap();
    drop(ctx);
    assert_eq!(token.call_counts().get(FnIdx::DestroyObject), 1);
    let attributes = token.object_attributes(handle).unwrap();
    assert!(attributes.contains(&Attribute::Token(true)));
    assert!(attributes.contains(&Attribute::Label(b"long lived".to_vec())));
}

#[test]
fn hmac_holds_the_signing_slot() {
    let (_token, device) = common::default_device();
    let key = [0x0B; 20];
    let mut first = device.create_context(Algorithm::HmacSha1, Mode::None).unwrap();
    first.load_key(&key).unwrap();
    let mut second = device.create_context(Algorithm::HmacSha1, Mode::None).unwrap();
    second.load_key(&key).unwrap();

    assert_eq!(first.mac(b"Hi ").unwrap(), None);
    assert!(matches!(second.mac(b"Hi There"), Err(DeviceError::Busy)));
    assert_eq!(first.mac(b"There").unwrap(), None);
    let mac = first.mac(&[]).unwrap().unwrap();

    assert_eq!(second.mac(b"Hi There").unwrap(), None);
    assert_eq!(second.mac(&[]).unwrap().unwrap(), mac);

    let pkey = PKey::hmac(&key).unwrap();
    let mut signer = Signer::new(MessageDigest::sha1(), &pkey).unwrap();
    signer.update(b"Hi There").unwrap();
    assert_eq!(signer.sign_to_vec().unwrap(), mac);
}

#[test]
fn abandoned_mac_releases_the_session() {
    let (token, device) = common::default_device();
    let key = [0x0C; 20];
    let mut first = device.create_context(Algorithm::HmacSha1, Mode::None).unwrap();
    first.load_key(&key).unwrap();
    assert_eq!(first.mac(b"never finished").unwrap(), None);
    drop(first);
    assert_eq!(token.call_counts().get(FnIdx::SignFinal), 1);

    let mut second = device.create_context(Algorithm::HmacSha1, Mode::None).unwrap();
    second.load_key(&key).unwrap();
    assert_eq!(second.mac(b"data").unwrap(), None);
    let mac = second.mac(&[]).unwrap().unwrap();

    let pkey = PKey::hmac(&key).unwrap();
    let mut signer = Signer::new(MessageDigest::sha1(), &pkey).unwrap();
    signer.update(b"data").unwrap();
    assert_eq!(signer.sign_to_vec().unwrap(), mac);
}

#[test]
fn rsa_round_trip_through_native_encrypt() {
    let (_token, device) = common::default_device();
    let mut ctx = device.create_context(Algorithm::Rsa, Mode::None).unwrap();
    ctx.generate_key(128).unwrap();
    assert_eq!(ctx.key_size(), 128);

    let payload = b"0123456789abcdef0123456789abcdef";
    let native = ctx.to_native().unwrap();
    let cipher = native.encrypt(&common::type2_block(payload, 128)).unwrap();
    assert_eq!(cipher.len(), 128);

    let block = ctx.decrypt(&cipher).unwrap();
    assert_eq!(block.len(), 128);
    assert_eq!(&block[..2], &[0x00, 0x02]);
    assert!(block[2..128 - payload.len() - 1].iter().all(|b| *b != 0));
    assert_eq!(block[128 - payload.len() - 1], 0);
    assert_eq!(&block[128 - payload.len()..], payload);
}

#[test]
fn unwrap_only_keys_still_decrypt() {
    let settings = SoftTokenSettings {
        unwrap_only_private_keys: true,
        ..Default::default()
    };
    let (token, device) = common::logged_in_device(settings, DeviceOptions::default());
    let mut ctx = device.create_context(Algorithm::Rsa, Mode::None).unwrap();
    ctx.generate_key(128).unwrap();

    let payload = [0xC3; 24];
    let cipher = ctx.to_native().unwrap().encrypt(&common::type2_block(&payload, 128)).unwrap();
    let block = ctx.decrypt(&cipher).unwrap();
    assert_eq!(token.call_counts().get(FnIdx::UnwrapKey), 1);
    assert_eq!(block.len(), 128);
    assert_eq!(&block[..2], &[0x00, 0x02]);
    assert_eq!(block[128 - payload.len() - 1], 0);
    assert_eq!(&block[128 - payload.len()..], payload);
}

#[test]
fn rsa_signatures_verify() {
    let (_token, device) = common::default_device();
    let mut ctx = device.create_context(Algorithm::Rsa, Mode::None).unwrap();
    ctx.generate_key(128).unwrap();

    let digest = openssl::sha::sha256(b"signed content");
    let block = common::type1_block(&digest, 128);
    let signature = ctx.sign(&block).unwrap();
    assert_eq!(signature.len(), 128);
    ctx.verify(&block, &signature).unwrap();

    let mut other = block.clone();
    other[127] ^= 1;
    assert!(matches!(ctx.verify(&other, &signature), Err(DeviceError::SignatureInvalid)));
    assert!(matches!(ctx.sign(&common::type2_block(&digest, 128)), Err(DeviceError::BadData)));
}

#[test]
fn ecdsa_signatures_verify() {
    let (_token, device) = common::default_device();
    let mut ctx = device.create_context(Algorithm::Ecdsa, Mode::None).unwrap();
    ctx.generate_key(32).unwrap();

    let digest = openssl::sha::sha256(b"signed content");
    let signature = ctx.sign(&digest).unwrap();
    assert_eq!(signature[0], 0x30);
    ctx.verify(&digest, &signature).unwrap();
    ctx.to_native().unwrap().verify(&digest, &signature).unwrap();
    assert!(ctx.verify(&openssl::sha::sha256(b"other"), &signature).is_err());
}

#[test]
fn dh_agreement() {
    let (_token, device) = common::default_device();
    let mut alice = device.create_context(Algorithm::Dh, Mode::None).unwrap();
    alice.generate_key(128).unwrap();
    let mut bob = device.create_context(Algorithm::Dh, Mode::None).unwrap();
    bob.generate_key(128).unwrap();

    let alice_public = alice.agreement_public_value().unwrap();
    let bob_public = bob.agreement_public_value().unwrap();
    assert_eq!(alice.agree(&bob_public).unwrap(), bob.agree(&alice_public).unwrap());
}

#[test]
fn random_bytes() {
    let (_token, device) = common::default_device();
    let mut first = [0; 32];
    let mut second = [0; 32];
    device.random(&mut first).unwrap();
    device.random(&mut second).unwrap();
    assert_ne!(first, second);
}

#[test]
fn stored_key_attributes() {
    let (token, device) = common::default_device();
    let mut ctx = device.create_context(Algorithm::Rsa, Mode::None).unwrap();
    ctx.set_persistent("signer").unwrap();
    ctx.generate_key(128).unwrap();
    let id = ctx.key_id().unwrap().to_vec();
    assert_eq!(id, ctx.compute_key_id().unwrap());

    let attributes = token.object_attributes(ctx.object_handle().unwrap()).unwrap();
    assert!(attributes.contains(&Attribute::Id(id)));
    assert!(attributes.contains(&Attribute::Private(true)));
    assert!(attributes.contains(&Attribute::Label(b"signer".to_vec())));
}
