mod common;

use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    ec::{EcGroup, EcKey},
    ecdsa::EcdsaSig,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    x509::{X509, X509NameBuilder},
};

use p11device::{
    config::DeviceOptions,
    device::{
        error::DeviceError,
        mechanism::{Algorithm, Mode},
        search::{FoundItem, ItemType, KeyIdentifier, LookupMode},
        token::{
            Attribute, CertificateType, KeyType, ObjectClass,
            soft::{FnIdx, SoftTokenSettings},
        },
    },
};

fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn certificate(subject: &str, issuer: &str, serial: u32, key: &PKey<Private>, signer: &PKey<Private>) -> X509 {
    let name = |cn: &str| {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
        name.build()
    };
    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&BigNum::from_u32(serial).unwrap().to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name(subject)).unwrap();
    builder.set_issuer_name(&name(issuer)).unwrap();
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
    builder.sign(signer, MessageDigest::sha256()).unwrap();
    builder.build()
}

fn name(name: &str) -> KeyIdentifier {
    KeyIdentifier::Name(name.to_string())
}

#[test]
fn name_falls_back_to_key_id() {
    let (token, device) = common::default_device();
    token.insert_object(&[
        Attribute::Class(ObjectClass::SECRET_KEY),
        Attribute::KeyType(KeyType::AES),
        Attribute::Token(true),
        Attribute::Id(b"backup-key".to_vec()),
        Attribute::Encrypt(true),
        Attribute::Decrypt(true),
        Attribute::Value(vec![0x33; 16]),
    ]);

    let before = token.call_counts().get(FnIdx::FindObjectsInit);
    let found = device
        .get_item(ItemType::SecretKey, &name("backup-key"), LookupMode::Full)
        .unwrap();
    assert_eq!(token.call_counts().get(FnIdx::FindObjectsInit) - before, 2);
    assert_eq!(
        token.call_counts().get(FnIdx::FindObjectsInit),
        token.call_counts().get(FnIdx::FindObjectsFinal)
    );

    let FoundItem::Key(mut ctx) = found else {
        panic!("expected a key");
    };
    assert_eq!(ctx.algorithm(), Algorithm::Aes);
    assert_eq!(ctx.key_id(), Some(&b"backup-key"[..]));
    assert!(ctx.is_persistent());

    assert_eq!(ctx.mode(), Mode::Ecb);
    let cipher = ctx.encrypt(&[0x44; 16]).unwrap();
    assert_eq!(cipher.len(), 16);
    drop(ctx);
    assert_eq!(token.call_counts().get(FnIdx::DestroyObject), 0);
}

#[test]
fn lookup_modes() {
    let (token, device) = common::default_device();
    token.insert_object(&[
        Attribute::Class(ObjectClass::SECRET_KEY),
        Attribute::KeyType(KeyType::AES),
        Attribute::Token(true),
        Attribute::Label(b"mac key".to_vec()),
        Attribute::Encrypt(true),
        Attribute::Decrypt(true),
        Attribute::Value(vec![0x33; 16]),
    ]);

    assert!(matches!(
        device.get_item(ItemType::SecretKey, &name("mac key"), LookupMode::Exists),
        Ok(FoundItem::Exists)
    ));
    match device.get_item(ItemType::SecretKey, &name("mac key"), LookupMode::LabelOnly) {
        Ok(FoundItem::Label(label)) => assert_eq!(label, "mac key"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
        device.get_item(ItemType::SecretKey, &name("no such key"), LookupMode::Exists),
        Err(DeviceError::NotFound)
    ));
}

#[test]
fn duplicate_names_are_reported() {
    let (_token, device) = common::default_device();
    for _ in 0..2 {
        let mut ctx = device.create_context(Algorithm::Aes, Mode::Ecb).unwrap();
        ctx.set_persistent("twin").unwrap();
        ctx.load_key(&[9; 16]).unwrap();
    }
    assert!(matches!(
        device.get_item(ItemType::SecretKey, &name("twin"), LookupMode::Full),
        Err(DeviceError::Duplicate)
    ));
}

#[test]
fn private_key_by_name() {
    let (_token, device) = common::default_device();
    let mut ctx = device.create_context(Algorithm::Rsa, Mode::None).unwrap();
    ctx.set_persistent("signing key").unwrap();
    ctx.generate_key(128).unwrap();
    let key_id = ctx.key_id().unwrap().to_vec();
    drop(ctx);

    let FoundItem::Key(mut found) = device
        .get_item(ItemType::PrivateKey, &name("signing key"), LookupMode::Full)
        .unwrap()
    else {
        panic!("expected a key");
    };
    assert_eq!(found.algorithm(), Algorithm::Rsa);
    assert_eq!(found.key_size(), 128);
    assert_eq!(found.label(), Some("signing key"));

    let block = common::type1_block(&openssl::sha::sha256(b"data"), 128);
    let signature = found.sign(&block).unwrap();
    found.verify(&block, &signature).unwrap();
    drop(found);

    let FoundItem::PublicKey(public) = device
        .get_item(ItemType::PublicKey, &KeyIdentifier::KeyId(key_id), LookupMode::Full)
        .unwrap()
    else {
        panic!("expected a public key");
    };
    public.verify(&block, &signature).unwrap();

    device.delete_item(ItemType::PrivateKey, &name("signing key")).unwrap();
    assert!(matches!(
        device.get_item(ItemType::PrivateKey, &name("signing key"), LookupMode::Exists),
        Err(DeviceError::NotFound)
    ));
    assert!(matches!(
        device.get_item(ItemType::PublicKey, &name("signing key"), LookupMode::Exists),
        Err(DeviceError::NotFound)
    ));
    assert!(matches!(
        device.delete_item(ItemType::PrivateKey, &name("signing key")),
        Err(DeviceError::NotFound)
    ));
}

#[test]
fn public_key_from_certificate() {
    let (_token, device) = common::default_device();
    let key = ec_key();
    let cert = certificate("Alice", "Alice", 1, &key, &key);
    device.add_certificate(&cert).unwrap();

    let FoundItem::PublicKey(public) = device
        .get_item(ItemType::PublicKey, &name("Alice"), LookupMode::Full)
        .unwrap()
    else {
        panic!("expected a public key");
    };
    assert_eq!(public.algorithm(), Algorithm::Ecdsa);

    let digest = openssl::sha::sha256(b"message");
    let signature = EcdsaSig::sign(&digest, &key.ec_key().unwrap())
        .unwrap()
        .to_der()
        .unwrap();
    public.verify(&digest, &signature).unwrap();

    let issuer = cert.issuer_name().to_der().unwrap();
    let by_serial = KeyIdentifier::IssuerAndSerial {
        issuer,
        serial: vec![1],
    };
    match device.get_item(ItemType::Certificate, &by_serial, LookupMode::Full) {
        Ok(FoundItem::Certificate(found)) => assert_eq!(found.common_name().as_deref(), Some("Alice")),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn certificates_are_found_by_enumeration() {
    let key = ec_key();
    let cert = certificate("Carol", "Carol", 7, &key, &key);
    let unlabelled = [
        Attribute::Class(ObjectClass::CERTIFICATE),
        Attribute::CertificateType(CertificateType::X_509),
        Attribute::Token(true),
        Attribute::Subject(cert.subject_name().to_der().unwrap()),
        Attribute::Value(cert.to_der().unwrap()),
    ];

    let (token, device) = common::default_device();
    token.insert_object(&unlabelled);
    match device.get_item(ItemType::Certificate, &name("Carol"), LookupMode::Full) {
        Ok(FoundItem::Certificate(found)) => assert_eq!(found.common_name().as_deref(), Some("Carol")),
        other => panic!("unexpected {:?}", other),
    }

    let options = DeviceOptions {
        search_by_enumeration: false,
        ..Default::default()
    };
    let (token, device) = common::logged_in_device(SoftTokenSettings::default(), options);
    token.insert_object(&unlabelled);
    assert!(matches!(
        device.get_item(ItemType::Certificate, &name("Carol"), LookupMode::Full),
        Err(DeviceError::NotFound)
    ));
}

#[test]
fn cyclic_chains_terminate() {
    let (_token, device) = common::default_device();
    let (key_a, key_b) = (ec_key(), ec_key());
    device.add_certificate(&certificate("A", "B", 1, &key_a, &key_b)).unwrap();
    device.add_certificate(&certificate("B", "A", 2, &key_b, &key_a)).unwrap();

    let leaf = device
        .certificates()
        .unwrap()
        .into_iter()
        .find(|cert| cert.common_name().as_deref() == Some("A"))
        .unwrap();
    let chain = device.certificate_chain(&leaf).unwrap();
    let names: Vec<_> = chain.iter().filter_map(|cert| cert.common_name()).collect();
    assert_eq!(names, ["A", "B"]);
}

#[test]
fn chains_stop_at_the_root_or_the_limit() {
    let (root_key, ca_key, leaf_key) = (ec_key(), ec_key(), ec_key());
    let certs = [
        certificate("Root", "Root", 1, &root_key, &root_key),
        certificate("CA", "Root", 2, &ca_key, &root_key),
        certificate("Leaf", "CA", 3, &leaf_key, &ca_key),
    ];

    let (_token, device) = common::default_device();
    for cert in &certs {
        device.add_certificate(cert).unwrap();
    }
    let leaf = device
        .certificates()
        .unwrap()
        .into_iter()
        .find(|cert| cert.common_name().as_deref() == Some("Leaf"))
        .unwrap();
    let names: Vec<_> = device
        .certificate_chain(&leaf)
        .unwrap()
        .iter()
        .filter_map(|cert| cert.common_name())
        .collect();
    assert_eq!(names, ["Leaf", "CA", "Root"]);

    let options = DeviceOptions {
        max_chain_length: 2,
        ..Default::default()
    };
    let (_token, device) = common::logged_in_device(SoftTokenSettings::default(), options);
    for cert in &certs {
        device.add_certificate(cert).unwrap();
    }
    let leaf = device
        .certificates()
        .unwrap()
        .into_iter()
        .find(|cert| cert.common_name().as_deref() == Some("Leaf"))
        .unwrap();
    assert_eq!(device.certificate_chain(&leaf).unwrap().len(), 2);
}
