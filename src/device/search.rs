//! Finding objects on a device.
//!
//! Lookups follow a fixed order. First an exact template search on the
//! identifier, and for names a second one with the name taken as a
//! `CKA_ID`, since plenty of tokens keep the visible name there. If both
//! miss and enumeration is enabled, every certificate on the token is
//! parsed and compared, and keys are found through the certificate that
//! matched. A search that must find one object reports a second match as
//! `Duplicate`.

use std::sync::Arc;

use openssl::{
    pkey::{Id, PKey, Public},
    x509::X509Ref,
};

use crate::{
    constants::{DUMMY_LABEL, FAILSAFE_ITERATIONS_LARGE},
    device::{
        Device, DeviceGuard,
        bridge::{NativeContext, public_key_data, read_public_key_data},
        capability::Actions,
        cert::{DeviceCertificate, certificate_key_id, common_name},
        context::{DeviceContext, Permissions, PublicKeyData},
        error::{DeviceError, map_error},
        mechanism::{Algorithm, AlgorithmClass, Mode},
        object::{read_bytes, read_flag},
        token::{Attribute, AttributeType, CertificateType, ObjectClass, ObjectHandle},
        traced,
        util::der_integer,
    },
};

//------------ KeyIdentifier -------------------------------------------------

/// How the caller names the object they want.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeyIdentifier {
    /// The object label.
    Name(String),
    /// `CKA_URL`.
    Uri(String),
    /// `CKA_ID`.
    KeyId(Vec<u8>),
    /// A certificate's issuer, DER encoded, and its serial number as the
    /// unsigned big-endian value.
    IssuerAndSerial { issuer: Vec<u8>, serial: Vec<u8> },
}

//------------ ItemType, LookupMode, FoundItem -------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ItemType {
    PublicKey,
    PrivateKey,
    SecretKey,
    Certificate,
}

impl ItemType {
    fn class(self) -> ObjectClass {
        match self {
            ItemType::PublicKey => ObjectClass::PUBLIC_KEY,
            ItemType::PrivateKey => ObjectClass::PRIVATE_KEY,
            ItemType::SecretKey => ObjectClass::SECRET_KEY,
            ItemType::Certificate => ObjectClass::CERTIFICATE,
        }
    }
}

/// How much of a found object to hand back.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LookupMode {
    Full,
    /// Only the label.
    LabelOnly,
    /// Only whether it is there.
    Exists,
}

#[derive(Debug)]
pub enum FoundItem {
    /// A key that stays on the device.
    Key(DeviceContext),
    /// A public key, taken off the device.
    PublicKey(NativeContext),
    Certificate(DeviceCertificate),
    Label(String),
    Exists,
}

//------------ Template searches ---------------------------------------------

/// Finds the one object matching `template`.
///
/// At most two handles are fetched, which is enough to tell a unique
/// match from a duplicate.
pub(crate) fn find_unique(guard: &DeviceGuard, template: &[Attribute]) -> Result<ObjectHandle, DeviceError> {
    let handles = find_handles(guard, template, 2)?;
    match handles.as_slice() {
        [] => Err(DeviceError::NotFound),
        [handle] => Ok(*handle),
        _ => Err(DeviceError::Duplicate),
    }
}

/// Finds up to `max` objects matching `template`.
pub(crate) fn find_all(guard: &DeviceGuard, template: &[Attribute], max: usize) -> Result<Vec<ObjectHandle>, DeviceError> {
    find_handles(guard, template, max)
}

fn find_handles(guard: &DeviceGuard, template: &[Attribute], max: usize) -> Result<Vec<ObjectHandle>, DeviceError> {
    let session = guard.session()?;
    let token = guard.token();
    traced("C_FindObjectsInit", token.find_objects_init(session, template))
        .map_err(|rv| map_error(rv, DeviceError::NotFound))?;
    let res = traced("C_FindObjects", token.find_objects(session, max));
    if let Err(rv) = traced("C_FindObjectsFinal", token.find_objects_final(session)) {
        debug!("C_FindObjectsFinal failed: {}", rv);
    }
    res.map_err(|rv| map_error(rv, DeviceError::NotFound))
}

/// The search templates for an identifier, in the order they are tried.
fn templates(class: ObjectClass, id: &KeyIdentifier, extra: &[Attribute]) -> Vec<Vec<Attribute>> {
    let with = |attr: Attribute| {
        let mut template = vec![Attribute::Class(class), attr];
        template.extend_from_slice(extra);
        template
    };
    match id {
        KeyIdentifier::Name(name) => vec![
            with(Attribute::Label(name.as_bytes().to_vec())),
            with(Attribute::Id(name.as_bytes().to_vec())),
        ],
        KeyIdentifier::Uri(uri) => vec![with(Attribute::Url(uri.as_bytes().to_vec()))],
        KeyIdentifier::KeyId(key_id) => vec![with(Attribute::Id(key_id.clone()))],
        KeyIdentifier::IssuerAndSerial { issuer, serial } => {
            let template = |serial: Vec<u8>| {
                let mut template = vec![
                    Attribute::Class(ObjectClass::CERTIFICATE),
                    Attribute::Issuer(issuer.clone()),
                    Attribute::SerialNumber(serial),
                ];
                template.extend_from_slice(extra);
                template
            };
            vec![template(der_integer(serial)), template(serial.clone())]
        }
    }
}

/// Tries each template in turn, moving on only when one finds nothing.
fn find_by_templates(guard: &DeviceGuard, templates: &[Vec<Attribute>]) -> Result<ObjectHandle, DeviceError> {
    for template in templates {
        match find_unique(guard, template) {
            Err(DeviceError::NotFound) => continue,
            res => return res,
        }
    }
    Err(DeviceError::NotFound)
}

/// Whether a certificate matches an identifier.
fn certificate_matches(guard: &DeviceGuard, handle: ObjectHandle, x509: &X509Ref, id: &KeyIdentifier) -> bool {
    match id {
        KeyIdentifier::Name(name) => common_name(x509).as_deref() == Some(name.as_str()),
        KeyIdentifier::Uri(uri) => read_bytes(guard, handle, AttributeType::Url)
            .map(|url| url == uri.as_bytes())
            .unwrap_or(false),
        KeyIdentifier::KeyId(key_id) => certificate_key_id(x509)
            .map(|cert_id| &cert_id == key_id)
            .unwrap_or(false),
        KeyIdentifier::IssuerAndSerial { issuer, serial } => {
            let same_issuer = x509
                .issuer_name()
                .to_der()
                .map(|der| &der == issuer)
                .unwrap_or(false);
            let same_serial = x509
                .serial_number()
                .to_bn()
                .map(|bn| bn.to_vec() == strip_leading_zeros(serial))
                .unwrap_or(false);
            same_issuer && same_serial
        }
    }
}

fn strip_leading_zeros(value: &[u8]) -> &[u8] {
    let start = value.iter().position(|b| *b != 0).unwrap_or(value.len());
    &value[start..]
}

/// Walks every certificate looking for the one matching `id`.
fn find_certificate_by_enumeration(
    guard: &DeviceGuard,
    id: &KeyIdentifier,
) -> Result<DeviceCertificate, DeviceError> {
    let handles = find_all(
        guard,
        &[
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::CertificateType(CertificateType::X_509),
        ],
        FAILSAFE_ITERATIONS_LARGE,
    )?;
    let mut found: Option<DeviceCertificate> = None;
    for handle in handles {
        let cert = match DeviceCertificate::read(guard, handle) {
            Ok(cert) => cert,
            Err(err) => {
                debug!("Skipping certificate object {}: {}", handle, err);
                continue;
            }
        };
        if !certificate_matches(guard, handle, cert.x509(), id) {
            continue;
        }
        if found.is_some() {
            return Err(DeviceError::Duplicate);
        }
        found = Some(cert);
    }
    found.ok_or(DeviceError::NotFound)
}

//------------ Device --------------------------------------------------------

impl Device {
    /// Looks up an item.
    pub fn get_item(
        self: &Arc<Self>,
        item: ItemType,
        id: &KeyIdentifier,
        mode: LookupMode,
    ) -> Result<FoundItem, DeviceError> {
        let guard = self.lock();
        let handle = self.locate(&guard, item, id)?;
        let class = read_class(&guard, handle)?;
        match mode {
            LookupMode::Exists => return Ok(FoundItem::Exists),
            LookupMode::LabelOnly => return Ok(FoundItem::Label(read_label(&guard, handle))),
            LookupMode::Full => {}
        }
        match (item, class) {
            (ItemType::Certificate, _) | (ItemType::PublicKey, ObjectClass::CERTIFICATE) => {
                let cert = DeviceCertificate::read(&guard, handle)?;
                if item == ItemType::Certificate {
                    return Ok(FoundItem::Certificate(cert));
                }
                let key = certificate_public_key(cert.x509())?;
                let algorithm = match key.id() {
                    Id::RSA => Algorithm::Rsa,
                    Id::DSA => Algorithm::Dsa,
                    Id::EC => Algorithm::Ecdsa,
                    _ => return Err(DeviceError::NotAvailable),
                };
                let permissions = Permissions::all(Actions::ENCRYPT | Actions::VERIFY);
                Ok(FoundItem::PublicKey(NativeContext::new(algorithm, key, permissions)?))
            }
            (ItemType::PublicKey, _) => {
                let ctx = self.context_from_object(&guard, handle)?;
                drop(guard);
                Ok(FoundItem::PublicKey(ctx.to_native()?))
            }
            _ => {
                let ctx = self.context_from_object(&guard, handle)?;
                Ok(FoundItem::Key(ctx))
            }
        }
    }

    /// Finds the handle of an item, trying every fallback there is.
    fn locate(&self, guard: &DeviceGuard, item: ItemType, id: &KeyIdentifier) -> Result<ObjectHandle, DeviceError> {
        match item {
            ItemType::SecretKey => find_by_templates(guard, &templates(ObjectClass::SECRET_KEY, id, &[])),
            ItemType::Certificate => self.locate_certificate(guard, id),
            ItemType::PrivateKey => self.locate_private_key(guard, id),
            ItemType::PublicKey => {
                match self.locate_certificate(guard, id) {
                    Err(DeviceError::NotFound) => {}
                    res => return res,
                }
                match self.locate_key(guard, ObjectClass::PUBLIC_KEY, id) {
                    Err(DeviceError::NotFound) => {}
                    res => return res,
                }
                // A private key may point at a certificate, or carry the
                // public components itself.
                let private = self.locate_private_key(guard, id)?;
                if let Ok(key_id) = read_bytes(guard, private, AttributeType::Id) {
                    let template = [Attribute::Class(ObjectClass::CERTIFICATE), Attribute::Id(key_id)];
                    if let Ok(cert) = find_unique(guard, &template) {
                        return Ok(cert);
                    }
                }
                Ok(private)
            }
        }
    }

    fn locate_certificate(&self, guard: &DeviceGuard, id: &KeyIdentifier) -> Result<ObjectHandle, DeviceError> {
        match find_by_templates(guard, &templates(ObjectClass::CERTIFICATE, id, &[])) {
            Err(DeviceError::NotFound) if self.options().search_by_enumeration => {
                find_certificate_by_enumeration(guard, id).map(|cert| cert.handle())
            }
            res => res,
        }
    }

    /// Finds a public or private key, going through its certificate if the
    /// direct search misses.
    fn locate_key(&self, guard: &DeviceGuard, class: ObjectClass, id: &KeyIdentifier) -> Result<ObjectHandle, DeviceError> {
        self.locate_key_with(guard, class, id, &[])
    }

    fn locate_key_with(
        &self,
        guard: &DeviceGuard,
        class: ObjectClass,
        id: &KeyIdentifier,
        extra: &[Attribute],
    ) -> Result<ObjectHandle, DeviceError> {
        let direct = match id {
            KeyIdentifier::IssuerAndSerial { .. } => Err(DeviceError::NotFound),
            _ => find_by_templates(guard, &templates(class, id, extra)),
        };
        match direct {
            Err(DeviceError::NotFound) => {}
            res => return res,
        }
        let cert = self.locate_certificate(guard, id)?;
        let key_id = read_bytes(guard, cert, AttributeType::Id).map_err(|_| DeviceError::NotFound)?;
        find_by_templates(guard, &templates(class, &KeyIdentifier::KeyId(key_id), extra))
    }

    /// Private keys that share an identifier are told apart by what they
    /// may do: one that decrypts is preferred, then one that unwraps.
    fn locate_private_key(&self, guard: &DeviceGuard, id: &KeyIdentifier) -> Result<ObjectHandle, DeviceError> {
        match self.locate_key(guard, ObjectClass::PRIVATE_KEY, id) {
            Err(DeviceError::Duplicate) => {}
            res => return res,
        }
        debug!("Several private keys match, trying for one that decrypts");
        match self.locate_key_with(guard, ObjectClass::PRIVATE_KEY, id, &[Attribute::Decrypt(true)]) {
            Err(DeviceError::Duplicate) | Err(DeviceError::NotFound) => {}
            res => return res,
        }
        self.locate_key_with(guard, ObjectClass::PRIVATE_KEY, id, &[Attribute::Unwrap(true)])
    }

    /// Creates a context for a key object found on the device.
    ///
    /// The context never owns the object, dropping it leaves the object
    /// alone. Everything is read before the context is built, a context
    /// must not be dropped while the device lock is held.
    fn context_from_object(self: &Arc<Self>, guard: &DeviceGuard, object: ObjectHandle) -> Result<DeviceContext, DeviceError> {
        let session = guard.session()?;
        let class = read_class(guard, object)?;
        let key_type = match traced(
            "C_GetAttributeValue",
            guard.token().get_attribute(session, object, AttributeType::KeyType),
        ) {
            Ok(Attribute::KeyType(key_type)) => key_type,
            _ => return Err(DeviceError::NotAvailable),
        };
        let algorithm = Algorithm::from_key_type(key_type).ok_or(DeviceError::NotAvailable)?;
        let cap = guard.capabilities.find(algorithm).cloned().ok_or(DeviceError::NotAvailable)?;
        let permissions = object_permissions(guard, object, class, algorithm, cap.actions)?;
        let mode = match algorithm.class() {
            AlgorithmClass::Conventional => cap.default_record().ok_or(DeviceError::NotAvailable)?.mode,
            _ => Mode::None,
        };
        let label = read_label(guard, object);
        let key_id = read_bytes(guard, object, AttributeType::Id).ok();

        let mut alt_object = None;
        let mut public = None;
        let key_size;
        if algorithm.is_pkc() {
            public = read_public_key_data(guard, object, algorithm);
            if let (None, Some(key_id)) = (&public, &key_id) {
                let (found, companion) = companion_public_key_data(guard, key_id, algorithm);
                public = found;
                if algorithm == Algorithm::Dh {
                    alt_object = companion;
                }
            }
            key_size = match &public {
                Some(PublicKeyData::Rsa { modulus, .. }) => strip_leading_zeros(modulus).len(),
                Some(PublicKeyData::Dsa { p, .. }) | Some(PublicKeyData::Dh { p, .. }) => strip_leading_zeros(p).len(),
                Some(PublicKeyData::Ec { curve, .. }) => curve.field_size(),
                None => cap.key_size,
            };
        } else {
            key_size = match guard.token().get_attribute(session, object, AttributeType::ValueLen) {
                Ok(Attribute::ValueLen(len)) => len as usize,
                _ => cap.key_size,
            };
        }

        let mut ctx = DeviceContext::new(self.clone(), algorithm, mode, permissions);
        ctx.mark_persistent(true);
        ctx.set_label(&label);
        ctx.key_id = key_id;
        ctx.key_size = key_size;
        ctx.object = Some(object);
        ctx.alt_object = alt_object;
        if let Some(PublicKeyData::Dh { y, .. }) = &public {
            ctx.dh_public_value = Some(y.clone());
        }
        ctx.public = public;
        debug!("Found {} key '{}' in object {}", algorithm, label, object);
        Ok(ctx)
    }

    /// Deletes the keys an identifier names, along with their
    /// certificates.
    ///
    /// Private keys take their public halves with them, public keys their
    /// certificates.
    pub fn delete_item(&self, item: ItemType, id: &KeyIdentifier) -> Result<(), DeviceError> {
        let guard = self.lock();
        let session = guard.session()?;
        let classes: &[ObjectClass] = match item {
            ItemType::PrivateKey => &[ObjectClass::PRIVATE_KEY, ObjectClass::PUBLIC_KEY],
            ItemType::PublicKey => &[ObjectClass::PUBLIC_KEY],
            ItemType::SecretKey => &[ObjectClass::SECRET_KEY],
            ItemType::Certificate => &[ObjectClass::CERTIFICATE],
        };

        let mut doomed = vec![];
        let mut key_ids = vec![];
        for class in classes {
            for template in templates(*class, id, &[]) {
                let handles = find_all(&guard, &template, FAILSAFE_ITERATIONS_LARGE)?;
                if handles.is_empty() {
                    continue;
                }
                for handle in handles {
                    if let Ok(key_id) = read_bytes(&guard, handle, AttributeType::Id) {
                        key_ids.push(key_id);
                    }
                    doomed.push(handle);
                }
                break;
            }
        }
        if doomed.is_empty() {
            return Err(DeviceError::NotFound);
        }
        if item != ItemType::SecretKey {
            for key_id in key_ids {
                let template = [Attribute::Class(ObjectClass::CERTIFICATE), Attribute::Id(key_id)];
                doomed.extend(find_all(&guard, &template, FAILSAFE_ITERATIONS_LARGE)?);
            }
        }
        doomed.sort_unstable();
        doomed.dedup();

        for handle in doomed {
            traced("C_DestroyObject", guard.token().destroy_object(session, handle))
                .map_err(|rv| map_error(rv, DeviceError::Failed))?;
            debug!("Deleted object {}", handle);
        }
        Ok(())
    }
}

/// Looks for the public components of a key under its `CKA_ID`, first in
/// a public key object and then in a certificate.
///
/// Returns the public key object too, if that is where they came from.
fn companion_public_key_data(
    guard: &DeviceGuard,
    key_id: &[u8],
    algorithm: Algorithm,
) -> (Option<PublicKeyData>, Option<ObjectHandle>) {
    let template = [Attribute::Class(ObjectClass::PUBLIC_KEY), Attribute::Id(key_id.to_vec())];
    if let Ok(handle) = find_unique(guard, &template) {
        return (read_public_key_data(guard, handle, algorithm), Some(handle));
    }
    let template = [Attribute::Class(ObjectClass::CERTIFICATE), Attribute::Id(key_id.to_vec())];
    let data = find_unique(guard, &template)
        .and_then(|handle| DeviceCertificate::read(guard, handle))
        .and_then(|cert| certificate_public_key(cert.x509()))
        .and_then(|key| public_key_data(&key))
        .ok();
    (data, None)
}

/// The public key of a certificate.
fn certificate_public_key(x509: &X509Ref) -> Result<PKey<Public>, DeviceError> {
    Ok(PKey::public_key_from_der(&x509.public_key()?.public_key_to_der()?)?)
}

//------------ Object attributes ---------------------------------------------

fn read_class(guard: &DeviceGuard, object: ObjectHandle) -> Result<ObjectClass, DeviceError> {
    let session = guard.session()?;
    match traced(
        "C_GetAttributeValue",
        guard.token().get_attribute(session, object, AttributeType::Class),
    ) {
        Ok(Attribute::Class(class)) => Ok(class),
        Ok(_) => Err(DeviceError::Failed),
        Err(rv) => Err(map_error(rv, DeviceError::NotFound)),
    }
}

fn read_label(guard: &DeviceGuard, object: ObjectHandle) -> String {
    match read_bytes(guard, object, AttributeType::Label) {
        Ok(label) if !label.is_empty() => String::from_utf8_lossy(&label).into_owned(),
        _ => DUMMY_LABEL.to_string(),
    }
}

/// Works out what a found key may be used for.
fn object_permissions(
    guard: &DeviceGuard,
    object: ObjectHandle,
    class: ObjectClass,
    algorithm: Algorithm,
    supported: Actions,
) -> Result<Permissions, DeviceError> {
    let flag = |attr| read_flag(guard, object, attr);
    let mut actions = Actions::empty();
    if flag(AttributeType::Encrypt) || flag(AttributeType::Wrap) {
        actions.insert(Actions::ENCRYPT);
    }
    if flag(AttributeType::Decrypt) || flag(AttributeType::Unwrap) {
        actions.insert(Actions::DECRYPT);
    }
    if flag(AttributeType::Sign) {
        actions.insert(Actions::SIGN);
    }
    if flag(AttributeType::Verify) {
        actions.insert(Actions::VERIFY);
    }
    if flag(AttributeType::Derive) {
        actions.insert(Actions::DERIVE);
    }
    if algorithm.class() == AlgorithmClass::Mac && actions.intersects(Actions::SIGN | Actions::VERIFY) {
        // MACs are computed by signing, whichever of the two was set.
        actions.insert(Actions::SIGN | Actions::VERIFY);
    }

    let restricted_rsa = algorithm == Algorithm::Rsa
        && class == ObjectClass::PRIVATE_KEY
        && !(actions.contains(Actions::DECRYPT) && actions.contains(Actions::SIGN));
    if class == ObjectClass::PRIVATE_KEY {
        // The public half comes with the private one.
        if actions.contains(Actions::DECRYPT) {
            actions.insert(Actions::ENCRYPT);
        }
        if actions.contains(Actions::SIGN) {
            actions.insert(Actions::VERIFY);
        }
    }

    let mut allowed = Actions::empty();
    for action in [Actions::ENCRYPT, Actions::DECRYPT, Actions::SIGN, Actions::VERIFY, Actions::DERIVE] {
        if actions.contains(action) && supported.contains(action) {
            allowed.insert(action);
        }
    }
    if allowed.is_empty() {
        return Err(DeviceError::Permission);
    }
    Ok(Permissions {
        actions: allowed,
        internal_only: restricted_rsa || algorithm.is_dlp_or_ecc(),
    })
}
