//! Certificates stored on a device.

use std::{collections::HashSet, fmt};

use openssl::{
    nid::Nid,
    x509::{X509, X509Ref},
};

use crate::{
    constants::{DUMMY_LABEL, FAILSAFE_ITERATIONS_LARGE},
    device::{
        Device, DeviceGuard,
        error::{DeviceError, map_error},
        object::read_bytes,
        search::{find_all, find_unique},
        token::{Attribute, AttributeType, CertificateType, ObjectClass, ObjectHandle},
        traced,
        util::der_integer,
    },
};

//------------ DeviceCertificate ---------------------------------------------

/// An X.509 certificate read from a device.
#[derive(Clone)]
pub struct DeviceCertificate {
    handle: ObjectHandle,
    x509: X509,
    id: Option<Vec<u8>>,
}

impl fmt::Debug for DeviceCertificate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceCertificate")
            .field("handle", &self.handle)
            .field("subject", &self.common_name())
            .field("id", &self.id.as_deref().map(hex::encode))
            .finish()
    }
}

impl DeviceCertificate {
    /// Reads and parses the certificate in an object.
    pub(crate) fn read(guard: &DeviceGuard, handle: ObjectHandle) -> Result<Self, DeviceError> {
        let der = read_bytes(guard, handle, AttributeType::Value)?;
        let x509 = X509::from_der(&der).map_err(|_| DeviceError::BadData)?;
        let id = read_bytes(guard, handle, AttributeType::Id).ok();
        Ok(DeviceCertificate { handle, x509, id })
    }

    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    pub fn x509(&self) -> &X509Ref {
        &self.x509
    }

    /// The `CKA_ID` the certificate is stored under.
    pub fn id(&self) -> Option<&[u8]> {
        self.id.as_deref()
    }

    pub fn common_name(&self) -> Option<String> {
        common_name(&self.x509)
    }

    pub fn subject_der(&self) -> Result<Vec<u8>, DeviceError> {
        Ok(self.x509.subject_name().to_der()?)
    }

    pub fn issuer_der(&self) -> Result<Vec<u8>, DeviceError> {
        Ok(self.x509.issuer_name().to_der()?)
    }

    /// Whether subject and issuer are the same name.
    pub fn is_self_issued(&self) -> bool {
        match (self.subject_der(), self.issuer_der()) {
            (Ok(subject), Ok(issuer)) => subject == issuer,
            _ => false,
        }
    }
}

pub(crate) fn common_name(x509: &X509Ref) -> Option<String> {
    x509.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}

/// The key identifier of the certificate's public key.
pub(crate) fn certificate_key_id(x509: &X509Ref) -> Result<Vec<u8>, DeviceError> {
    let key = x509.public_key()?;
    Ok(openssl::sha::sha1(&key.public_key_to_der()?).to_vec())
}

//------------ Device --------------------------------------------------------

impl Device {
    /// Stores a certificate on the token.
    ///
    /// The certificate is labelled with its subject common name and given
    /// the identifier of its key, so it is found alongside that key.
    pub fn add_certificate(&self, cert: &X509Ref) -> Result<ObjectHandle, DeviceError> {
        let label = common_name(cert).unwrap_or_else(|| DUMMY_LABEL.to_string());
        let serial = cert.serial_number().to_bn()?.to_vec();
        let template = vec![
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::CertificateType(CertificateType::X_509),
            Attribute::Token(true),
            Attribute::Id(certificate_key_id(cert)?),
            Attribute::Subject(cert.subject_name().to_der()?),
            Attribute::Issuer(cert.issuer_name().to_der()?),
            Attribute::SerialNumber(der_integer(&serial)),
            Attribute::Value(cert.to_der()?),
            Attribute::Label(label.into_bytes()),
        ];
        let guard = self.lock();
        let session = guard.session()?;
        let handle = traced("C_CreateObject", guard.token().create_object(session, &template))
            .map_err(|rv| map_error(rv, DeviceError::Failed))?;
        debug!("Stored certificate as object {}", handle);
        Ok(handle)
    }

    /// Every X.509 certificate on the token that can be parsed.
    pub fn certificates(&self) -> Result<Vec<DeviceCertificate>, DeviceError> {
        let guard = self.lock();
        let handles = find_all(
            &guard,
            &[
                Attribute::Class(ObjectClass::CERTIFICATE),
                Attribute::CertificateType(CertificateType::X_509),
            ],
            FAILSAFE_ITERATIONS_LARGE,
        )?;
        Ok(handles
            .into_iter()
            .filter_map(|handle| DeviceCertificate::read(&guard, handle).ok())
            .collect())
    }

    /// Builds the chain from `leaf` towards its root.
    ///
    /// Each step looks for the certificate whose subject is the current
    /// issuer. The walk stops at a self-issued certificate, at a missing
    /// issuer, at a certificate already in the chain, or after the
    /// configured maximum number of links.
    pub fn certificate_chain(&self, leaf: &DeviceCertificate) -> Result<Vec<DeviceCertificate>, DeviceError> {
        let max = self.options().max_chain_length;
        let guard = self.lock();
        let mut seen = HashSet::from([leaf.handle()]);
        let mut chain = vec![leaf.clone()];

        while chain.len() < max {
            let Some(current) = chain.last() else {
                break;
            };
            if current.is_self_issued() {
                break;
            }
            let template = [
                Attribute::Class(ObjectClass::CERTIFICATE),
                Attribute::Subject(current.issuer_der()?),
            ];
            let issuer = match find_unique(&guard, &template) {
                Ok(handle) => handle,
                Err(DeviceError::Duplicate) => match find_all(&guard, &template, 1)?.first() {
                    Some(handle) => *handle,
                    None => break,
                },
                Err(DeviceError::NotFound) => break,
                Err(err) => return Err(err),
            };
            if !seen.insert(issuer) {
                debug!("Certificate chain loops back to object {}", issuer);
                break;
            }
            match DeviceCertificate::read(&guard, issuer) {
                Ok(cert) => chain.push(cert),
                Err(_) => break,
            }
        }
        Ok(chain)
    }
}
