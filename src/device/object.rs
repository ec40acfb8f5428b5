//! Creating key objects on a device.
//!
//! Keys get onto a device in one of two ways: the key material is built
//! into a template and handed to `C_CreateObject`, or the device generates
//! the key itself from a template without material. Public-key contexts
//! read their public components back afterwards, so they can be bridged
//! into native contexts.

use openssl::{
    bn::{BigNum, BigNumContext},
    dh::Dh,
    dsa::Dsa,
    ec::PointConversionForm,
    pkey::{Id, PKey, PKeyRef, Private, Public},
};

use crate::device::{
    DeviceGuard,
    capability::Actions,
    context::{DeviceContext, PublicKeyData},
    error::{DeviceError, map_error},
    mechanism::{AlgorithmClass, Family, MechanismRecord},
    token::{Attribute, AttributeType, KeyType, Mechanism, MechanismType, ObjectClass, ObjectHandle},
    traced,
    util::{Curve, adjust_key_parity, der_octet_string, der_octet_string_content},
};

/// The public exponent used for every generated RSA key.
const RSA_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// Overwrites the key material in a template.
fn wipe_template(template: &mut [Attribute]) {
    for attr in template.iter_mut().filter(|attr| attr.is_key_material()) {
        let bytes = match attr {
            Attribute::Value(v)
            | Attribute::PrivateExponent(v)
            | Attribute::Prime1(v)
            | Attribute::Prime2(v)
            | Attribute::Exponent1(v)
            | Attribute::Exponent2(v)
            | Attribute::Coefficient(v) => v,
            _ => continue,
        };
        bytes.iter_mut().for_each(|b| *b = 0);
    }
}

fn wipe(bytes: &mut [u8]) {
    bytes.iter_mut().for_each(|b| *b = 0);
}

/// Reads one byte string attribute of an object.
pub(crate) fn read_bytes(
    guard: &DeviceGuard,
    object: ObjectHandle,
    attr: AttributeType,
) -> Result<Vec<u8>, DeviceError> {
    let session = guard.session()?;
    let value = traced("C_GetAttributeValue", guard.token().get_attribute(session, object, attr))
        .map_err(|rv| map_error(rv, DeviceError::NotFound))?;
    value
        .as_bytes()
        .map(<[u8]>::to_vec)
        .ok_or(DeviceError::Failed)
}

/// Reads one boolean attribute, treating a missing one as false.
pub(crate) fn read_flag(guard: &DeviceGuard, object: ObjectHandle, attr: AttributeType) -> bool {
    let Ok(session) = guard.session() else {
        return false;
    };
    traced("C_GetAttributeValue", guard.token().get_attribute(session, object, attr))
        .ok()
        .and_then(|attr| attr.as_bool())
        .unwrap_or(false)
}

/// Creates an object from a template, wiping the template afterwards.
fn create_object(guard: &DeviceGuard, template: &mut [Attribute]) -> Result<ObjectHandle, DeviceError> {
    let session = guard.session()?;
    let res = traced("C_CreateObject", guard.token().create_object(session, template));
    wipe_template(template);
    res.map_err(|rv| map_error(rv, DeviceError::Failed))
}

impl DeviceContext {
    fn common_attributes(&self, template: &mut Vec<Attribute>) {
        template.push(Attribute::Token(self.is_persistent()));
    }

    fn label_attribute(&self, template: &mut Vec<Attribute>) {
        if self.is_persistent() {
            if let Some(label) = self.label() {
                template.push(Attribute::Label(label.as_bytes().to_vec()));
            }
        }
    }

    /// Builds the template for a secret key.
    ///
    /// Without a value the template is the one used for generation on the
    /// device.
    fn secret_key_template(&self, record: &MechanismRecord, value: Option<Vec<u8>>) -> Vec<Attribute> {
        let mut template = vec![
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::KeyType(record.key_type),
        ];
        self.common_attributes(&mut template);
        template.push(Attribute::Private(true));
        template.push(Attribute::Sensitive(true));
        if self.algorithm().class() == AlgorithmClass::Mac {
            template.push(Attribute::Sign(true));
            template.push(Attribute::Verify(true));
        } else {
            template.push(Attribute::Encrypt(true));
            template.push(Attribute::Decrypt(true));
        }
        if let Some(value) = value {
            template.push(Attribute::Value(value));
        }
        self.label_attribute(&mut template);
        template
    }

    pub(crate) fn record(&self) -> Result<&'static MechanismRecord, DeviceError> {
        let cap = self.capability()?;
        match self.algorithm().class() {
            AlgorithmClass::Conventional => cap.record(self.mode()),
            _ => cap.default_record(),
        }
        .ok_or(DeviceError::NotAvailable)
    }

    //--- Secret keys

    /// Loads a conventional or MAC key onto the device.
    pub fn load_key(&mut self, key: &[u8]) -> Result<(), DeviceError> {
        if self.algorithm().is_pkc() {
            return Err(DeviceError::NotAvailable);
        }
        if self.has_key() {
            return Err(DeviceError::AlreadyInitialized);
        }
        let cap = self.capability()?;
        let record = self.record()?;
        if key.len() < cap.min_key_size || key.len() > cap.max_key_size {
            return Err(DeviceError::argument("key size out of range"));
        }

        let mut value = key.to_vec();
        let mut key_size = value.len();
        if record.key_type == KeyType::DES3 && value.len() <= 16 {
            // Two-key triple DES becomes K1 K2 K1.
            value.resize(24, 0);
            let (head, tail) = value.split_at_mut(16);
            tail.copy_from_slice(&head[..8]);
            key_size = cap.max_key_size;
        }
        if self.algorithm().needs_parity() {
            adjust_key_parity(&mut value);
        }

        let mut template = self.secret_key_template(record, Some(value));
        let guard = self.lock();
        let handle = create_object(&guard, &mut template)?;
        drop(guard);

        self.object = Some(handle);
        self.key_size = key_size;
        debug!("Loaded {} key into object {}", self.algorithm(), handle);
        Ok(())
    }

    /// Generates a new key of `key_size` bytes.
    ///
    /// ECDSA keys use the smallest named curve of at least that size.
    pub fn generate_key(&mut self, key_size: usize) -> Result<(), DeviceError> {
        if self.has_key() {
            return Err(DeviceError::AlreadyInitialized);
        }
        let cap = self.capability()?;
        if key_size < cap.min_key_size || key_size > cap.max_key_size {
            return Err(DeviceError::argument("key size out of range"));
        }
        match self.algorithm().family() {
            Family::Conventional | Family::Hmac => self.generate_secret_key(key_size),
            Family::Rsa => self.generate_rsa_key(key_size),
            Family::Dsa => self.generate_dsa_key(key_size),
            Family::Ecdsa => self.generate_ec_key(key_size),
            Family::Dh => self.generate_dh_key(key_size),
        }?;
        if self.is_persistent() && self.algorithm().is_pkc() {
            self.set_key_id()?;
        }
        Ok(())
    }

    fn generate_secret_key(&mut self, key_size: usize) -> Result<(), DeviceError> {
        let cap = self.capability()?;
        let record = self.record()?;
        let use_device = self.device().options().use_hardware_keygen && cap.supports(Actions::GENERATE);
        if !use_device {
            let mut value = vec![0; key_size];
            openssl::rand::rand_bytes(&mut value).map_err(|_| DeviceError::RandomFailure)?;
            let res = self.load_key(&value);
            wipe(&mut value);
            return res;
        }

        let mut template = self.secret_key_template(record, None);
        let key_size = match record.key_type {
            KeyType::DES => 8,
            KeyType::DES3 => 24,
            _ => {
                template.push(Attribute::ValueLen(key_size as u64));
                key_size
            }
        };
        let guard = self.lock();
        let session = guard.session()?;
        let handle = traced(
            "C_GenerateKey",
            guard
                .token()
                .generate_key(session, &Mechanism::new(record.keygen_mechanism), &template),
        )
        .map_err(|rv| map_error(rv, DeviceError::Failed))?;
        drop(guard);
        self.object = Some(handle);
        self.key_size = key_size;
        debug!("Generated {} key in object {}", self.algorithm(), handle);
        Ok(())
    }

    //--- Key pair templates

    fn public_template(&self, key_type: KeyType) -> Vec<Attribute> {
        let mut template = vec![Attribute::Class(ObjectClass::PUBLIC_KEY), Attribute::KeyType(key_type)];
        self.common_attributes(&mut template);
        match key_type {
            KeyType::RSA => {
                template.push(Attribute::Verify(true));
                template.push(Attribute::Encrypt(true));
            }
            KeyType::DH => template.push(Attribute::Derive(true)),
            _ => template.push(Attribute::Verify(true)),
        }
        self.label_attribute(&mut template);
        template
    }

    fn private_template(&self, key_type: KeyType) -> Vec<Attribute> {
        let mut template = vec![Attribute::Class(ObjectClass::PRIVATE_KEY), Attribute::KeyType(key_type)];
        self.common_attributes(&mut template);
        template.push(Attribute::Private(true));
        template.push(Attribute::Sensitive(true));
        match key_type {
            KeyType::RSA => {
                template.push(Attribute::Sign(true));
                template.push(Attribute::Decrypt(true));
                template.push(Attribute::Unwrap(true));
            }
            KeyType::DH => template.push(Attribute::Derive(true)),
            _ => template.push(Attribute::Sign(true)),
        }
        self.label_attribute(&mut template);
        template
    }

    fn generate_pair(
        &mut self,
        guard: &DeviceGuard,
        mechanism: MechanismType,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), DeviceError> {
        let session = guard.session()?;
        let (public, private) = traced(
            "C_GenerateKeyPair",
            guard
                .token()
                .generate_key_pair(session, &Mechanism::new(mechanism), public_template, private_template),
        )
        .map_err(|rv| map_error(rv, DeviceError::Failed))?;
        self.object = Some(private);
        self.alt_object = Some(public);
        Ok((public, private))
    }

    //--- RSA

    fn generate_rsa_key(&mut self, key_size: usize) -> Result<(), DeviceError> {
        let record = self.record()?;
        let mut public_template = self.public_template(KeyType::RSA);
        public_template.push(Attribute::ModulusBits(key_size as u64 * 8));
        public_template.push(Attribute::PublicExponent(RSA_PUBLIC_EXPONENT.to_vec()));
        let private_template = self.private_template(KeyType::RSA);

        let device = self.device().clone();
        let guard = device.lock();
        let (public, _) = self.generate_pair(&guard, record.keygen_mechanism, &public_template, &private_template)?;
        let modulus = read_bytes(&guard, public, AttributeType::Modulus)?;
        let exponent = read_bytes(&guard, public, AttributeType::PublicExponent)?;
        drop(guard);

        self.key_size = modulus.len();
        self.public = Some(PublicKeyData::Rsa { modulus, exponent });
        debug!("Generated {}-bit RSA key", self.key_size * 8);
        Ok(())
    }

    //--- DSA

    fn generate_dsa_key(&mut self, key_size: usize) -> Result<(), DeviceError> {
        let record = self.record()?;
        let device = self.device().clone();
        let guard = device.lock();

        // Domain parameters take a while, other users of the device needn't
        // wait for them.
        let (guard, params) = guard.unlocked(|| Dsa::generate(key_size as u32 * 8));
        let params = params?;
        let (p, q, g) = (params.p().to_vec(), params.q().to_vec(), params.g().to_vec());
        drop(params);

        let mut public_template = self.public_template(KeyType::DSA);
        public_template.push(Attribute::Prime(p.clone()));
        public_template.push(Attribute::Subprime(q.clone()));
        public_template.push(Attribute::Base(g.clone()));
        let private_template = self.private_template(KeyType::DSA);

        let (public, _) = self.generate_pair(&guard, record.keygen_mechanism, &public_template, &private_template)?;
        let y = read_bytes(&guard, public, AttributeType::Value)?;
        drop(guard);

        self.key_size = p.len();
        self.public = Some(PublicKeyData::Dsa { p, q, g, y });
        Ok(())
    }

    //--- ECDSA

    fn generate_ec_key(&mut self, key_size: usize) -> Result<(), DeviceError> {
        let record = self.record()?;
        let curve = Curve::for_key_size(key_size).ok_or_else(|| DeviceError::argument("no curve of that size"))?;
        let mut public_template = self.public_template(KeyType::EC);
        public_template.push(Attribute::EcParams(curve.params().to_vec()));
        let private_template = self.private_template(KeyType::EC);

        let device = self.device().clone();
        let guard = device.lock();
        let (public, _) = self.generate_pair(&guard, record.keygen_mechanism, &public_template, &private_template)?;
        let point = read_bytes(&guard, public, AttributeType::EcPoint)?;
        drop(guard);

        self.key_size = curve.field_size();
        self.public = Some(PublicKeyData::Ec {
            curve,
            point: der_octet_string_content(&point).to_vec(),
        });
        Ok(())
    }

    //--- DH

    fn generate_dh_key(&mut self, key_size: usize) -> Result<(), DeviceError> {
        let record = self.record()?;
        let params = if key_size <= 128 {
            Dh::get_1024_160()?
        } else {
            Dh::get_2048_256()?
        };
        let p = params.prime_p().to_vec();
        let g = params.generator().to_vec();
        drop(params);

        let mut public_template = self.public_template(KeyType::DH);
        public_template.push(Attribute::Prime(p.clone()));
        public_template.push(Attribute::Base(g.clone()));
        let private_template = self.private_template(KeyType::DH);

        let device = self.device().clone();
        let guard = device.lock();
        let (public, _) = self.generate_pair(&guard, record.keygen_mechanism, &public_template, &private_template)?;
        let y = read_bytes(&guard, public, AttributeType::Value)?;
        drop(guard);

        self.key_size = p.len();
        self.dh_public_value = Some(y.clone());
        self.public = Some(PublicKeyData::Dh { p, g, y });
        Ok(())
    }

    //--- Loading key pairs

    /// Loads a private key, with its public components, onto the device.
    pub fn load_private_key(&mut self, key: &PKeyRef<Private>) -> Result<(), DeviceError> {
        if self.has_key() {
            return Err(DeviceError::AlreadyInitialized);
        }
        let device = self.device().clone();
        match (self.algorithm().family(), key.id()) {
            (Family::Rsa, Id::RSA) => {
                let rsa = key.rsa()?;
                let mut template = self.private_template(KeyType::RSA);
                template.push(Attribute::Modulus(rsa.n().to_vec()));
                template.push(Attribute::PublicExponent(rsa.e().to_vec()));
                template.push(Attribute::PrivateExponent(rsa.d().to_vec()));
                if let (Some(p), Some(q), Some(dp), Some(dq), Some(qi)) =
                    (rsa.p(), rsa.q(), rsa.dmp1(), rsa.dmq1(), rsa.iqmp())
                {
                    template.push(Attribute::Prime1(p.to_vec()));
                    template.push(Attribute::Prime2(q.to_vec()));
                    template.push(Attribute::Exponent1(dp.to_vec()));
                    template.push(Attribute::Exponent2(dq.to_vec()));
                    template.push(Attribute::Coefficient(qi.to_vec()));
                }
                let guard = device.lock();
                self.object = Some(create_object(&guard, &mut template)?);
                drop(guard);
                self.key_size = rsa.size() as usize;
                self.public = Some(PublicKeyData::Rsa {
                    modulus: rsa.n().to_vec(),
                    exponent: rsa.e().to_vec(),
                });
            }
            (Family::Dsa, Id::DSA) => {
                let dsa = key.dsa()?;
                let mut template = self.private_template(KeyType::DSA);
                template.push(Attribute::Prime(dsa.p().to_vec()));
                template.push(Attribute::Subprime(dsa.q().to_vec()));
                template.push(Attribute::Base(dsa.g().to_vec()));
                template.push(Attribute::Value(dsa.priv_key().to_vec()));
                let guard = device.lock();
                self.object = Some(create_object(&guard, &mut template)?);
                drop(guard);
                self.key_size = dsa.p().num_bytes() as usize;
                self.public = Some(PublicKeyData::Dsa {
                    p: dsa.p().to_vec(),
                    q: dsa.q().to_vec(),
                    g: dsa.g().to_vec(),
                    y: dsa.pub_key().to_vec(),
                });
            }
            (Family::Ecdsa, Id::EC) => {
                let ec = key.ec_key()?;
                let curve = ec
                    .group()
                    .curve_name()
                    .and_then(Curve::from_nid)
                    .ok_or(DeviceError::NotAvailable)?;
                let mut ctx = BigNumContext::new()?;
                let point = ec
                    .public_key()
                    .to_bytes(ec.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)?;
                let mut template = self.private_template(KeyType::EC);
                template.push(Attribute::EcParams(curve.params().to_vec()));
                template.push(Attribute::Value(ec.private_key().to_vec()));
                let guard = device.lock();
                self.object = Some(create_object(&guard, &mut template)?);
                drop(guard);
                self.key_size = curve.field_size();
                self.public = Some(PublicKeyData::Ec { curve, point });
            }
            (Family::Dh, Id::DH) => {
                let dh = key.dh()?;
                let (p, g) = (dh.prime_p().to_vec(), dh.generator().to_vec());
                let y = dh.public_key().to_vec();
                let mut private_template = self.private_template(KeyType::DH);
                private_template.push(Attribute::Prime(p.clone()));
                private_template.push(Attribute::Base(g.clone()));
                private_template.push(Attribute::Value(dh.private_key().to_vec()));
                let mut public_template = self.public_template(KeyType::DH);
                public_template.push(Attribute::Prime(p.clone()));
                public_template.push(Attribute::Base(g.clone()));
                public_template.push(Attribute::Value(y.clone()));
                let guard = device.lock();
                let private = create_object(&guard, &mut private_template)?;
                self.object = Some(private);
                self.alt_object = Some(create_object(&guard, &mut public_template)?);
                drop(guard);
                self.key_size = p.len();
                self.dh_public_value = Some(y.clone());
                self.public = Some(PublicKeyData::Dh { p, g, y });
            }
            _ => return Err(DeviceError::argument("key does not match the context algorithm")),
        }
        if self.is_persistent() {
            self.set_key_id()?;
        }
        Ok(())
    }

    /// Loads a public key onto the device.
    pub fn load_public_key(&mut self, key: &PKeyRef<Public>) -> Result<(), DeviceError> {
        if self.has_key() {
            return Err(DeviceError::AlreadyInitialized);
        }
        let cap = self.capability()?;
        if !cap.actions.intersects(Actions::ENCRYPT | Actions::VERIFY) {
            return Err(DeviceError::NotAvailable);
        }
        let (mut template, public, key_size) = match (self.algorithm().family(), key.id()) {
            (Family::Rsa, Id::RSA) => {
                let rsa = key.rsa()?;
                let mut template = self.public_template(KeyType::RSA);
                template.push(Attribute::Modulus(rsa.n().to_vec()));
                template.push(Attribute::PublicExponent(rsa.e().to_vec()));
                let public = PublicKeyData::Rsa {
                    modulus: rsa.n().to_vec(),
                    exponent: rsa.e().to_vec(),
                };
                (template, public, rsa.size() as usize)
            }
            (Family::Dsa, Id::DSA) => {
                let dsa = key.dsa()?;
                let mut template = self.public_template(KeyType::DSA);
                template.push(Attribute::Prime(dsa.p().to_vec()));
                template.push(Attribute::Subprime(dsa.q().to_vec()));
                template.push(Attribute::Base(dsa.g().to_vec()));
                template.push(Attribute::Value(dsa.pub_key().to_vec()));
                let public = PublicKeyData::Dsa {
                    p: dsa.p().to_vec(),
                    q: dsa.q().to_vec(),
                    g: dsa.g().to_vec(),
                    y: dsa.pub_key().to_vec(),
                };
                (template, public, dsa.p().num_bytes() as usize)
            }
            (Family::Ecdsa, Id::EC) => {
                let ec = key.ec_key()?;
                let curve = ec
                    .group()
                    .curve_name()
                    .and_then(Curve::from_nid)
                    .ok_or(DeviceError::NotAvailable)?;
                let mut ctx = BigNumContext::new()?;
                let point = ec
                    .public_key()
                    .to_bytes(ec.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)?;
                let mut template = self.public_template(KeyType::EC);
                template.push(Attribute::EcParams(curve.params().to_vec()));
                template.push(Attribute::EcPoint(der_octet_string(&point)));
                (template, PublicKeyData::Ec { curve, point }, curve.field_size())
            }
            _ => return Err(DeviceError::argument("key does not match the context algorithm")),
        };

        let device = self.device().clone();
        let guard = device.lock();
        let handle = create_object(&guard, &mut template)?;
        drop(guard);
        self.object = Some(handle);
        self.key_size = key_size;
        self.public = Some(public);
        self.permissions.actions.remove(Actions::DECRYPT | Actions::SIGN);
        if self.is_persistent() {
            self.set_key_id()?;
        }
        Ok(())
    }

    //--- Key identifiers

    /// The key identifier: the SHA-1 hash of the public key's
    /// SubjectPublicKeyInfo.
    pub fn compute_key_id(&self) -> Result<Vec<u8>, DeviceError> {
        let pkey = self.native_public_key()?;
        Ok(openssl::sha::sha1(&pkey.public_key_to_der()?).to_vec())
    }

    /// Sets `CKA_ID` on both halves of a key pair.
    fn set_key_id(&mut self) -> Result<(), DeviceError> {
        let key_id = self.compute_key_id()?;
        let device = self.device().clone();
        let guard = device.lock();
        let session = guard.session()?;
        for object in [self.object, self.alt_object].into_iter().flatten() {
            traced(
                "C_SetAttributeValue",
                guard
                    .token()
                    .set_attributes(session, object, &[Attribute::Id(key_id.clone())]),
            )
            .map_err(|rv| map_error(rv, DeviceError::Failed))?;
        }
        drop(guard);
        debug!("Set ID {} on {} key", hex::encode(&key_id), self.algorithm());
        self.key_id = Some(key_id);
        Ok(())
    }
}

/// Builds native public key data from public components.
pub(crate) fn public_key_from_data(data: &PublicKeyData) -> Result<PKey<Public>, DeviceError> {
    let pkey = match data {
        PublicKeyData::Rsa { modulus, exponent } => PKey::from_rsa(openssl::rsa::Rsa::from_public_components(
            BigNum::from_slice(modulus)?,
            BigNum::from_slice(exponent)?,
        )?)?,
        PublicKeyData::Dsa { p, q, g, y } => PKey::from_dsa(Dsa::from_public_components(
            BigNum::from_slice(p)?,
            BigNum::from_slice(q)?,
            BigNum::from_slice(g)?,
            BigNum::from_slice(y)?,
        )?)?,
        PublicKeyData::Ec { curve, point } => {
            let group = openssl::ec::EcGroup::from_curve_name(curve.nid())?;
            let mut ctx = BigNumContext::new()?;
            let point = openssl::ec::EcPoint::from_bytes(&group, point, &mut ctx)?;
            PKey::from_ec_key(openssl::ec::EcKey::from_public_key(&group, &point)?)?
        }
        PublicKeyData::Dh { p, g, y } => PKey::from_dh(
            Dh::from_pqg(BigNum::from_slice(p)?, None, BigNum::from_slice(g)?)?
                .set_public_key(BigNum::from_slice(y)?)?,
        )?,
    };
    Ok(pkey)
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wipe_clears_only_key_material() {
        let mut template = vec![
            Attribute::Label(b"label".to_vec()),
            Attribute::Value(vec![1, 2, 3]),
            Attribute::PrivateExponent(vec![4, 5]),
        ];
        wipe_template(&mut template);
        assert_eq!(template[0], Attribute::Label(b"label".to_vec()));
        assert_eq!(template[1], Attribute::Value(vec![0, 0, 0]));
        assert_eq!(template[2], Attribute::PrivateExponent(vec![0, 0]));
    }
}
