//! PKCS#12 packaging of enrolled certificates and loading of holder credentials.
//!
//! Archives carry one certificate bag inside an encrypted content and one
//! shrouded PKCS#8 key bag, with an HMAC over the authenticated safe. Both bags
//! are encrypted with the suite picked by [`Pkcs12Encoding`].
use std::fmt::Display;

use base64ct::{Base64, Encoding};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use const_oid::ObjectIdentifier;
use der::asn1::{Any, BmpString, OctetString, SetOfVec};
use der::{Decode, Encode, Sequence};
use des::TdesEde3;
use hmac::{Hmac, Mac};
use pkcs5::{pbes2, EncryptionScheme};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_cert::attr::Attribute;
use x509_cert::spki::AlgorithmIdentifierOwned;

use crate::api::enrollment::RetrievedCertificate;
use crate::sign::{HolderCredentials, SigningError, SigningKey};

const ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
const ID_ENCRYPTED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.6");
const KEY_BAG: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.10.1.1");
const SHROUDED_KEY_BAG: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.10.1.2");
const CERT_BAG: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.10.1.3");
const X509_CERTIFICATE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.22.1");
const FRIENDLY_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.20");
const LOCAL_KEY_ID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.21");

/// pbeWithSHAAnd3-KeyTripleDES-CBC.
pub const PBE_SHA1_3DES: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.1.3");
/// pbeWithSHAAnd40BitRC2-CBC. Recognised only to be refused.
pub const PBE_SHA1_RC2_40: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.1.6");
pub const PBES2: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.5.13");
pub const SHA1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.14.3.2.26");
pub const SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");

const ITERATIONS: u32 = 2048;
const PBE_SALT_LEN: usize = 8;
const PBES2_SALT_LEN: usize = 16;

// Purpose bytes of the PKCS#12 key derivation.
const KDF_KEY: u8 = 1;
const KDF_IV: u8 = 2;
const KDF_MAC: u8 = 3;

#[derive(Debug, Error)]
pub enum Pkcs12Error {
    #[error("retrieved certificate is not valid base64 DER: {0}")]
    CertificateDecode(String),
    #[error(transparent)]
    Key(#[from] SigningError),
    #[error("failed to build PKCS#12 archive: {0}")]
    Encode(String),
    #[error("failed to parse PKCS#12 archive: {0}")]
    Parse(String),
    #[error("unsupported PKCS#12 algorithm {0}")]
    UnsupportedAlgorithm(ObjectIdentifier),
    #[error("PKCS#12 integrity check failed; wrong password?")]
    BadPassword,
    #[error("PKCS#12 archive must hold exactly one certificate and one key, found {certificates} and {keys}")]
    UnexpectedContents { certificates: usize, keys: usize },
}

fn encode_error(e: impl Display) -> Pkcs12Error {
    Pkcs12Error::Encode(e.to_string())
}

fn parse_error(e: impl Display) -> Pkcs12Error {
    Pkcs12Error::Parse(e.to_string())
}

/// Encryption suite used for both bags and the integrity MAC.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pkcs12Encoding {
    /// PBE-SHA1-3DES for both bags, HMAC-SHA1 integrity. Opens in Windows,
    /// macOS keychain and OpenSSL with or without the legacy provider.
    #[default]
    Legacy,
    /// PBES2 with PBKDF2-HMAC-SHA256 and AES-256-CBC for both bags, HMAC-SHA256
    /// integrity. The OpenSSL 3 default.
    Modern,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkcs12Options {
    pub friendly_name: String,
    pub encoding: Pkcs12Encoding,
}

impl Default for Pkcs12Options {
    fn default() -> Self {
        Self {
            friendly_name: "ksef".into(),
            encoding: Pkcs12Encoding::default(),
        }
    }
}

impl Pkcs12Options {
    pub fn with_friendly_name(mut self, name: impl Into<String>) -> Self {
        self.friendly_name = name.into();
        self
    }

    pub fn with_encoding(mut self, encoding: Pkcs12Encoding) -> Self {
        self.encoding = encoding;
        self
    }
}

/// Package a retrieved certificate and its private key as a password-protected
/// archive. The key must match the certificate. No chain is included.
pub fn package(
    certificate: &RetrievedCertificate,
    key: &SigningKey,
    password: &str,
    options: &Pkcs12Options,
) -> Result<Vec<u8>, Pkcs12Error> {
    let cert_der = Base64::decode_vec(certificate.certificate.trim())
        .map_err(|e| Pkcs12Error::CertificateDecode(e.to_string()))?;
    let credentials = HolderCredentials::from_der(&cert_der, key.to_pkcs8_der()?.as_bytes())?;
    credentials.to_pkcs12(password, options)
}

impl HolderCredentials {
    pub fn to_pkcs12(&self, password: &str, options: &Pkcs12Options) -> Result<Vec<u8>, Pkcs12Error> {
        let cert_der = self.certificate_der()?;
        let key_der = self.key().to_pkcs8_der()?;
        let attributes = bag_attributes(&options.friendly_name, &Sha1::digest(&cert_der))?;

        let cert_bag = SafeBag {
            bag_id: CERT_BAG,
            bag_value: Any::encode_from(&CertBag {
                cert_id: X509_CERTIFICATE,
                cert_value: OctetString::new(cert_der).map_err(encode_error)?,
            })
            .map_err(encode_error)?,
            bag_attributes: Some(attributes.clone()),
        };
        let (key_algorithm, encrypted_key) =
            encrypt(options.encoding, password, key_der.as_bytes())?;
        let key_bag = SafeBag {
            bag_id: SHROUDED_KEY_BAG,
            bag_value: Any::encode_from(&ShroudedKey {
                encryption_algorithm: key_algorithm,
                encrypted_data: OctetString::new(encrypted_key).map_err(encode_error)?,
            })
            .map_err(encode_error)?,
            bag_attributes: Some(attributes),
        };

        let cert_contents = vec![cert_bag].to_der().map_err(encode_error)?;
        let (cert_algorithm, encrypted_certs) =
            encrypt(options.encoding, password, &cert_contents)?;
        let certificates = ContentInfo {
            content_type: ID_ENCRYPTED_DATA,
            content: Any::encode_from(&EncryptedData {
                version: 0,
                encrypted_content_info: EncryptedContentInfo {
                    content_type: ID_DATA,
                    content_encryption_algorithm: cert_algorithm,
                    encrypted_content: Some(
                        OctetString::new(encrypted_certs).map_err(encode_error)?,
                    ),
                },
            })
            .map_err(encode_error)?,
        };
        let keys = data_content(vec![key_bag].to_der().map_err(encode_error)?)?;

        let auth_safe = vec![certificates, keys].to_der().map_err(encode_error)?;
        let mac_data = MacData::seal(options.encoding, password, &auth_safe)?;
        Pfx {
            version: 3,
            auth_safe: data_content(auth_safe)?,
            mac_data: Some(mac_data),
        }
        .to_der()
        .map_err(encode_error)
    }

    /// Load credentials from an archive holding exactly one certificate and key.
    ///
    /// Reads 3DES and PBES2 protected bags. RC2 bags are refused with
    /// [`Pkcs12Error::UnsupportedAlgorithm`].
    pub fn from_pkcs12(der: &[u8], password: &str) -> Result<Self, Pkcs12Error> {
        let pfx = Pfx::from_der(der).map_err(parse_error)?;
        if pfx.version != 3 {
            return Err(Pkcs12Error::Parse(format!("version {}", pfx.version)));
        }
        if pfx.auth_safe.content_type != ID_DATA {
            return Err(Pkcs12Error::UnsupportedAlgorithm(pfx.auth_safe.content_type));
        }
        let auth_safe = pfx
            .auth_safe
            .content
            .decode_as::<OctetString>()
            .map_err(parse_error)?;
        if let Some(mac_data) = &pfx.mac_data {
            mac_data.verify(password, auth_safe.as_bytes())?;
        }

        let mut certificates = Vec::new();
        let mut keys = Vec::new();
        for content in Vec::<ContentInfo>::from_der(auth_safe.as_bytes()).map_err(parse_error)? {
            let bags = content.safe_contents(password)?;
            for bag in Vec::<SafeBag>::from_der(&bags).map_err(parse_error)? {
                match bag.bag_id {
                    id if id == CERT_BAG => {
                        let cert: CertBag = bag.bag_value.decode_as().map_err(parse_error)?;
                        if cert.cert_id == X509_CERTIFICATE {
                            certificates.push(cert.cert_value.into_bytes());
                        }
                    }
                    id if id == SHROUDED_KEY_BAG => {
                        let key: ShroudedKey = bag.bag_value.decode_as().map_err(parse_error)?;
                        keys.push(decrypt(
                            &key.encryption_algorithm,
                            password,
                            key.encrypted_data.as_bytes(),
                        )?);
                    }
                    id if id == KEY_BAG => keys.push(bag.bag_value.to_der().map_err(parse_error)?),
                    _ => {}
                }
            }
        }

        match (certificates.as_slice(), keys.as_slice()) {
            ([certificate], [key]) => Ok(HolderCredentials::from_der(certificate, key)?),
            _ => Err(Pkcs12Error::UnexpectedContents {
                certificates: certificates.len(),
                keys: keys.len(),
            }),
        }
    }
}

#[derive(Clone, Debug, Sequence)]
struct Pfx {
    version: u8,
    auth_safe: ContentInfo,
    #[asn1(optional = "true")]
    mac_data: Option<MacData>,
}

#[derive(Clone, Debug, Sequence)]
struct ContentInfo {
    content_type: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    content: Any,
}

impl ContentInfo {
    /// Plaintext SafeContents, decrypting them when needed.
    fn safe_contents(&self, password: &str) -> Result<Vec<u8>, Pkcs12Error> {
        match self.content_type {
            id if id == ID_DATA => Ok(self
                .content
                .decode_as::<OctetString>()
                .map_err(parse_error)?
                .into_bytes()),
            id if id == ID_ENCRYPTED_DATA => {
                let data: EncryptedData = self.content.decode_as().map_err(parse_error)?;
                let info = data.encrypted_content_info;
                let ciphertext = info
                    .encrypted_content
                    .ok_or_else(|| Pkcs12Error::Parse("encrypted content is detached".into()))?;
                decrypt(
                    &info.content_encryption_algorithm,
                    password,
                    ciphertext.as_bytes(),
                )
            }
            other => Err(Pkcs12Error::UnsupportedAlgorithm(other)),
        }
    }
}

fn data_content(bytes: Vec<u8>) -> Result<ContentInfo, Pkcs12Error> {
    Ok(ContentInfo {
        content_type: ID_DATA,
        content: Any::encode_from(&OctetString::new(bytes).map_err(encode_error)?)
            .map_err(encode_error)?,
    })
}

#[derive(Clone, Debug, Sequence)]
struct EncryptedData {
    version: u8,
    encrypted_content_info: EncryptedContentInfo,
}

#[derive(Clone, Debug, Sequence)]
struct EncryptedContentInfo {
    content_type: ObjectIdentifier,
    content_encryption_algorithm: AlgorithmIdentifierOwned,
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT", optional = "true")]
    encrypted_content: Option<OctetString>,
}

#[derive(Clone, Debug, Sequence)]
struct SafeBag {
    bag_id: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    bag_value: Any,
    #[asn1(optional = "true")]
    bag_attributes: Option<SetOfVec<Attribute>>,
}

#[derive(Clone, Debug, Sequence)]
struct CertBag {
    cert_id: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    cert_value: OctetString,
}

/// EncryptedPrivateKeyInfo with an arbitrary algorithm identifier.
#[derive(Clone, Debug, Sequence)]
struct ShroudedKey {
    encryption_algorithm: AlgorithmIdentifierOwned,
    encrypted_data: OctetString,
}

#[derive(Clone, Debug, Sequence)]
struct PbeParams {
    salt: OctetString,
    iterations: u32,
}

#[derive(Clone, Debug, Sequence)]
struct DigestInfo {
    algorithm: AlgorithmIdentifierOwned,
    digest: OctetString,
}

#[derive(Clone, Debug, Sequence)]
struct MacData {
    mac: DigestInfo,
    mac_salt: OctetString,
    #[asn1(default = "one")]
    iterations: u32,
}

fn one() -> u32 {
    1
}

impl MacData {
    fn seal(encoding: Pkcs12Encoding, password: &str, data: &[u8]) -> Result<Self, Pkcs12Error> {
        let salt = random_bytes::<PBE_SALT_LEN>();
        let algorithm = match encoding {
            Pkcs12Encoding::Legacy => SHA1,
            Pkcs12Encoding::Modern => SHA256,
        };
        let password = bmp_password(password).map_err(encode_error)?;
        let digest = mac_digest(algorithm, &password, &salt, ITERATIONS, data)?;
        Ok(MacData {
            mac: DigestInfo {
                algorithm: AlgorithmIdentifierOwned {
                    oid: algorithm,
                    parameters: Some(Any::null()),
                },
                digest: OctetString::new(digest).map_err(encode_error)?,
            },
            mac_salt: OctetString::new(salt.to_vec()).map_err(encode_error)?,
            iterations: ITERATIONS,
        })
    }

    fn verify(&self, password: &str, data: &[u8]) -> Result<(), Pkcs12Error> {
        let password = bmp_password(password).map_err(parse_error)?;
        let expected = mac_digest(
            self.mac.algorithm.oid,
            &password,
            self.mac_salt.as_bytes(),
            self.iterations,
            data,
        )?;
        if expected != self.mac.digest.as_bytes() {
            return Err(Pkcs12Error::BadPassword);
        }
        Ok(())
    }
}

/// HMAC keyed through the PKCS#12 KDF with the digest named by `algorithm`.
fn mac_digest(
    algorithm: ObjectIdentifier,
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    data: &[u8],
) -> Result<Vec<u8>, Pkcs12Error> {
    let digest = match algorithm {
        oid if oid == SHA1 => {
            let key = derive_key::<Sha1>(password, salt, KDF_MAC, iterations, 20);
            let mut mac = Hmac::<Sha1>::new_from_slice(&key).map_err(encode_error)?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        oid if oid == SHA256 => {
            let key = derive_key::<Sha256>(password, salt, KDF_MAC, iterations, 32);
            let mut mac = Hmac::<Sha256>::new_from_slice(&key).map_err(encode_error)?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        other => return Err(Pkcs12Error::UnsupportedAlgorithm(other)),
    };
    Ok(digest)
}

fn bag_attributes(friendly_name: &str, local_key_id: &[u8]) -> Result<SetOfVec<Attribute>, Pkcs12Error> {
    let attribute = |oid, value: Any| -> Result<Attribute, Pkcs12Error> {
        let mut values = SetOfVec::new();
        values.insert(value).map_err(encode_error)?;
        Ok(Attribute { oid, values })
    };
    let name = BmpString::from_utf8(friendly_name).map_err(encode_error)?;
    let key_id = OctetString::new(local_key_id).map_err(encode_error)?;

    let mut attributes = SetOfVec::new();
    attributes
        .insert(attribute(FRIENDLY_NAME, Any::encode_from(&name).map_err(encode_error)?)?)
        .map_err(encode_error)?;
    attributes
        .insert(attribute(LOCAL_KEY_ID, Any::encode_from(&key_id).map_err(encode_error)?)?)
        .map_err(encode_error)?;
    Ok(attributes)
}

fn encrypt(
    encoding: Pkcs12Encoding,
    password: &str,
    plaintext: &[u8],
) -> Result<(AlgorithmIdentifierOwned, Vec<u8>), Pkcs12Error> {
    match encoding {
        Pkcs12Encoding::Legacy => {
            let salt = random_bytes::<PBE_SALT_LEN>();
            let (key, iv) = tdes_key_iv(password, &salt, ITERATIONS)?;
            let ciphertext = cbc::Encryptor::<TdesEde3>::new_from_slices(&key, &iv)
                .map_err(encode_error)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
            let params = PbeParams {
                salt: OctetString::new(salt.to_vec()).map_err(encode_error)?,
                iterations: ITERATIONS,
            };
            let algorithm = AlgorithmIdentifierOwned {
                oid: PBE_SHA1_3DES,
                parameters: Some(Any::encode_from(&params).map_err(encode_error)?),
            };
            Ok((algorithm, ciphertext))
        }
        Pkcs12Encoding::Modern => {
            let salt = random_bytes::<PBES2_SALT_LEN>();
            let iv = random_bytes::<16>();
            let scheme: EncryptionScheme<'_> =
                pbes2::Parameters::pbkdf2_sha256_aes256cbc(ITERATIONS, &salt, &iv)
                    .map_err(encode_error)?
                    .into();
            let ciphertext = scheme
                .encrypt(password.as_bytes(), plaintext)
                .map_err(encode_error)?;
            let algorithm = AlgorithmIdentifierOwned::from_der(&scheme.to_der().map_err(encode_error)?)
                .map_err(encode_error)?;
            Ok((algorithm, ciphertext))
        }
    }
}

fn decrypt(
    algorithm: &AlgorithmIdentifierOwned,
    password: &str,
    ciphertext: &[u8],
) -> Result<Vec<u8>, Pkcs12Error> {
    match algorithm.oid {
        oid if oid == PBE_SHA1_3DES => {
            let params: PbeParams = algorithm
                .parameters
                .as_ref()
                .ok_or_else(|| Pkcs12Error::Parse("3DES parameters missing".into()))?
                .decode_as()
                .map_err(parse_error)?;
            let (key, iv) = tdes_key_iv(password, params.salt.as_bytes(), params.iterations)?;
            cbc::Decryptor::<TdesEde3>::new_from_slices(&key, &iv)
                .map_err(parse_error)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| Pkcs12Error::BadPassword)
        }
        oid if oid == PBES2 => {
            let der = algorithm.to_der().map_err(parse_error)?;
            let scheme = EncryptionScheme::from_der(&der).map_err(parse_error)?;
            scheme
                .decrypt(password.as_bytes(), ciphertext)
                .map_err(|_| Pkcs12Error::BadPassword)
        }
        other => Err(Pkcs12Error::UnsupportedAlgorithm(other)),
    }
}

fn tdes_key_iv(password: &str, salt: &[u8], iterations: u32) -> Result<(Vec<u8>, Vec<u8>), Pkcs12Error> {
    let password = bmp_password(password).map_err(encode_error)?;
    Ok((
        derive_key::<Sha1>(&password, salt, KDF_KEY, iterations, 24),
        derive_key::<Sha1>(&password, salt, KDF_IV, iterations, 8),
    ))
}

/// UTF-16BE with the two-byte terminator the PKCS#12 KDF expects.
fn bmp_password(password: &str) -> der::Result<Vec<u8>> {
    let mut bytes = BmpString::from_utf8(password)?.as_bytes().to_vec();
    bytes.extend_from_slice(&[0, 0]);
    Ok(bytes)
}

/// Key derivation of RFC 7292 appendix B.2. `D` must have a 64-byte block,
/// which holds for SHA-1 and SHA-256.
fn derive_key<D: Digest>(password: &[u8], salt: &[u8], purpose: u8, iterations: u32, len: usize) -> Vec<u8> {
    const V: usize = 64;
    let stretch = |src: &[u8]| -> Vec<u8> {
        let n = V * src.len().div_ceil(V);
        src.iter().cycle().take(n).copied().collect()
    };
    let mut input = stretch(salt);
    input.extend(stretch(password));
    let diversifier = [purpose; V];

    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        let mut block = D::new()
            .chain_update(diversifier)
            .chain_update(&input)
            .finalize();
        for _ in 1..iterations {
            block = D::digest(&block);
        }
        let b: Vec<u8> = block.iter().cycle().take(V).copied().collect();
        for chunk in input.chunks_mut(V) {
            let mut carry = 1u16;
            for (x, y) in chunk.iter_mut().zip(&b).rev() {
                let sum = u16::from(*x) + u16::from(*y) + carry;
                *x = sum as u8;
                carry = sum >> 8;
            }
        }
        out.extend_from_slice(&block);
    }
    out.truncate(len);
    out
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_matches_published_vector() {
        // "smeg" with salt 0A58CF64530D823F and one iteration, SHA-1.
        let password = bmp_password("smeg").unwrap();
        let salt = [0x0A, 0x58, 0xCF, 0x64, 0x53, 0x0D, 0x82, 0x3F];
        let key = derive_key::<Sha1>(&password, &salt, KDF_KEY, 1, 24);
        assert_eq!(
            key,
            [
                0x8A, 0xAA, 0xE6, 0x29, 0x7B, 0x6C, 0xB0, 0x46, 0x42, 0xAB, 0x5B, 0x07, 0x78,
                0x51, 0x28, 0x4E, 0xB7, 0x12, 0x8F, 0x1A, 0x2A, 0x7F, 0xBC, 0xA3
            ]
        );
        let iv = derive_key::<Sha1>(&password, &salt, KDF_IV, 1, 8);
        assert_eq!(iv, [0x79, 0x99, 0x3D, 0xFE, 0x04, 0x8D, 0x3B, 0x76]);
    }

    #[test]
    fn bmp_password_is_null_terminated() {
        assert_eq!(bmp_password("ab").unwrap(), [0, b'a', 0, b'b', 0, 0]);
        assert_eq!(bmp_password("").unwrap(), [0, 0]);
    }

    #[test]
    fn mac_iterations_default_to_one() {
        let mac = MacData {
            mac: DigestInfo {
                algorithm: AlgorithmIdentifierOwned {
                    oid: SHA1,
                    parameters: Some(Any::null()),
                },
                digest: OctetString::new(vec![0u8; 20]).unwrap(),
            },
            mac_salt: OctetString::new(vec![1u8; 8]).unwrap(),
            iterations: 1,
        };
        let der = mac.to_der().unwrap();
        assert_eq!(MacData::from_der(&der).unwrap().iterations, 1);
    }
}
