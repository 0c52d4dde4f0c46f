//! Certificate identity facets.
//!
//! A directory certificate is looked up by one of four facets: issuer DN
//! plus serial, subject key identifier, SHA-1 thumbprint, or subject DN.
//! DNs are rendered RFC 2253 style (most specific RDN first) and then
//! canonicalised, so they compare equal to DNs typed by an operator.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use ldap3::dn_escape;
use serde::Serialize;
use sha1::{Digest, Sha1};
use x509_parser::extensions::ParsedExtension;
use x509_parser::objects::{oid_registry, oid2abbrev};
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};

use crate::{Error, Result, dn};

/// Lookup facets derived from one certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertFacets {
    /// Base64 SHA-1 of the DER encoding
    pub thumbprint_sha1: String,
    /// Base64 subject key identifier, when the extension is present
    pub ski: Option<String>,
    /// Canonical issuer DN
    pub issuer_dn: String,
    /// Serial number in decimal
    pub serial: String,
    /// Canonical subject DN
    pub subject_dn: String,
    /// Subject DN as rendered from the certificate, for display
    pub subject_display: String,
}

/// A parsed certificate: its DER bytes and facets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCertificate {
    der: Vec<u8>,
    facets: CertFacets,
}

impl DecodedCertificate {
    /// Decode DER, PEM, or base64-wrapped DER.
    ///
    /// # Errors
    ///
    /// [`Error::Certificate`] when none of the encodings parse.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.first() == Some(&0x30) {
            return Self::from_der(bytes);
        }
        if bytes.starts_with(b"-----BEGIN") {
            let (_, pem) = x509_parser::pem::parse_x509_pem(bytes)
                .map_err(|e| Error::Certificate(format!("bad PEM: {e}")))?;
            return Self::from_der(&pem.contents);
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::Certificate("not DER, PEM or base64".to_string()))?;
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let der = STANDARD
            .decode(compact)
            .map_err(|e| Error::Certificate(format!("bad base64: {e}")))?;
        Self::from_der(&der)
    }

    /// Parse a DER certificate.
    ///
    /// # Errors
    ///
    /// [`Error::Certificate`] on malformed input.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Certificate(format!("bad DER: {e}")))?;
        let subject_display = rfc2253(cert.subject());
        let facets = CertFacets {
            thumbprint_sha1: thumbprint_sha1(der),
            ski: subject_key_identifier(&cert),
            issuer_dn: dn::canonicalize(&rfc2253(cert.issuer())),
            serial: cert.tbs_certificate.serial.to_string(),
            subject_dn: dn::canonicalize(&subject_display),
            subject_display,
        };
        Ok(Self {
            der: der.to_vec(),
            facets,
        })
    }

    /// DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Lookup facets.
    pub fn facets(&self) -> &CertFacets {
        &self.facets
    }

    /// Base64 SHA-1 thumbprint.
    pub fn thumbprint(&self) -> &str {
        &self.facets.thumbprint_sha1
    }
}

/// Base64 SHA-1 of `der`.
#[must_use]
pub fn thumbprint_sha1(der: &[u8]) -> String {
    STANDARD.encode(Sha1::digest(der))
}

fn subject_key_identifier(cert: &X509Certificate<'_>) -> Option<String> {
    cert.extensions()
        .iter()
        .find_map(|ext| match ext.parsed_extension() {
            ParsedExtension::SubjectKeyIdentifier(id) => Some(STANDARD.encode(id.0)),
            _ => None,
        })
}

/// Render a name most-specific RDN first, `TYPE=value` with RFC 2253 escaping.
fn rfc2253(name: &X509Name<'_>) -> String {
    let registry = oid_registry();
    let mut rdns: Vec<String> = name
        .iter_rdn()
        .map(|rdn| {
            rdn.iter()
                .map(|attr| {
                    let ty = oid2abbrev(attr.attr_type(), registry)
                        .map_or_else(|_| attr.attr_type().to_id_string(), str::to_string);
                    let value = match attr.as_str() {
                        Ok(s) => dn_escape(s).into_owned(),
                        Err(_) => format!("#{}", hex::encode(attr.attr_value().as_bytes())),
                    };
                    format!("{ty}={value}")
                })
                .collect::<Vec<_>>()
                .join("+")
        })
        .collect();
    rdns.reverse();
    rdns.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyIdMethod,
        KeyPair, SerialNumber,
    };

    fn ca_cert(cn: &str, serial: u8, ski: &[u8]) -> Vec<u8> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "Example Corp");
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.serial_number = Some(SerialNumber::from_slice(&[serial]));
        params.key_identifier_method = KeyIdMethod::PreSpecified(ski.to_vec());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn facets_of_a_self_signed_ca() {
        let der = ca_cert("CA", 5, &[0xab, 0xcd]);
        let cert = DecodedCertificate::from_der(&der).unwrap();
        let facets = cert.facets();
        assert_eq!(facets.serial, "5");
        assert_eq!(facets.issuer_dn, "cn=ca,o=example corp");
        assert_eq!(facets.subject_dn, facets.issuer_dn);
        assert_eq!(facets.subject_display, "CN=CA,O=Example Corp");
        assert_eq!(facets.ski.as_deref(), Some("q80="));
        assert_eq!(facets.thumbprint_sha1, thumbprint_sha1(&der));
        assert_eq!(cert.der(), der.as_slice());
    }

    #[test]
    fn thumbprint_is_base64_sha1() {
        // SHA-1("abc") = a9993e36...
        assert_eq!(thumbprint_sha1(b"abc"), "qZk+NkcGgWq6PiVxeFDCbJzQ2J0=");
    }

    #[test]
    fn decode_accepts_pem_and_base64() {
        let der = ca_cert("PEM", 9, &[1, 2, 3]);
        let b64 = STANDARD.encode(&der);
        let pem = format!("-----BEGIN CERTIFICATE-----\n{b64}\n-----END CERTIFICATE-----\n");

        let from_pem = DecodedCertificate::decode(pem.as_bytes()).unwrap();
        let from_b64 = DecodedCertificate::decode(b64.as_bytes()).unwrap();
        let from_der = DecodedCertificate::decode(&der).unwrap();
        assert_eq!(from_pem, from_der);
        assert_eq!(from_b64, from_der);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            DecodedCertificate::decode(&[0x30, 0x03, 0x01]),
            Err(Error::Certificate(_))
        ));
        assert!(matches!(
            DecodedCertificate::decode(b"%%% not a cert"),
            Err(Error::Certificate(_))
        ));
    }
}
