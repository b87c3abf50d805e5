//! Certificate store entry equivalence.
//!
//! Both PEM and DER encodings are accepted. Canonical fields are parsed with
//! `x509-parser` and compared in readable form, and the raw DER body is
//! compared byte for byte; raw body equality is definitive.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use fwdelta_core::FwdeltaError;
use sha2::{Digest, Sha256};
use similar::TextDiff;
use x509_parser::objects::{oid2sn, oid_registry};
use x509_parser::parse_x509_certificate;

use crate::digest::{AnalysisDigest, CertificateDigest};
use crate::dispatch::{AnalysisContext, AnalysisOutcome, Analyzer, ArtifactPair};

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Return the DER body of a certificate file in either encoding.
///
/// Content holding a PEM block is decoded from its first block; anything
/// else is taken as DER.
///
/// # Errors
///
/// Returns [`FwdeltaError::Format`] for a truncated PEM block or invalid
/// base64.
///
/// # Examples
///
/// ```
/// use fwdelta_analyzers::cert::der_body;
///
/// let pem = b"-----BEGIN CERTIFICATE-----\nMAMCAQE=\n-----END CERTIFICATE-----\n";
/// assert_eq!(der_body(pem).unwrap(), vec![0x30, 0x03, 0x02, 0x01, 0x01]);
/// assert_eq!(der_body(&[0x30, 0x00]).unwrap(), vec![0x30, 0x00]);
/// ```
pub fn der_body(data: &[u8]) -> Result<Vec<u8>, FwdeltaError> {
    let text = String::from_utf8_lossy(data);
    let Some(start) = text.find(PEM_BEGIN) else {
        return Ok(data.to_vec());
    };
    let body = &text[start + PEM_BEGIN.len()..];
    let end = body
        .find(PEM_END)
        .ok_or_else(|| FwdeltaError::Format("unterminated PEM certificate block".into()))?;
    let encoded: String = body[..end].chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(encoded)
        .map_err(|e| FwdeltaError::Format(format!("invalid PEM body: {e}")))
}

/// Canonical certificate fields in readable form.
///
/// Names are rendered as RFC 4514 strings, the serial as `0x` hex, validity
/// bounds as RFC 3339 UTC timestamps and the signature as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFields {
    /// `tbsCertificate.subject`.
    pub subject: String,
    /// `tbsCertificate.issuer`.
    pub issuer: String,
    /// `tbsCertificate.serialNumber`.
    pub serial_number: String,
    /// `tbsCertificate.validity.notBefore`.
    pub not_valid_before: String,
    /// `tbsCertificate.validity.notAfter`.
    pub not_valid_after: String,
    /// Outer `signatureAlgorithm`, by short name when known.
    pub signature_algorithm: String,
    /// Outer `signatureValue`.
    pub signature: String,
}

impl CertificateFields {
    /// Parse the fields of a DER encoded X.509 certificate.
    ///
    /// # Errors
    ///
    /// Returns [`FwdeltaError::Format`] if the DER structure is not a
    /// certificate.
    pub fn parse(der: &[u8]) -> Result<Self, FwdeltaError> {
        let (_, cert) = parse_x509_certificate(der)
            .map_err(|e| FwdeltaError::Format(format!("invalid certificate: {e}")))?;

        let algorithm = &cert.signature_algorithm.algorithm;
        let signature_algorithm = oid2sn(algorithm, oid_registry())
            .map(str::to_string)
            .unwrap_or_else(|_| algorithm.to_id_string());

        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial_number: serial_hex(cert.raw_serial()),
            not_valid_before: timestamp(cert.validity().not_before.timestamp()),
            not_valid_after: timestamp(cert.validity().not_after.timestamp()),
            signature_algorithm,
            signature: hex::encode(&cert.signature_value.data),
        })
    }

    fn named(&self) -> [(&'static str, &str); 7] {
        [
            ("subject", self.subject.as_str()),
            ("issuer", self.issuer.as_str()),
            ("serial_number", self.serial_number.as_str()),
            ("not_valid_before", self.not_valid_before.as_str()),
            ("not_valid_after", self.not_valid_after.as_str()),
            ("signature_algorithm", self.signature_algorithm.as_str()),
            ("signature", self.signature.as_str()),
        ]
    }

    /// Names of the fields that differ from `other`.
    pub fn differing(&self, other: &Self) -> Vec<String> {
        self.named()
            .iter()
            .zip(other.named().iter())
            .filter(|((_, a), (_, b))| a != b)
            .map(|((name, _), _)| name.to_string())
            .collect()
    }

    fn render(&self) -> String {
        self.named()
            .iter()
            .map(|(name, value)| format!("{name}: {value}\n"))
            .collect()
    }
}

/// Serial number bytes as `0x` hex without leading zeros.
fn serial_hex(raw: &[u8]) -> String {
    let digits = hex::encode(raw);
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0x0".to_string()
    } else {
        format!("0x{trimmed}")
    }
}

fn timestamp(seconds: i64) -> String {
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| seconds.to_string())
}

/// SHA-256 fingerprint of a DER body, lowercase hex.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Compare two certificate encodings.
///
/// `text_diff` attaches a unified diff of the canonical fields when they
/// differ.
pub fn compare_certificates(
    old: &[u8],
    new: &[u8],
    text_diff: bool,
) -> Result<CertificateDigest, FwdeltaError> {
    let old_der = der_body(old)?;
    let new_der = der_body(new)?;
    let old_fields = CertificateFields::parse(&old_der)?;
    let new_fields = CertificateFields::parse(&new_der)?;

    let differing_fields = old_fields.differing(&new_fields);
    let differs = !differing_fields.is_empty() || old_der != new_der;

    let diff = (differs && text_diff).then(|| {
        let old_text = old_fields.render();
        let new_text = new_fields.render();
        TextDiff::from_lines(&old_text, &new_text)
            .unified_diff()
            .header("old", "new")
            .to_string()
    });

    Ok(CertificateDigest {
        differs,
        differing_fields,
        old_sha256: fingerprint(&old_der),
        new_sha256: fingerprint(&new_der),
        diff,
    })
}

/// Compares certificate store entries.
#[derive(Debug, Clone, Default)]
pub struct CertificateAnalyzer {
    text_diff: bool,
}

impl CertificateAnalyzer {
    /// Create an analyzer; `text_diff` requests a textual diff for mismatches.
    pub fn new(text_diff: bool) -> Self {
        Self { text_diff }
    }

    /// Compare two certificate files.
    pub fn compare_files(&self, old: &Path, new: &Path) -> Result<CertificateDigest, FwdeltaError> {
        compare_certificates(&std::fs::read(old)?, &std::fs::read(new)?, self.text_diff)
    }
}

impl Analyzer for CertificateAnalyzer {
    fn name(&self) -> &'static str {
        "certificate"
    }

    fn analyze(&self, pair: &ArtifactPair, _ctx: &AnalysisContext) -> Result<AnalysisOutcome, FwdeltaError> {
        let digest = self.compare_files(&pair.old, &pair.new)?;
        let summary = if digest.differs {
            if digest.differing_fields.is_empty() {
                "certificate differs (raw body only)".to_string()
            } else {
                format!("certificate differs: {}", digest.differing_fields.join(", "))
            }
        } else {
            "certificate equivalent".to_string()
        };
        Ok(AnalysisOutcome {
            digest: AnalysisDigest::Certificate(digest),
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        if content.len() < 0x80 {
            out.push(content.len() as u8);
        } else if content.len() < 0x100 {
            out.push(0x81);
            out.push(content.len() as u8);
        } else {
            out.push(0x82);
            out.extend_from_slice(&(content.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(content);
        out
    }

    fn name(cn: &str) -> Vec<u8> {
        // SEQUENCE { SET { SEQUENCE { OID 2.5.4.3, UTF8String cn } } }
        let mut atv = tlv(0x06, &[0x55, 0x04, 0x03]);
        atv.extend(tlv(0x0c, cn.as_bytes()));
        tlv(0x30, &tlv(0x31, &tlv(0x30, &atv)))
    }

    fn public_key() -> Vec<u8> {
        // SEQUENCE { SEQUENCE { OID ecPublicKey, OID prime256v1 }, BIT STRING }
        let mut alg = tlv(0x06, &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01]);
        alg.extend(tlv(0x06, &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07]));
        let mut key = vec![0x00, 0x04];
        key.extend_from_slice(&[0x11; 64]);
        let mut spki = tlv(0x30, &alg);
        spki.extend(tlv(0x03, &key));
        tlv(0x30, &spki)
    }

    fn certificate(serial: u8, subject: &str, signature: &[u8]) -> Vec<u8> {
        let alg = tlv(0x30, &tlv(0x06, &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b]));
        let mut validity = tlv(0x17, b"200101000000Z");
        validity.extend(tlv(0x17, b"300101000000Z"));

        let mut tbs = tlv(0xa0, &tlv(0x02, &[0x02]));
        tbs.extend(tlv(0x02, &[serial]));
        tbs.extend(alg.clone());
        tbs.extend(name("Test Root CA"));
        tbs.extend(tlv(0x30, &validity));
        tbs.extend(name(subject));
        tbs.extend(public_key());

        let mut sig = vec![0x00];
        sig.extend_from_slice(signature);

        let mut cert = tlv(0x30, &tbs);
        cert.extend(alg);
        cert.extend(tlv(0x03, &sig));
        tlv(0x30, &cert)
    }

    fn pem(der: &[u8]) -> Vec<u8> {
        format!("{PEM_BEGIN}\n{}\n{PEM_END}\n", STANDARD.encode(der)).into_bytes()
    }

    #[test]
    fn parses_fields() {
        let der = certificate(7, "leaf", b"sig");
        let fields = CertificateFields::parse(&der).unwrap();
        assert_eq!(fields.subject, "CN=leaf");
        assert_eq!(fields.issuer, "CN=Test Root CA");
        assert_eq!(fields.serial_number, "0x7");
        assert_eq!(fields.not_valid_before, "2020-01-01T00:00:00+00:00");
        assert_eq!(fields.not_valid_after, "2030-01-01T00:00:00+00:00");
        assert_eq!(fields.signature, "736967");
    }

    #[test]
    fn serial_hex_drops_leading_zeros() {
        assert_eq!(serial_hex(&[0x00, 0x8f, 0x01]), "0x8f01");
        assert_eq!(serial_hex(&[0x00]), "0x0");
    }

    #[test]
    fn pem_and_der_of_same_cert_are_equivalent() {
        let der = certificate(1, "same", b"abc");
        let digest = compare_certificates(&pem(&der), &der, true).unwrap();
        assert!(!digest.differs);
        assert!(digest.diff.is_none());
        assert_eq!(digest.old_sha256, digest.new_sha256);
        assert_eq!(digest.old_sha256.len(), 64);
    }

    #[test]
    fn field_change_is_reported() {
        let old = certificate(1, "old-subject", b"abc");
        let new = certificate(2, "new-subject", b"abc");
        let digest = compare_certificates(&old, &new, false).unwrap();
        assert!(digest.differs);
        assert_eq!(digest.differing_fields, vec!["subject", "serial_number"]);
        assert!(digest.diff.is_none());
    }

    #[test]
    fn text_diff_only_when_requested() {
        let old = certificate(1, "x", b"one");
        let new = certificate(1, "x", b"two");
        let digest = compare_certificates(&old, &new, true).unwrap();
        assert_eq!(digest.differing_fields, vec!["signature"]);
        let diff = digest.diff.unwrap();
        assert!(diff.contains("-signature: 6f6e65"));
        assert!(diff.contains("+signature: 74776f"));
        assert!(diff.contains(" subject: CN=x"));
    }

    #[test]
    fn pem_text_trailer_is_ignored() {
        let der = certificate(3, "trailer", b"s");
        let mut with_text = pem(&der);
        with_text.extend_from_slice(b"Certificate:\n    Data:\n        Version: 3 (0x2)\n");
        let digest = compare_certificates(&with_text, &pem(&der), false).unwrap();
        assert!(!digest.differs);
    }

    #[test]
    fn malformed_input_is_format_error() {
        assert!(matches!(
            compare_certificates(b"\x30\x05\x02", b"\x30\x00", false),
            Err(FwdeltaError::Format(_))
        ));
        assert!(der_body(format!("{PEM_BEGIN}\nAAAA").as_bytes()).is_err());
        assert!(der_body(format!("{PEM_BEGIN}\n!!!!\n{PEM_END}").as_bytes()).is_err());
    }

    #[test]
    fn long_form_lengths() {
        let der = certificate(9, &"n".repeat(300), b"sig");
        let fields = CertificateFields::parse(&der).unwrap();
        assert_eq!(fields.subject.len(), "CN=".len() + 300);
    }
}
