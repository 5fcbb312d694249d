//! Leaf-certificate minting for intercepted hosts.
//!
//! The proxy presents a dynamically minted certificate for every hostname it
//! intercepts. Certificates are signed by a root CA that the client must
//! trust; the root is either loaded from PEM files or generated in memory.
//! For multi-label hostnames the minted leaf also covers the `*.<suffix>`
//! wildcard, which is what lets the server pool share one listener across a
//! whole suffix class.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rand::RngCore;
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
	Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

const CA_COMMON_NAME: &str = "mitmgateway root";
const CA_ORGANIZATION: &str = "mitmgateway";
const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
const LEAF_VALIDITY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(thiserror::Error, Debug)]
pub enum CaError {
	#[error("certificate generation failed: {0}")]
	Rcgen(#[from] rcgen::Error),

	#[error("invalid hostname for certificate: {0}")]
	InvalidName(String),

	#[error("CA key could not be converted: {0}")]
	Key(String),
}

/// A minted key-and-chain pair for one hostname.
///
/// `wildcard` carries the `*.<suffix>` name also covered by the certificate,
/// when the CA decided to issue wildcard coverage. The server pool uses it to
/// key shared listeners.
pub struct MintedCert {
	pub chain: Vec<CertificateDer<'static>>,
	pub key: PrivateKeyDer<'static>,
	pub wildcard: Option<String>,
}

/// `mint(hostname)` yields a key and certificate chain whose presented
/// identity matches `hostname`.
pub trait CertificateAuthority: Send + Sync + 'static {
	fn mint(&self, hostname: &str) -> Result<Arc<MintedCert>, CaError>;
}

/// rcgen-backed authority with an in-memory cache keyed by certificate
/// coverage (the wildcard name when present, the exact name otherwise).
pub struct RcgenAuthority {
	ca_key: KeyPair,
	ca_params: CertificateParams,
	ca_cert_der: CertificateDer<'static>,
	ca_cert_pem: String,
	cache: Mutex<HashMap<String, Arc<MintedCert>>>,
}

fn ca_params() -> CertificateParams {
	let mut params = CertificateParams::default();
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, CA_COMMON_NAME);
	dn.push(DnType::OrganizationName, CA_ORGANIZATION);
	params.distinguished_name = dn;
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	params.key_usages = vec![
		KeyUsagePurpose::KeyCertSign,
		KeyUsagePurpose::CrlSign,
		KeyUsagePurpose::DigitalSignature,
	];
	params.not_before = SystemTime::now().into();
	params.not_after = (SystemTime::now() + CA_VALIDITY).into();
	params
}

fn random_serial() -> SerialNumber {
	// 159 bits so the leading bit is always clear
	let mut data = [0u8; 20];
	rand::rng().fill_bytes(&mut data);
	data[0] &= 0x7f;
	SerialNumber::from_slice(&data)
}

impl RcgenAuthority {
	/// Generate a fresh in-memory root. Clients must be told to trust
	/// [`Self::root_cert_pem`].
	pub fn generate() -> Result<Self, CaError> {
		let ca_key = KeyPair::generate()?;
		Self::from_key(ca_key)
	}

	/// Rebuild the authority from a previously generated root key. The root
	/// certificate is re-derived from the key with the fixed distinguished
	/// name, so leaves verify against the certificate that was handed out
	/// when the key was first generated.
	pub fn from_key_pem(key_pem: &str) -> Result<Self, CaError> {
		let ca_key = KeyPair::from_pem(key_pem)?;
		Self::from_key(ca_key)
	}

	fn from_key(ca_key: KeyPair) -> Result<Self, CaError> {
		let params = ca_params();
		let cert = params.self_signed(&ca_key)?;
		let ca_cert_der = cert.der().clone().into_owned();
		let ca_cert_pem = cert.pem();
		Ok(Self {
			ca_key,
			ca_params: params,
			ca_cert_der,
			ca_cert_pem,
			cache: Mutex::new(HashMap::new()),
		})
	}

	pub fn root_cert_pem(&self) -> &str {
		&self.ca_cert_pem
	}

	pub fn root_cert_der(&self) -> CertificateDer<'static> {
		self.ca_cert_der.clone()
	}

	pub fn root_key_pem(&self) -> String {
		self.ca_key.serialize_pem()
	}

	/// The names a leaf for `hostname` will cover. Multi-label DNS names get
	/// wildcard coverage for their suffix class; IPs and single-label names
	/// are covered exactly.
	fn coverage(hostname: &str) -> (Vec<String>, Option<String>) {
		if hostname.parse::<IpAddr>().is_ok() {
			return (vec![hostname.to_string()], None);
		}
		match hostname.split_once('.') {
			// Only issue a wildcard when the suffix itself has two or more
			// labels; "*.com" style certificates are never minted.
			Some((_, suffix)) if suffix.contains('.') => {
				let wildcard = format!("*.{suffix}");
				(vec![hostname.to_string(), wildcard.clone()], Some(wildcard))
			},
			_ => (vec![hostname.to_string()], None),
		}
	}

	fn mint_uncached(&self, hostname: &str, names: &[String]) -> Result<MintedCert, CaError> {
		let mut params = CertificateParams::default();
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, hostname);
		params.distinguished_name = dn;
		params.serial_number = Some(random_serial());
		params.not_before = SystemTime::now().into();
		params.not_after = (SystemTime::now() + LEAF_VALIDITY).into();
		params.key_usages = vec![
			KeyUsagePurpose::DigitalSignature,
			KeyUsagePurpose::KeyEncipherment,
		];
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

		let mut wildcard = None;
		for name in names {
			let san = if let Ok(ip) = name.parse::<IpAddr>() {
				SanType::IpAddress(ip)
			} else {
				if name.starts_with("*.") {
					wildcard = Some(name.clone());
				}
				SanType::DnsName(
					name
						.clone()
						.try_into()
						.map_err(|_| CaError::InvalidName(name.clone()))?,
				)
			};
			params.subject_alt_names.push(san);
		}

		let leaf_key = KeyPair::generate()?;
		let issuer = Issuer::from_params(&self.ca_params, &self.ca_key);
		let cert = params.signed_by(&leaf_key, &issuer)?;

		let key = PrivateKeyDer::try_from(leaf_key.serialize_der())
			.map_err(|e| CaError::Key(e.to_string()))?;
		Ok(MintedCert {
			chain: vec![cert.der().clone().into_owned(), self.ca_cert_der.clone()],
			key,
			wildcard,
		})
	}
}

impl CertificateAuthority for RcgenAuthority {
	fn mint(&self, hostname: &str) -> Result<Arc<MintedCert>, CaError> {
		let (names, wildcard) = Self::coverage(hostname);
		let cache_key = wildcard.as_deref().unwrap_or(hostname).to_string();
		if let Some(hit) = self.cache.lock().get(&cache_key) {
			return Ok(hit.clone());
		}
		let minted = Arc::new(self.mint_uncached(hostname, &names)?);
		self
			.cache
			.lock()
			.insert(cache_key, minted.clone());
		Ok(minted)
	}
}
