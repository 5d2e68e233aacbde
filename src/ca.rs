// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Root certificate authority and per-host leaf issuance.
//!
//! Every intercepted host gets a standard ECDSA leaf (served through rustls)
//! and, when enabled, an SM2 leaf (served through openssl) for clients that
//! only speak national-cryptography suites. Both chain to the same root.

use anyhow::{Context, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{select_next_proto, AlpnError, SslAcceptor, SslMethod};
use openssl::x509::extension::{
    BasicConstraints as X509BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509NameBuilder, X509};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type as aws_any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer as PrivateKey};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const CA_COMMON_NAME: &str = "hfinger CA";
const CA_ORGANIZATION: &str = "hfinger";
const ROOT_VALIDITY_DAYS: i64 = 5 * 365;
const LEAF_VALIDITY_DAYS: i64 = 365;

#[derive(Debug)]
struct AlwaysResolves(Arc<CertifiedKey>);

impl ResolvesServerCert for AlwaysResolves {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Both leaves issued for one host.
pub struct LeafPair {
    pub standard: Arc<CertifiedKey>,
    pub national: Option<(X509, PKey<Private>)>,
}

/// Negotiable TLS server identity for one intercepted host.
pub struct HostIdentity {
    pub host: String,
    pub standard: Arc<rustls::ServerConfig>,
    pub national: Option<SslAcceptor>,
}

impl HostIdentity {
    pub fn standard_acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.standard.clone())
    }
}

type IdentityCell = Arc<OnceCell<Arc<HostIdentity>>>;

/// Manages the root CA and generates leaf certificates for intercepted hosts.
pub struct CertificateAuthority {
    ca_cert_pem: String,
    /// The CA private key used for signing standard leaves.
    ca_key_pair: KeyPair,
    /// The same key and certificate, as openssl objects, for SM2 leaves.
    ca_pkey: PKey<Private>,
    ca_x509: X509,
    national: bool,
    identities: Mutex<HashMap<String, IdentityCell>>,
}

fn clock_serial() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

fn ca_params() -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![]).context("failed to create CA params")?;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    params
        .distinguished_name
        .push(DnType::OrganizationName, CA_ORGANIZATION);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    Ok(params)
}

impl CertificateAuthority {
    /// Loads the root from the given paths, or generates and persists a new one.
    pub async fn load_or_generate(
        cert_path: &Path,
        key_path: &Path,
        national: bool,
    ) -> Result<Arc<Self>> {
        let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
            info!("Loading existing CA from {:?}", cert_path);
            let cert_pem = fs::read_to_string(cert_path)
                .await
                .context("failed to read CA cert")?;
            let key_pem = fs::read_to_string(key_path)
                .await
                .context("failed to read CA key")?;
            (cert_pem, key_pem)
        } else {
            info!("Generating new CA at {:?}", cert_path);
            Self::generate_and_save(cert_path, key_path).await?
        };
        Ok(Arc::new(Self::from_pem(&cert_pem, &key_pem, national)?))
    }

    fn from_pem(cert_pem: &str, key_pem: &str, national: bool) -> Result<Self> {
        let key_pair =
            KeyPair::from_pem(key_pem).context("failed to parse CA key pair from PEM")?;
        let ca_pkey = PKey::private_key_from_pem(key_pem.as_bytes())
            .context("failed to load CA key into openssl")?;
        let ca_x509 =
            X509::from_pem(cert_pem.as_bytes()).context("failed to load CA cert into openssl")?;
        Ok(Self {
            ca_cert_pem: cert_pem.to_string(),
            ca_key_pair: key_pair,
            ca_pkey,
            ca_x509,
            national,
            identities: Mutex::new(HashMap::new()),
        })
    }

    async fn generate_and_save(cert_path: &Path, key_path: &Path) -> Result<(String, String)> {
        let mut params = ca_params()?;
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + TimeDuration::days(ROOT_VALIDITY_DAYS);
        params.serial_number = Some(SerialNumber::from(clock_serial()));

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = params.self_signed(&key_pair)?;
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        for p in [cert_path, key_path] {
            if let Some(parent) = p.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).await?;
                }
            }
        }

        fs::write(cert_path, &cert_pem).await?;
        fs::write(key_path, &key_pem).await?;
        Ok((cert_pem, key_pem))
    }

    pub fn get_ca_cert_pem(&self) -> String {
        self.ca_cert_pem.clone()
    }

    /// Issue fresh standard and (if enabled) national leaves for `host`.
    pub fn issue_leaf(&self, host: &str) -> Result<LeafPair> {
        let standard = self.issue_standard(host)?;
        let national = if self.national {
            Some(self.issue_national(host)?)
        } else {
            None
        };
        Ok(LeafPair { standard, national })
    }

    fn issue_standard(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        let mut params = CertificateParams::new(vec![])?;
        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.try_into()?),
        }];
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);
        params
            .distinguished_name
            .push(DnType::OrganizationName, CA_ORGANIZATION);
        params.use_authority_key_identifier_extension = false;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + TimeDuration::days(LEAF_VALIDITY_DAYS);
        params.serial_number = Some(SerialNumber::from(clock_serial()));

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let issuer = Issuer::new(ca_params()?, &self.ca_key_pair);
        let cert = params.signed_by(&key_pair, &issuer)?;
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        let certs: Vec<_> =
            rustls_pemfile::certs(&mut cert_pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
        let leaf_cert = certs
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no certificates parsed from PEM"))?;

        let keys: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()?;
        let leaf_key_bytes = keys
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no private keys parsed from PEM"))?;
        let leaf_key_der = PrivateKey::from(leaf_key_bytes);

        let signer = aws_any_supported_type(&leaf_key_der)
            .map_err(|e| anyhow::anyhow!("failed to create leaf key signer: {}", e))?;
        Ok(Arc::new(CertifiedKey::new(vec![leaf_cert], signer)))
    }

    fn issue_national(&self, host: &str) -> Result<(X509, PKey<Private>)> {
        let group = EcGroup::from_curve_name(Nid::SM2)?;
        let key = PKey::from_ec_key(EcKey::generate(&group)?)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, host)?;
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, CA_ORGANIZATION)?;
        let name = name.build();

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        let serial = BigNum::from_dec_str(&clock_serial().to_string())?.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(self.ca_x509.subject_name())?;
        builder.set_pubkey(&key)?;
        let not_before: Asn1Time = Asn1Time::days_from_now(0)?;
        let not_after: Asn1Time = Asn1Time::days_from_now(LEAF_VALIDITY_DAYS as u32)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        let mut san = SubjectAlternativeName::new();
        if host.parse::<IpAddr>().is_ok() {
            san.ip(host);
        } else {
            san.dns(host);
        }
        let san = san.build(&builder.x509v3_context(Some(&self.ca_x509), None))?;
        builder.append_extension(san)?;
        builder.append_extension(X509BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;
        builder.sign(&self.ca_pkey, MessageDigest::sha256())?;
        Ok((builder.build(), key))
    }

    fn national_acceptor(&self, cert: &X509, key: &PKey<Private>) -> Result<SslAcceptor> {
        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
        acceptor.set_certificate(cert)?;
        acceptor.set_private_key(key)?;
        acceptor.add_extra_chain_cert(self.ca_x509.clone())?;
        acceptor.check_private_key()?;
        acceptor.set_alpn_select_callback(|_, client| {
            select_next_proto(b"\x08http/1.1", client).ok_or(AlpnError::NOACK)
        });
        Ok(acceptor.build())
    }

    fn build_identity(&self, host: &str) -> Result<HostIdentity> {
        let leaves = self.issue_leaf(host)?;

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut server_config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(AlwaysResolves(leaves.standard)));
        server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let national = match leaves.national {
            Some((cert, key)) => match self.national_acceptor(&cert, &key) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    warn!(%host, error = %e, "national TLS profile unavailable");
                    None
                }
            },
            None => None,
        };

        Ok(HostIdentity {
            host: host.to_string(),
            standard: Arc::new(server_config),
            national,
        })
    }

    /// Cached TLS identity for `host`, issued on first use.
    ///
    /// Concurrent callers for the same host share one issuance.
    pub async fn identity_for(&self, host: &str) -> Result<Arc<HostIdentity>> {
        let cell = {
            let mut identities = self
                .identities
                .lock()
                .map_err(|e| anyhow::anyhow!("identity cache lock poisoned: {}", e))?;
            identities
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let identity = cell
            .get_or_try_init(|| async {
                debug!(%host, "issuing leaf certificates");
                self.build_identity(host).map(Arc::new)
            })
            .await?;
        Ok(identity.clone())
    }

    /// Number of hosts with a cached identity.
    pub fn cached_hosts(&self) -> usize {
        self.identities
            .lock()
            .map(|m| m.values().filter(|c| c.initialized()).count())
            .unwrap_or_default()
    }
}

/// DER of the leaf a certified key presents.
pub fn leaf_der(key: &CertifiedKey) -> Option<&CertificateDer<'static>> {
    key.cert.first()
}
