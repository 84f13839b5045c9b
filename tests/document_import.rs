//! Scanned payloads of every scheme through the full import pipeline:
//! provider selection, parsing, authenticity checks and person validation.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use coset::{iana, CoseSign1Builder, HeaderBuilder, TaggedCborSerializable};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;

use tracelight::cbor;
use tracelight::codec;
use tracelight::crypto::sign;
use tracelight::document::baercode::{
    derive_key_id, BundleCertificateVerifier, BundleKey, KeyBundle,
};
use tracelight::document::{
    AppointmentProvider, BaercodeProvider, CertificateProvider, DocumentImporter, DocumentType,
    ImportError, KeyBundleCache, Outcome, ParseError, Person, SignedTicketProvider, TrustList,
    VerificationError,
};

use common::{now_unix, synced_clock, StubBackend};

const APPOINTMENT_URL: &str = "https://example.test/webapp/appointment?type=pcr&lab=Testlabor+Mitte&address=Hauptstra%C3%9Fe+1&timestamp=1601481600000&qrCode=abc123";
const TICKET_URL: &str = "https://tickets.example.test/v#b=19640812;d=202010011030;f=Mustermann;g=Erika;i=Testlabor;p=person-1;r=n;s=2fe0;t=PCR";

fn cose_sign(payload: Vec<u8>, key: &SigningKey, kid: Option<&[u8]>) -> Vec<u8> {
    let mut protected = HeaderBuilder::new().algorithm(iana::Algorithm::ES256);
    if let Some(kid) = kid {
        protected = protected.key_id(kid.to_vec());
    }
    CoseSign1Builder::new()
        .protected(protected.build())
        .payload(payload)
        .create_signature(&[], |data| {
            let signature: Signature = key.sign(data);
            signature.to_bytes().to_vec()
        })
        .build()
        .to_tagged_vec()
        .unwrap()
}

struct StubBundleVerifier {
    key: Vec<u8>,
}

impl BundleCertificateVerifier for StubBundleVerifier {
    fn verify(&self, _: &[u8]) -> Result<Vec<u8>, String> {
        Ok(self.key.clone())
    }
}

struct StubTrustList {
    keys: HashMap<Vec<u8>, Vec<u8>>,
}

impl TrustList for StubTrustList {
    fn verify(&self, kid: &[u8], data: &[u8], signature: &[u8]) -> Result<(), String> {
        let key = self
            .keys
            .get(kid)
            .ok_or_else(|| "key id is not on the trust list".to_string())?;
        match sign::verify_raw(data, signature, key) {
            Ok(true) => Ok(()),
            Ok(false) => Err("signature does not verify".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}

// Wire shapes of the two CBOR schemes, as an issuer would produce them.

#[derive(Serialize)]
struct EncryptedLayer {
    #[serde(with = "serde_bytes")]
    kid: Vec<u8>,
    #[serde(with = "serde_bytes")]
    iv: Vec<u8>,
    #[serde(with = "serde_bytes")]
    ciphertext: Vec<u8>,
}

#[derive(Serialize)]
struct BaercodeCertificate {
    first_name: String,
    last_name: String,
    date_of_birth: i64,
    disease_type: u8,
    result: bool,
    procedures: Vec<RawProcedure>,
}

#[derive(Serialize)]
struct RawProcedure {
    kind: u8,
    timestamp: i64,
}

#[derive(Serialize)]
struct DccClaims {
    issuer: String,
    issued_at: i64,
    expires_at: i64,
    certificate: DccCertificate,
}

#[derive(Serialize)]
struct DccCertificate {
    first_name: String,
    last_name: String,
    date_of_birth: Option<i64>,
    entry: DccEntry,
}

#[derive(Serialize)]
enum DccEntry {
    Vaccination {
        doses: u32,
        required_doses: u32,
        vaccinated_at: i64,
    },
}

struct World {
    importer: DocumentImporter,
    backend: Arc<StubBackend>,
    baercode_key: SigningKey,
    baercode_encryption_key: [u8; 32],
    dcc_signer: SigningKey,
    dcc_kid: Vec<u8>,
}

fn world() -> World {
    let backend = Arc::new(StubBackend::default());
    backend.accept_tickets.store(true, Ordering::SeqCst);
    let clock = synced_clock();

    // Baercode: one credential key, vouched for by a signed bundle.
    let bundle_signer = SigningKey::random(&mut OsRng);
    let baercode_key = SigningKey::random(&mut OsRng);
    let mut baercode_encryption_key = [0u8; 32];
    OsRng.fill_bytes(&mut baercode_encryption_key);
    let bundle = KeyBundle {
        issued_at: now_unix(),
        freshness_seconds: 86_400,
        keys: vec![BundleKey {
            public_key: baercode_key
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            encryption_key: baercode_encryption_key.to_vec(),
        }],
    };
    *backend.bundle.lock().unwrap() = Some(cose_sign(
        cbor::to_vec(&bundle).unwrap(),
        &bundle_signer,
        None,
    ));
    let bundle_cache = KeyBundleCache::new(
        backend.clone(),
        clock.clone(),
        Arc::new(StubBundleVerifier {
            key: bundle_signer
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
        }),
    );

    // Generic certificates: one issuer key on the trust list.
    let dcc_signer = SigningKey::random(&mut OsRng);
    let dcc_kid = b"issuer-de-01".to_vec();
    let trust_list = StubTrustList {
        keys: HashMap::from([(
            dcc_kid.clone(),
            dcc_signer
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
        )]),
    };

    let importer = DocumentImporter::new(clock.clone())
        .register(Arc::new(AppointmentProvider::new()))
        .register(Arc::new(SignedTicketProvider::new(backend.clone())))
        .register(Arc::new(BaercodeProvider::new(Arc::new(bundle_cache))))
        .register(Arc::new(CertificateProvider::new(
            Arc::new(trust_list),
            clock,
        )));

    World {
        importer,
        backend,
        baercode_key,
        baercode_encryption_key,
        dcc_signer,
        dcc_kid,
    }
}

fn mint_baercode(world: &World, procedures: Vec<RawProcedure>, result: bool) -> String {
    let certificate = BaercodeCertificate {
        first_name: "Erika".to_string(),
        last_name: "Mustermann".to_string(),
        date_of_birth: -169_948_800,
        disease_type: 1,
        result,
        procedures,
    };
    let plaintext = cbor::to_vec(&certificate).unwrap();

    let mut iv = [0u8; 12];
    OsRng.fill_bytes(&mut iv);
    let cipher = Aes256Gcm::new_from_slice(&world.baercode_encryption_key).unwrap();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
        .unwrap();

    let layer = EncryptedLayer {
        kid: derive_key_id(
            world
                .baercode_key
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes(),
        ),
        iv: iv.to_vec(),
        ciphertext,
    };
    let envelope = cose_sign(cbor::to_vec(&layer).unwrap(), &world.baercode_key, None);

    let mut bytes = vec![1u8, 0];
    bytes.extend_from_slice(&envelope);
    codec::encode_base64(&bytes)
}

fn mint_dcc(world: &World, first_name: &str, last_name: &str) -> String {
    let claims = DccClaims {
        issuer: "Robert-Koch-Institut".to_string(),
        issued_at: now_unix() - 3600,
        expires_at: now_unix() + 180 * 86_400,
        certificate: DccCertificate {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            date_of_birth: Some(-169_948_800),
            entry: DccEntry::Vaccination {
                doses: 2,
                required_doses: 2,
                vaccinated_at: 1_601_481_600,
            },
        },
    };
    let envelope = cose_sign(
        cbor::to_vec(&claims).unwrap(),
        &world.dcc_signer,
        Some(&world.dcc_kid),
    );
    format!("HC1:{}", codec::encode_base64(&envelope))
}

fn erika() -> Person {
    Person::guest("Erika", "Mustermann")
}

#[tokio::test]
async fn appointment_binds_to_the_registrant() -> Result<()> {
    let world = world();
    let document = world.importer.import(APPOINTMENT_URL, &erika(), &[]).await?;
    assert_eq!(document.document_type, DocumentType::Appointment);
    assert_eq!(document.first_name, "Erika");
    assert_eq!(document.last_name, "Mustermann");
    assert!(document.import_timestamp > 0);
    Ok(())
}

#[tokio::test]
async fn signed_ticket_imports_for_the_named_person() -> Result<()> {
    let world = world();
    let document = world.importer.import(TICKET_URL, &erika(), &[]).await?;
    assert_eq!(document.document_type, DocumentType::PcrTest);
    assert_eq!(document.outcome, Outcome::Negative);
    assert_eq!(document.issuer_name, "Testlabor");
    Ok(())
}

#[tokio::test]
async fn signed_ticket_rejects_a_different_person() {
    let world = world();
    assert!(matches!(
        world
            .importer
            .import(TICKET_URL, &Person::guest("Tom", "Tester"), &[])
            .await,
        Err(ImportError::Verification(VerificationError::NameMismatch))
    ));
}

#[tokio::test]
async fn remotely_rejected_ticket_fails_verification() {
    let world = world();
    world.backend.accept_tickets.store(false, Ordering::SeqCst);
    assert!(matches!(
        world.importer.import(TICKET_URL, &erika(), &[]).await,
        Err(ImportError::Verification(VerificationError::Unknown(_)))
    ));
}

#[tokio::test]
async fn bundle_encrypted_vaccination_imports_end_to_end() -> Result<()> {
    let world = world();
    let raw = mint_baercode(
        &world,
        vec![
            RawProcedure {
                kind: 3,
                timestamp: 1_601_481_600,
            },
            RawProcedure {
                kind: 3,
                timestamp: 1_604_160_000,
            },
        ],
        true,
    );
    let document = world.importer.import(&raw, &erika(), &[]).await?;
    assert_eq!(document.document_type, DocumentType::Vaccination);
    assert_eq!(document.outcome, Outcome::FullyImmune);
    Ok(())
}

#[tokio::test]
async fn certificate_name_is_rewritten_to_the_person_spelling() -> Result<()> {
    let world = world();
    let raw = mint_dcc(&world, "DR. ERIKA", "MUSTERMANN");
    let document = world.importer.import(&raw, &erika(), &[]).await?;
    assert_eq!(document.first_name, "Erika");
    assert_eq!(document.last_name, "Mustermann");
    assert_eq!(document.outcome, Outcome::FullyImmune);
    Ok(())
}

#[tokio::test]
async fn child_age_conflict_beats_the_generic_name_mismatch() {
    let world = world();
    // Ticket for Max, born 1964: no candidate matches by name except the
    // child, whose date of birth then fails the age window.
    let raw = TICKET_URL.replace("g=Erika", "g=Max");
    let children = [Person::child("Max", "Mustermann")];
    assert!(matches!(
        world.importer.import(&raw, &erika(), &children).await,
        Err(ImportError::Verification(
            VerificationError::DateOfBirthTooOldForChild
        ))
    ));
}

#[tokio::test]
async fn unrecognized_payloads_are_a_parse_failure() {
    let world = world();
    assert!(matches!(
        world
            .importer
            .import("LT1:definitely-not-a-credential", &erika(), &[])
            .await,
        Err(ImportError::Parse(ParseError::UnrecognizedEncoding))
    ));
}
