//! Development crypto box backed by Ed25519 keys
//!
//! Key material is accepted as:
//! - a raw 32-byte seed,
//! - a PEM block `ED25519 PRIVATE KEY` holding a seed,
//! - a password-protected container (see `sigbox_crypto::seal_container`)
//!   holding one or more seeds, raw or armored as `ENCRYPTED PRIVATE KEY`.
//!
//! Certificates are Ed25519 public keys, raw or armored as
//! `ED25519 PUBLIC KEY`/`CERTIFICATE`.
//!
//! A signed container is `signature || content`; a detached signature is the
//! bare 64-byte signature. Encryption and CMP lookups are not available.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Value, json};
use sigbox_crypto::{
    ED25519_KEY_LEN, ED25519_SIGNATURE_LEN, SigningKeyPair, key_id, open_container,
    verify_signature,
};
use sigbox_protocol::{ClearKey, Headers, PipeStep, StepOp};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::{BoxError, BoxFactory, CryptoBox, TrustBundle, Unwrapped, encode_pem, parse_pem};

pub const LABEL_PRIVATE_KEY: &str = "ED25519 PRIVATE KEY";
pub const LABEL_ENCRYPTED_KEY: &str = "ENCRYPTED PRIVATE KEY";
pub const LABEL_PUBLIC_KEY: &str = "ED25519 PUBLIC KEY";
const LABEL_CERTIFICATE: &str = "CERTIFICATE";

/// Ed25519 development box
#[derive(Default)]
pub struct SoftBox {
    keys: Vec<SigningKeyPair>,
    certs: Vec<[u8; ED25519_KEY_LEN]>,
    trust: Option<Arc<TrustBundle>>,
}

impl SoftBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    fn add_seed(&mut self, seed: &[u8]) -> Result<(), BoxError> {
        let pair = SigningKeyPair::from_seed(seed)?;
        let id = pair.key_id();
        if self.keys.iter().any(|k| k.key_id() == id) {
            trace!(keyid = %id, "Key already loaded");
            return Ok(());
        }
        debug!(keyid = %id, "Loaded key");
        self.keys.push(pair);
        Ok(())
    }

    fn signer_for(&self, step: &PipeStep) -> Result<&SigningKeyPair, BoxError> {
        match step.params.get("keyid").and_then(Value::as_str) {
            Some(wanted) => self
                .keys
                .iter()
                .find(|k| k.key_id() == wanted)
                .ok_or_else(|| BoxError::UnknownKey(wanted.to_owned())),
            None => self.keys.first().ok_or(BoxError::NoKey),
        }
    }

    /// Every public key a signature may be checked against
    fn verifiers(&self) -> impl Iterator<Item = [u8; ED25519_KEY_LEN]> + '_ {
        let anchors = self
            .trust
            .iter()
            .flat_map(|t| t.anchors())
            .filter_map(|a| <[u8; ED25519_KEY_LEN]>::try_from(a.as_slice()).ok());
        self.keys
            .iter()
            .map(SigningKeyPair::public_key)
            .chain(self.certs.iter().copied())
            .chain(anchors)
    }

    fn describe(public_key: &[u8], has_key: bool) -> Value {
        json!({
            "keyid": key_id(public_key),
            "publicKey": hex::encode(public_key),
            "pem": encode_pem(LABEL_PUBLIC_KEY, public_key),
            "hasKey": has_key,
        })
    }
}

fn split_seeds(plain: &[u8]) -> Result<Vec<Vec<u8>>, BoxError> {
    if plain.is_empty() || plain.len() % ED25519_KEY_LEN != 0 {
        return Err(BoxError::InvalidKey(format!(
            "container holds {} bytes, not a list of seeds",
            plain.len()
        )));
    }
    Ok(plain.chunks(ED25519_KEY_LEN).map(<[u8]>::to_vec).collect())
}

fn decode_key_part(part: &[u8], password: Option<&str>) -> Result<Vec<Vec<u8>>, BoxError> {
    let open = |sealed: &[u8]| -> Result<Vec<Vec<u8>>, BoxError> {
        let password = password.ok_or(BoxError::PasswordRequired)?;
        split_seeds(&open_container(password, sealed)?)
    };

    let blocks = parse_pem(part)?;
    if blocks.is_empty() {
        if part.len() == ED25519_KEY_LEN {
            return Ok(vec![part.to_vec()]);
        }
        return open(part);
    }

    let mut seeds = Vec::new();
    for block in blocks {
        match block.label.as_str() {
            LABEL_PRIVATE_KEY => seeds.push(block.data),
            LABEL_ENCRYPTED_KEY => seeds.extend(open(&block.data)?),
            other => {
                return Err(BoxError::InvalidKey(format!("unexpected PEM block {other}")));
            }
        }
    }
    Ok(seeds)
}

fn decode_cert_part(part: &[u8]) -> Result<Vec<[u8; ED25519_KEY_LEN]>, BoxError> {
    let to_key = |data: &[u8]| {
        <[u8; ED25519_KEY_LEN]>::try_from(data).map_err(|_| {
            BoxError::InvalidCertificate(format!("expected {ED25519_KEY_LEN} bytes, got {}", data.len()))
        })
    };

    let blocks = parse_pem(part)?;
    if blocks.is_empty() {
        return Ok(vec![to_key(part)?]);
    }
    blocks
        .iter()
        .map(|block| match block.label.as_str() {
            LABEL_PUBLIC_KEY | LABEL_CERTIFICATE => to_key(&block.data),
            other => Err(BoxError::InvalidCertificate(format!(
                "unexpected PEM block {other}"
            ))),
        })
        .collect()
}

#[async_trait]
impl CryptoBox for SoftBox {
    async fn load_key(
        &mut self,
        parts: Vec<Bytes>,
        password: Option<&str>,
    ) -> Result<(), BoxError> {
        if parts.is_empty() {
            return Err(BoxError::InvalidKey("no key material".into()));
        }
        for part in &parts {
            for seed in decode_key_part(part, password)? {
                self.add_seed(&seed)?;
            }
        }
        Ok(())
    }

    async fn load_cert(&mut self, parts: Vec<Bytes>) -> Result<(), BoxError> {
        if parts.is_empty() {
            return Err(BoxError::InvalidCertificate("no certificate material".into()));
        }
        for part in &parts {
            for cert in decode_cert_part(part)? {
                if !self.certs.contains(&cert) {
                    self.certs.push(cert);
                }
            }
        }
        Ok(())
    }

    fn load_trust_anchors(&mut self, bundle: Arc<TrustBundle>) {
        self.trust = Some(bundle);
    }

    fn certificates(&self) -> Vec<Value> {
        let key_pks: Vec<_> = self.keys.iter().map(SigningKeyPair::public_key).collect();
        key_pks
            .iter()
            .map(|pk| Self::describe(pk, true))
            .chain(
                self.certs
                    .iter()
                    .filter(|c| !key_pks.contains(*c))
                    .map(|c| Self::describe(c, false)),
            )
            .collect()
    }

    fn export_keys(&self) -> Result<Vec<ClearKey>, BoxError> {
        Ok(self
            .keys
            .iter()
            .map(|k| ClearKey {
                id: k.key_id(),
                pem: encode_pem(LABEL_PRIVATE_KEY, &k.seed()),
            })
            .collect())
    }

    async fn pipe(
        &self,
        content: Bytes,
        steps: &[PipeStep],
        headers: &Headers,
    ) -> Result<Bytes, BoxError> {
        // no transport envelope in this box
        if !headers.is_empty() {
            trace!(count = headers.len(), "Ignoring transport headers");
        }

        let mut data = content;
        for step in steps {
            match step.op {
                StepOp::Sign => {
                    let signer = self.signer_for(step)?;
                    let signature = signer.sign(&data);
                    data = if step.flag("detached") {
                        Bytes::copy_from_slice(&signature)
                    } else {
                        let mut out = BytesMut::with_capacity(signature.len() + data.len());
                        out.put_slice(&signature);
                        out.put_slice(&data);
                        out.freeze()
                    };
                }
                StepOp::Encrypt => return Err(BoxError::Unsupported("encrypt")),
                StepOp::Unknown => return Err(BoxError::Unsupported("pipeline step")),
            }
        }
        Ok(data)
    }

    async fn unwrap_content(
        &self,
        content: Bytes,
        second: Option<Bytes>,
        _opts: &Value,
    ) -> Result<Unwrapped, BoxError> {
        let detached = second.is_some();
        let (signature, data) = match second {
            Some(data) => (content, data),
            None => {
                if content.len() < ED25519_SIGNATURE_LEN {
                    return Err(BoxError::Malformed(format!(
                        "{} bytes is too short for a signed container",
                        content.len()
                    )));
                }
                let mut data = content;
                let signature = data.split_to(ED25519_SIGNATURE_LEN);
                (signature, data)
            }
        };

        let signer = self
            .verifiers()
            .find(|pk| verify_signature(pk, &data, &signature).is_ok())
            .ok_or_else(|| BoxError::Verification("no known key verifies the signature".into()))?;

        Ok(Unwrapped {
            content: data,
            meta: json!({
                "pipe": [{
                    "op": "sign",
                    "detached": detached,
                    "verified": true,
                    "signer": {
                        "keyid": key_id(&signer),
                        "publicKey": hex::encode(signer),
                    },
                }],
            }),
        })
    }

    async fn find_certs_cmp(&mut self, urls: &[String]) -> Result<u64, BoxError> {
        if urls.is_empty() {
            return Ok(0);
        }
        Err(BoxError::Unsupported("cmp"))
    }
}

/// Creates empty `SoftBox`es
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftBoxFactory;

impl BoxFactory for SoftBoxFactory {
    fn create(&self) -> Box<dyn CryptoBox> {
        Box::new(SoftBox::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigbox_crypto::seal_container;

    fn seed(n: u8) -> Vec<u8> {
        vec![n; ED25519_KEY_LEN]
    }

    async fn box_with_key(n: u8) -> SoftBox {
        let mut sbox = SoftBox::new();
        sbox.load_key(vec![Bytes::from(seed(n))], None).await.unwrap();
        sbox
    }

    #[tokio::test]
    async fn test_load_raw_and_pem_keys() {
        let mut sbox = SoftBox::new();
        let pem = encode_pem(LABEL_PRIVATE_KEY, &seed(2));
        sbox.load_key(vec![Bytes::from(seed(1)), Bytes::from(pem)], None)
            .await
            .unwrap();
        assert_eq!(sbox.key_count(), 2);

        // same key again is not duplicated
        sbox.load_key(vec![Bytes::from(seed(1))], None).await.unwrap();
        assert_eq!(sbox.key_count(), 2);
    }

    #[tokio::test]
    async fn test_load_protected_container() {
        let mut plain = seed(3);
        plain.extend(seed(4));
        let sealed = seal_container("secret", &plain).unwrap();

        let mut sbox = SoftBox::new();
        assert!(matches!(
            sbox.load_key(vec![Bytes::from(sealed.clone())], None).await,
            Err(BoxError::PasswordRequired)
        ));
        assert!(matches!(
            sbox.load_key(vec![Bytes::from(sealed.clone())], Some("wrong")).await,
            Err(BoxError::Container(_))
        ));

        sbox.load_key(vec![Bytes::from(sealed)], Some("secret"))
            .await
            .unwrap();
        assert_eq!(sbox.key_count(), 2);
    }

    #[tokio::test]
    async fn test_load_armored_container() {
        let sealed = seal_container("pw", &seed(5)).unwrap();
        let pem = encode_pem(LABEL_ENCRYPTED_KEY, &sealed);

        let mut sbox = SoftBox::new();
        sbox.load_key(vec![Bytes::from(pem)], Some("pw")).await.unwrap();
        assert_eq!(sbox.key_count(), 1);
    }

    #[tokio::test]
    async fn test_load_key_rejects_garbage() {
        let mut sbox = SoftBox::new();
        assert!(sbox.load_key(vec![], None).await.is_err());
        assert!(
            sbox.load_key(vec![Bytes::from_static(b"short")], Some("pw"))
                .await
                .is_err()
        );
        let pem = encode_pem("RSA PRIVATE KEY", &seed(1));
        assert!(matches!(
            sbox.load_key(vec![Bytes::from(pem)], None).await,
            Err(BoxError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_and_unwrap_attached() {
        let sbox = box_with_key(1).await;
        let signed = sbox
            .pipe(Bytes::from_static(b"hello"), &[PipeStep::sign()], &Headers::new())
            .await
            .unwrap();
        assert_eq!(signed.len(), ED25519_SIGNATURE_LEN + 5);
        assert_eq!(&signed[ED25519_SIGNATURE_LEN..], b"hello");

        let unwrapped = sbox.unwrap_content(signed, None, &Value::Null).await.unwrap();
        assert_eq!(unwrapped.content, Bytes::from_static(b"hello"));
        assert_eq!(unwrapped.meta["pipe"][0]["verified"], true);
        assert_eq!(unwrapped.meta["pipe"][0]["detached"], false);
    }

    #[tokio::test]
    async fn test_sign_detached_and_verify_with_cert_only() {
        let signer = box_with_key(7).await;
        let sig = signer
            .pipe(
                Bytes::from_static(b"data"),
                &[PipeStep::sign().with("detached", true)],
                &Headers::new(),
            )
            .await
            .unwrap();
        assert_eq!(sig.len(), ED25519_SIGNATURE_LEN);

        let public = SigningKeyPair::from_seed(&seed(7)).unwrap().public_key();
        let mut verifier = SoftBox::new();
        verifier
            .load_cert(vec![Bytes::from(encode_pem(LABEL_PUBLIC_KEY, &public))])
            .await
            .unwrap();

        let out = verifier
            .unwrap_content(sig, Some(Bytes::from_static(b"data")), &Value::Null)
            .await
            .unwrap();
        assert_eq!(out.content, Bytes::from_static(b"data"));
        assert_eq!(out.meta["pipe"][0]["signer"]["keyid"], key_id(&public));
    }

    #[tokio::test]
    async fn test_verify_with_trust_anchor() {
        let signer = box_with_key(8).await;
        let signed = signer
            .pipe(Bytes::from_static(b"x"), &[PipeStep::sign()], &Headers::new())
            .await
            .unwrap();

        let public = SigningKeyPair::from_seed(&seed(8)).unwrap().public_key();
        let bundle = TrustBundle::parse(encode_pem("CERTIFICATE", &public).as_bytes()).unwrap();
        let mut verifier = SoftBox::new();
        assert!(verifier.unwrap_content(signed.clone(), None, &Value::Null).await.is_err());

        verifier.load_trust_anchors(Arc::new(bundle));
        assert!(verifier.unwrap_content(signed, None, &Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn test_unwrap_tampered() {
        let sbox = box_with_key(1).await;
        let signed = sbox
            .pipe(Bytes::from_static(b"hello"), &[PipeStep::sign()], &Headers::new())
            .await
            .unwrap();
        let mut tampered = BytesMut::from(&signed[..]);
        let last = tampered.len() - 1;
        tampered[last] ^= 1;

        assert!(matches!(
            sbox.unwrap_content(tampered.freeze(), None, &Value::Null).await,
            Err(BoxError::Verification(_))
        ));
        assert!(matches!(
            sbox.unwrap_content(Bytes::from_static(b"tiny"), None, &Value::Null).await,
            Err(BoxError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_pipe_errors() {
        let empty = SoftBox::new();
        assert!(matches!(
            empty
                .pipe(Bytes::from_static(b"x"), &[PipeStep::sign()], &Headers::new())
                .await,
            Err(BoxError::NoKey)
        ));

        let sbox = box_with_key(1).await;
        assert!(matches!(
            sbox.pipe(Bytes::from_static(b"x"), &[PipeStep::encrypt()], &Headers::new())
                .await,
            Err(BoxError::Unsupported("encrypt"))
        ));
        let verify = PipeStep {
            op: StepOp::Unknown,
            params: Default::default(),
        };
        assert!(matches!(
            sbox.pipe(Bytes::from_static(b"x"), &[verify], &Headers::new())
                .await,
            Err(BoxError::Unsupported(_))
        ));
        assert!(matches!(
            sbox.pipe(
                Bytes::from_static(b"x"),
                &[PipeStep::sign().with("keyid", "nope")],
                &Headers::new()
            )
            .await,
            Err(BoxError::UnknownKey(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_with_selected_key() {
        let mut sbox = SoftBox::new();
        sbox.load_key(vec![Bytes::from(seed(1)), Bytes::from(seed(2))], None)
            .await
            .unwrap();
        let second = SigningKeyPair::from_seed(&seed(2)).unwrap();

        let sig = sbox
            .pipe(
                Bytes::from_static(b"m"),
                &[PipeStep::sign().with("keyid", second.key_id()).with("detached", true)],
                &Headers::new(),
            )
            .await
            .unwrap();
        assert!(verify_signature(&second.public_key(), b"m", &sig).is_ok());
    }

    #[tokio::test]
    async fn test_certificates_and_export() {
        let mut sbox = box_with_key(1).await;
        let own = SigningKeyPair::from_seed(&seed(1)).unwrap().public_key();
        sbox.load_cert(vec![Bytes::copy_from_slice(&own), Bytes::from(vec![9u8; 32])])
            .await
            .unwrap();

        let certs = sbox.certificates();
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0]["hasKey"], true);
        assert_eq!(certs[1]["hasKey"], false);

        let keys = sbox.export_keys().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, key_id(&own));
        let blocks = parse_pem(keys[0].pem.as_bytes()).unwrap();
        assert_eq!(blocks[0].data, seed(1));
    }

    #[tokio::test]
    async fn test_cmp() {
        let mut sbox = SoftBox::new();
        assert_eq!(sbox.find_certs_cmp(&[]).await.unwrap(), 0);
        assert!(sbox
            .find_certs_cmp(&["http://ca.example/cmp".into()])
            .await
            .is_err());
    }

    #[test]
    fn test_factory_creates_empty_box() {
        let b = SoftBoxFactory.create();
        assert!(b.certificates().is_empty());
    }
}
