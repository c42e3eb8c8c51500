//! Credential bundles: a private key sealed to an isolated context's
//! ephemeral public key with HPKE, then base58check encoded for transfer.
//!
//! Suite: DHKEM(P-256, HKDF-SHA256), HKDF-SHA256, AES-256-GCM, base mode.
//! Wire layout: compressed encapsulated key (33 bytes) followed by the
//! ciphertext. The AAD binds both parties' uncompressed public keys.

use hpke::aead::AesGcm256;
use hpke::kdf::HkdfSha256;
use hpke::kem::DhP256HkdfSha256;
use hpke::{Deserializable, Kem as KemTrait, OpModeR, OpModeS, Serializable};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;

use crate::error::{Result, SignError};

type Kem = DhP256HkdfSha256;

pub type ReceiverPrivateKey = <Kem as KemTrait>::PrivateKey;
pub type ReceiverPublicKey = <Kem as KemTrait>::PublicKey;

pub const HPKE_INFO: &[u8] = b"turnkey_hpke";

const COMPRESSED_KEY_LEN: usize = 33;

/// Fresh receiver key pair for an isolated context.
pub fn generate_receiver_keypair() -> (ReceiverPrivateKey, ReceiverPublicKey) {
    Kem::gen_keypair(&mut OsRng)
}

/// Uncompressed SEC1 hex of a receiver public key.
pub fn receiver_public_hex(public: &ReceiverPublicKey) -> String {
    hex::encode(public.to_bytes())
}

/// Normalize any SEC1 encoding (compressed or not) to uncompressed bytes.
fn uncompressed(sec1: &[u8]) -> Result<Vec<u8>> {
    let key = p256::PublicKey::from_sec1_bytes(sec1)
        .map_err(|err| SignError::packaging(format!("invalid P-256 public key: {err}")))?;
    Ok(key.to_encoded_point(false).as_bytes().to_vec())
}

fn compressed(sec1: &[u8]) -> Result<Vec<u8>> {
    let key = p256::PublicKey::from_sec1_bytes(sec1)
        .map_err(|err| SignError::packaging(format!("invalid P-256 public key: {err}")))?;
    Ok(key.to_encoded_point(true).as_bytes().to_vec())
}

fn additional_data(encapped: &[u8], receiver: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(encapped.len() + receiver.len());
    aad.extend_from_slice(encapped);
    aad.extend_from_slice(receiver);
    aad
}

/// Seal `plaintext` to `target_public_key` (SEC1 bytes).
pub fn hpke_encrypt(plaintext: &[u8], target_public_key: &[u8]) -> Result<Vec<u8>> {
    let receiver_bytes = uncompressed(target_public_key)?;
    let receiver = <ReceiverPublicKey as Deserializable>::from_bytes(&receiver_bytes)
        .map_err(|err| SignError::packaging(format!("unusable HPKE target key: {err}")))?;

    let (encapped, mut ctx) = hpke::setup_sender::<AesGcm256, HkdfSha256, Kem, _>(
        &OpModeS::Base,
        &receiver,
        HPKE_INFO,
        &mut OsRng,
    )
    .map_err(|err| SignError::packaging(format!("HPKE sender setup failed: {err}")))?;

    let encapped_bytes = encapped.to_bytes();
    let aad = additional_data(&encapped_bytes, &receiver_bytes);
    let ciphertext = ctx
        .seal(plaintext, &aad)
        .map_err(|err| SignError::packaging(format!("HPKE seal failed: {err}")))?;

    let mut out = compressed(&encapped_bytes)?;
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed bundle with the receiver's key pair.
pub fn hpke_decrypt(
    sealed: &[u8],
    private: &ReceiverPrivateKey,
    public: &ReceiverPublicKey,
) -> Result<Vec<u8>> {
    if sealed.len() <= COMPRESSED_KEY_LEN {
        return Err(SignError::packaging(format!(
            "bundle too short ({} bytes)",
            sealed.len()
        )));
    }
    let (encapped_compressed, ciphertext) = sealed.split_at(COMPRESSED_KEY_LEN);
    let encapped_bytes = uncompressed(encapped_compressed)?;
    let encapped = <<Kem as KemTrait>::EncappedKey as Deserializable>::from_bytes(&encapped_bytes)
        .map_err(|err| SignError::packaging(format!("invalid encapsulated key: {err}")))?;

    let receiver_bytes = public.to_bytes();
    let aad = additional_data(&encapped_bytes, &receiver_bytes);

    let mut ctx = hpke::setup_receiver::<AesGcm256, HkdfSha256, Kem>(
        &OpModeR::Base,
        private,
        &encapped,
        HPKE_INFO,
    )
    .map_err(|err| SignError::packaging(format!("HPKE receiver setup failed: {err}")))?;

    ctx.open(ciphertext, &aad)
        .map_err(|err| SignError::packaging(format!("HPKE open failed: {err}")))
}

/// base58check text form of a sealed bundle.
pub fn encode_bundle(sealed: &[u8]) -> String {
    bs58::encode(sealed).with_check().into_string()
}

pub fn decode_bundle(encoded: &str) -> Result<Vec<u8>> {
    bs58::decode(encoded.trim())
        .with_check(None)
        .into_vec()
        .map_err(|err| SignError::packaging(format!("invalid base58check bundle: {err}")))
}
