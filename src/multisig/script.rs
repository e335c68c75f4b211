//! Tapscript leaves and the shared internal key
//!
//! # Leaves
//! - Multisig: `<pk0> OP_CHECKSIG <pk1> OP_CHECKSIGADD … <k> OP_NUMEQUAL`
//! - Recovery: `<height> OP_CHECKLOCKTIMEVERIFY OP_DROP <pk> OP_CHECKSIG`
//!
//! # Internal key
//! Key-path spends must be impossible, so the internal key is
//! `P = H + r·G` where `H` is the point whose x-coordinate is
//! `sha256(uncompressed G)` and `r` is a published constant. The y of `H`
//! is the root `(x³+7)^((p+1)/4)`, which is odd for this x, so `H` is the
//! negation of the BIP-341 even-y lift.
//! Nobody knows the discrete log of `H`, hence nobody knows one for `P`,
//! and anyone can recompute `P` from `r`.

use bitcoin::opcodes::all::{OP_CHECKSIG, OP_CHECKSIGADD, OP_CLTV, OP_DROP, OP_NUMEQUAL};
use bitcoin::script::Builder as ScriptBuilder;
use bitcoin::secp256k1::{Parity, PublicKey, Scalar, Secp256k1, SecretKey};
use bitcoin::{ScriptBuf, XOnlyPublicKey};
use sha2::{Digest, Sha256};

use super::WalletError;

/// Public tweak seed of the shared internal key
pub const SHARED_RANDOM_HEX: &str =
    "304575862a092eb80b87dcbafdaac720687694f451ef063b4fb109071f9252ee";

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Build the k-of-n CHECKSIGADD leaf
pub fn build_multisig_script(
    required_sigs: usize,
    pub_keys: &[PublicKey],
) -> Result<ScriptBuf, WalletError> {
    let (first, rest) = pub_keys.split_first().ok_or(WalletError::EmptyKeySet)?;

    let mut builder = ScriptBuilder::new()
        .push_x_only_key(&first.x_only_public_key().0)
        .push_opcode(OP_CHECKSIG);
    for key in rest {
        builder = builder
            .push_x_only_key(&key.x_only_public_key().0)
            .push_opcode(OP_CHECKSIGADD);
    }

    Ok(builder
        .push_int(required_sigs as i64)
        .push_opcode(OP_NUMEQUAL)
        .into_script())
}

/// Build the absolute-timelock recovery leaf
pub fn build_recovery_script(lock_height: u32, pub_key: &PublicKey) -> ScriptBuf {
    ScriptBuilder::new()
        .push_int(i64::from(lock_height))
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_x_only_key(&pub_key.x_only_public_key().0)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// The unspendable base point `H`, lifted with the odd-y root
pub fn nums_point() -> Result<PublicKey, WalletError> {
    let secp = Secp256k1::new();
    let mut one = [0u8; 32];
    one[31] = 1;
    let one = SecretKey::from_slice(&one).map_err(|e| WalletError::Key(e.to_string()))?;
    let generator = PublicKey::from_secret_key(&secp, &one);

    let x = sha256(&generator.serialize_uncompressed());
    let h = XOnlyPublicKey::from_slice(&x).map_err(|e| WalletError::Key(e.to_string()))?;
    Ok(h.public_key(Parity::Odd))
}

/// Derive `H + seed·G`
pub fn shared_internal_key(seed: &[u8; 32]) -> Result<PublicKey, WalletError> {
    let secp = Secp256k1::new();
    let tweak = Scalar::from_be_bytes(*seed).map_err(|_| WalletError::Key("seed out of range".to_string()))?;
    nums_point()?
        .add_exp_tweak(&secp, &tweak)
        .map_err(|e| WalletError::Key(e.to_string()))
}

/// The internal key every relayer wallet is rooted under
pub fn default_internal_key() -> Result<XOnlyPublicKey, WalletError> {
    let mut seed = [0u8; 32];
    hex::decode_to_slice(SHARED_RANDOM_HEX, &mut seed)
        .map_err(|e| WalletError::Key(e.to_string()))?;
    Ok(shared_internal_key(&seed)?.x_only_public_key().0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::opcodes::all::OP_PUSHNUM_2;

    fn keys(n: u8) -> Vec<PublicKey> {
        let secp = Secp256k1::new();
        (1..=n)
            .map(|i| PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[i; 32]).unwrap()))
            .collect()
    }

    #[test]
    fn test_multisig_script_layout() {
        let script = build_multisig_script(2, &keys(3)).unwrap();
        let bytes = script.as_bytes();

        assert_eq!(bytes.len(), 3 * 33 + 3 + 2);
        assert_eq!(bytes[33], OP_CHECKSIG.to_u8());
        assert_eq!(bytes[67], OP_CHECKSIGADD.to_u8());
        assert_eq!(bytes[101], OP_CHECKSIGADD.to_u8());
        assert_eq!(bytes[102], OP_PUSHNUM_2.to_u8());
        assert_eq!(bytes[103], OP_NUMEQUAL.to_u8());
    }

    #[test]
    fn test_multisig_script_requires_keys() {
        assert!(matches!(
            build_multisig_script(1, &[]),
            Err(WalletError::EmptyKeySet)
        ));
    }

    #[test]
    fn test_recovery_script_layout() {
        let key = keys(1)[0];
        let script = build_recovery_script(2_500_000, &key);
        let expected = ScriptBuilder::new()
            .push_int(2_500_000)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_x_only_key(&key.x_only_public_key().0)
            .push_opcode(OP_CHECKSIG)
            .into_script();
        assert_eq!(script, expected);
    }

    #[test]
    fn test_nums_point_is_bip341_h() {
        let h = nums_point().unwrap();
        assert_eq!(
            hex::encode(h.x_only_public_key().0.serialize()),
            "50929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0"
        );
    }

    #[test]
    fn test_nums_point_takes_odd_root() {
        let h = nums_point().unwrap();
        assert_eq!(h.x_only_public_key().1, Parity::Odd);
        assert_eq!(h.serialize()[0], 0x03);
    }

    #[test]
    fn test_default_internal_key_matches_deployed_wallets() {
        // internal key carried in the control block of spent bridge outputs
        assert_eq!(
            hex::encode(default_internal_key().unwrap().serialize()),
            "636e6671d0135074f83177c5e456191043de9bd54744423b88d6b1ab4751650f"
        );
    }

    #[test]
    fn test_shared_internal_key_is_deterministic() {
        let a = default_internal_key().unwrap();
        let b = default_internal_key().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, nums_point().unwrap().x_only_public_key().0);

        let other = shared_internal_key(&[7u8; 32]).unwrap().x_only_public_key().0;
        assert_ne!(a, other);
    }
}
