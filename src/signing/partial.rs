//! Partial signing
//!
//! Produces one BIP-341 script-path Schnorr signature per relayer-owned
//! input, over the multisig leaf with `SIGHASH_DEFAULT`.

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{self, Keypair, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::{taproot, Amount, TapSighash, Transaction, TxOut};

use super::SignerError;
use crate::multisig::MultisigWallet;
use crate::tx::Utxo;

/// One signer's signatures, indexed by transaction input.
/// Inputs the multisig does not own carry an empty entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSignatures {
    /// Position of the signer's key in the multisig policy
    pub signer_index: usize,
    pub sigs: Vec<Vec<u8>>,
}

impl PartialSignatures {
    /// Hex form used on the wire and in storage
    pub fn to_hex(&self) -> Vec<String> {
        self.sigs.iter().map(hex::encode).collect()
    }

    pub fn from_hex(signer_index: usize, sigs: &[String]) -> Result<Self, SignerError> {
        let sigs = sigs
            .iter()
            .map(hex::decode)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SignerError::InvalidSignature {
                signer: signer_index,
                input: 0,
                reason: format!("bad hex: {}", e),
            })?;
        Ok(Self { signer_index, sigs })
    }
}

/// Check that `utxos` describe exactly the inputs of `tx`, in order
pub fn check_inputs(tx: &Transaction, utxos: &[Utxo]) -> Result<(), SignerError> {
    if tx.input.len() != utxos.len() {
        return Err(SignerError::InputMismatch(format!(
            "{} inputs but {} utxos",
            tx.input.len(),
            utxos.len()
        )));
    }
    for (i, (input, utxo)) in tx.input.iter().zip(utxos).enumerate() {
        if input.previous_output != utxo.outpoint() {
            return Err(SignerError::InputMismatch(format!(
                "input {} spends {} but utxo is {}",
                i,
                input.previous_output,
                utxo.outpoint()
            )));
        }
    }
    Ok(())
}

fn prevouts(utxos: &[Utxo]) -> Vec<TxOut> {
    utxos
        .iter()
        .map(|utxo| TxOut {
            value: Amount::from_sat(utxo.amount),
            script_pubkey: utxo.pk_script.clone(),
        })
        .collect()
}

/// Script-path sighash of `input` over the wallet's multisig leaf
pub fn multisig_sighash(
    tx: &Transaction,
    utxos: &[Utxo],
    wallet: &MultisigWallet,
    input: usize,
    sighash_type: TapSighashType,
) -> Result<TapSighash, SignerError> {
    let prevouts = prevouts(utxos);
    SighashCache::new(tx)
        .taproot_script_spend_signature_hash(
            input,
            &Prevouts::All(&prevouts),
            wallet.leaf_hash(),
            sighash_type,
        )
        .map_err(|e| SignerError::Sighash(e.to_string()))
}

/// Holds one party's key share of the multisig
pub struct PartialSigner {
    keypair: Keypair,
    signer_index: usize,
    secp: Secp256k1<secp256k1::All>,
}

impl PartialSigner {
    /// Create a signer for `wallet`; the key must be one of its signers
    pub fn new(secret_key: SecretKey, wallet: &MultisigWallet) -> Result<Self, SignerError> {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        let signer_index = wallet
            .info()
            .pub_keys
            .iter()
            .position(|k| *k == public_key)
            .ok_or(SignerError::KeyNotInPolicy)?;

        Ok(Self {
            keypair: Keypair::from_secret_key(&secp, &secret_key),
            signer_index,
            secp,
        })
    }

    /// Create from a hex secret key
    pub fn from_hex(hex_key: &str, wallet: &MultisigWallet) -> Result<Self, SignerError> {
        let bytes = hex::decode(hex_key).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Self::new(secret_key, wallet)
    }

    pub fn signer_index(&self) -> usize {
        self.signer_index
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Sign every input of `tx` owned by `wallet`
    pub fn sign(
        &self,
        tx: &Transaction,
        utxos: &[Utxo],
        wallet: &MultisigWallet,
    ) -> Result<PartialSignatures, SignerError> {
        check_inputs(tx, utxos)?;

        let sigs = utxos
            .iter()
            .enumerate()
            .map(|(i, utxo)| {
                if !wallet.owns(&utxo.pk_script) {
                    return Ok(Vec::new());
                }
                let sighash = multisig_sighash(tx, utxos, wallet, i, TapSighashType::Default)?;
                let msg = Message::from_digest(sighash.to_byte_array());
                let signature = taproot::Signature {
                    signature: self.secp.sign_schnorr(&msg, &self.keypair),
                    sighash_type: TapSighashType::Default,
                };
                Ok(signature.to_vec())
            })
            .collect::<Result<Vec<_>, SignerError>>()?;

        Ok(PartialSignatures {
            signer_index: self.signer_index,
            sigs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multisig::MultisigInfo;
    use crate::tx::{build_multisig_tx, OutputTx};
    use bitcoin::{Network, ScriptBuf, Txid};

    fn secret(i: u8) -> SecretKey {
        SecretKey::from_slice(&[i; 32]).unwrap()
    }

    fn wallet() -> MultisigWallet {
        let secp = Secp256k1::new();
        MultisigWallet::build(&MultisigInfo {
            pub_keys: (1..=3).map(|i| PublicKey::from_secret_key(&secp, &secret(i))).collect(),
            required_sigs: 2,
            recovery_pub_key: None,
            recovery_block_height: 0,
        })
        .unwrap()
    }

    fn utxo(n: u8, pk_script: ScriptBuf) -> Utxo {
        Utxo {
            txid: Txid::from_byte_array([n; 32]),
            vout: 0,
            amount: 50_000,
            pk_script,
            is_relayers_multisig: true,
            runes: vec![],
        }
    }

    #[test]
    fn test_signs_only_owned_inputs() {
        let ms = wallet();
        let foreign = ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::all_zeros());
        let utxos = vec![utxo(1, ms.pk_script().clone()), utxo(2, foreign)];
        let tx = build_multisig_tx(
            &utxos,
            &[OutputTx::Payment {
                address: ms.address_on_chain(Network::Testnet),
                amount: 90_000,
            }],
        );

        let signer = PartialSigner::new(secret(2), &ms).unwrap();
        assert_eq!(signer.signer_index(), 1);

        let partial = signer.sign(&tx, &utxos, &ms).unwrap();
        assert_eq!(partial.sigs.len(), 2);
        assert_eq!(partial.sigs[0].len(), 64);
        assert!(partial.sigs[1].is_empty());

        let hex = partial.to_hex();
        assert_eq!(hex[1], "");
        assert_eq!(PartialSignatures::from_hex(1, &hex).unwrap(), partial);
    }

    #[test]
    fn test_rejects_outsider_key_and_mismatched_utxos() {
        let ms = wallet();
        assert!(matches!(
            PartialSigner::new(secret(9), &ms),
            Err(SignerError::KeyNotInPolicy)
        ));

        let utxos = vec![utxo(1, ms.pk_script().clone())];
        let tx = build_multisig_tx(&utxos, &[]);
        let signer = PartialSigner::new(secret(1), &ms).unwrap();
        assert!(matches!(
            signer.sign(&tx, &[utxo(7, ms.pk_script().clone())], &ms),
            Err(SignerError::InputMismatch(_))
        ));
    }
}
