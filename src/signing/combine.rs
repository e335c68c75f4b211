//! Signature aggregation
//!
//! Turns `k` verified partial signature sets into script-path witnesses for
//! the multisig leaf. The leaf consumes signatures in key order starting
//! from the top of the stack, so the witness lists them from the last key
//! down to the first, with an empty element for every key that did not
//! sign.

use std::collections::BTreeMap;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::TapSighashType;
use bitcoin::{taproot, Transaction, Witness, XOnlyPublicKey};

use super::partial::{check_inputs, multisig_sighash, PartialSignatures};
use super::SignerError;
use crate::multisig::MultisigWallet;
use crate::tx::Utxo;

/// Verify partial signature sets and finalize the transaction.
///
/// Sets from unknown signers are ignored and, per signer, the first set
/// that verifies is kept. A set with a wrong shape or a signature that does
/// not verify is dropped; the combine only fails when fewer than `k` valid
/// sets remain, reporting the first rejection if there was one.
pub fn combine_signatures(
    wallet: &MultisigWallet,
    tx: &Transaction,
    utxos: &[Utxo],
    sets: &[PartialSignatures],
) -> Result<Transaction, SignerError> {
    check_inputs(tx, utxos)?;

    let info = wallet.info();
    let signer_count = info.pub_keys.len();
    let required = info.required_sigs;

    let secp = Secp256k1::verification_only();
    let owned: Vec<bool> = utxos.iter().map(|u| wallet.owns(&u.pk_script)).collect();
    let messages = owned
        .iter()
        .enumerate()
        .map(|(i, owned)| {
            if !owned {
                return Ok(None);
            }
            let sighash = multisig_sighash(tx, utxos, wallet, i, TapSighashType::Default)?;
            Ok(Some(Message::from_digest(sighash.to_byte_array())))
        })
        .collect::<Result<Vec<_>, SignerError>>()?;

    let mut by_signer: BTreeMap<usize, &PartialSignatures> = BTreeMap::new();
    let mut rejected: Option<SignerError> = None;
    for set in sets {
        let signer = set.signer_index;
        if signer >= signer_count {
            tracing::warn!(
                target: "bridge::signing",
                signer = signer,
                "Ignoring signatures from unknown signer"
            );
            continue;
        }
        if by_signer.contains_key(&signer) {
            continue;
        }

        let (key, _) = info.pub_keys[signer].x_only_public_key();
        match verify_set(&secp, &key, &messages, set) {
            Ok(()) => {
                by_signer.insert(signer, set);
            }
            Err((input, reason)) => {
                tracing::warn!(
                    target: "bridge::signing",
                    signer = signer,
                    input = input,
                    reason = %reason,
                    "Dropping invalid signature set"
                );
                rejected.get_or_insert(SignerError::InvalidSignature {
                    signer,
                    input,
                    reason,
                });
            }
        }
    }

    if by_signer.len() < required {
        return Err(rejected.unwrap_or(SignerError::InsufficientSignatures {
            required,
            collected: by_signer.len(),
        }));
    }

    let chosen: BTreeMap<usize, &PartialSignatures> =
        by_signer.into_iter().take(required).collect();
    let leaf = wallet.multisig_script();
    let control_block = wallet
        .control_block()
        .map_err(|e| SignerError::Sighash(e.to_string()))?
        .serialize();

    let mut signed = tx.clone();
    for (input, txin) in signed.input.iter_mut().enumerate() {
        if !owned[input] {
            continue;
        }
        let mut witness = Witness::new();
        for signer in (0..signer_count).rev() {
            match chosen.get(&signer) {
                Some(set) => witness.push(&set.sigs[input]),
                None => witness.push(b""),
            }
        }
        witness.push(leaf.as_bytes());
        witness.push(&control_block);
        txin.witness = witness;
    }

    tracing::debug!(
        target: "bridge::signing",
        txid = %signed.compute_txid(),
        signers = ?chosen.keys().collect::<Vec<_>>(),
        "Combined multisig signatures"
    );

    Ok(signed)
}

/// Check one set against the per-input sighashes; `Err((input, reason))`
fn verify_set(
    secp: &Secp256k1<bitcoin::secp256k1::VerifyOnly>,
    key: &XOnlyPublicKey,
    messages: &[Option<Message>],
    set: &PartialSignatures,
) -> Result<(), (usize, String)> {
    if set.sigs.len() != messages.len() {
        return Err((
            set.sigs.len().min(messages.len()),
            format!("expected {} signatures, got {}", messages.len(), set.sigs.len()),
        ));
    }
    for (input, msg) in messages.iter().enumerate() {
        if let Some(msg) = msg {
            verify_one(secp, key, msg, &set.sigs[input]).map_err(|reason| (input, reason))?;
        }
    }
    Ok(())
}

fn verify_one(
    secp: &Secp256k1<bitcoin::secp256k1::VerifyOnly>,
    key: &XOnlyPublicKey,
    msg: &Message,
    bytes: &[u8],
) -> Result<(), String> {
    let sig = taproot::Signature::from_slice(bytes).map_err(|e| e.to_string())?;
    if sig.sighash_type != TapSighashType::Default {
        return Err(format!("unexpected sighash type {}", sig.sighash_type));
    }
    secp.verify_schnorr(&sig.signature, msg, key)
        .map_err(|e| e.to_string())
}
