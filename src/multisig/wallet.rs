//! Multisig taproot wallet
//!
//! The wallet is fully determined by [`MultisigInfo`]: the ordered signer
//! keys, the threshold and the optional recovery leaf. It is built once at
//! startup and shared read-only afterwards.

use bitcoin::key::TweakedPublicKey;
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::taproot::{ControlBlock, LeafVersion, TapLeafHash, TaprootBuilder, TaprootSpendInfo};
use bitcoin::{Address, Network, Script, ScriptBuf, XOnlyPublicKey};

use super::script::{build_multisig_script, build_recovery_script, default_internal_key};
use super::WalletError;

/// Spend policy of the relayer wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigInfo {
    /// Signer keys; the position of a key is the signer's index
    pub pub_keys: Vec<PublicKey>,
    pub required_sigs: usize,
    pub recovery_pub_key: Option<PublicKey>,
    /// Absolute lock height of the recovery leaf, 0 disables it
    pub recovery_block_height: u32,
}

impl MultisigInfo {
    pub fn validate(&self) -> Result<(), WalletError> {
        if self.pub_keys.is_empty() {
            return Err(WalletError::EmptyKeySet);
        }
        if self.required_sigs == 0 || self.required_sigs > self.pub_keys.len() {
            return Err(WalletError::InvalidThreshold {
                required: self.required_sigs,
                total: self.pub_keys.len(),
            });
        }
        Ok(())
    }

    /// Recovery key, if the recovery leaf is enabled
    pub fn recovery(&self) -> Option<&PublicKey> {
        if self.recovery_block_height > 0 {
            self.recovery_pub_key.as_ref()
        } else {
            None
        }
    }
}

/// Taproot wallet derived from a [`MultisigInfo`]
#[derive(Debug, Clone)]
pub struct MultisigWallet {
    info: MultisigInfo,
    /// Leaf 0 is the multisig script, leaf 1 (optional) the recovery script
    tap_leaves: Vec<ScriptBuf>,
    spend_info: TaprootSpendInfo,
    pk_script: ScriptBuf,
}

impl MultisigWallet {
    /// Build the tap tree and output script
    pub fn build(info: &MultisigInfo) -> Result<Self, WalletError> {
        info.validate()?;
        let secp = Secp256k1::new();

        let mut tap_leaves = vec![build_multisig_script(info.required_sigs, &info.pub_keys)?];
        if let Some(recovery_key) = info.recovery() {
            tap_leaves.push(build_recovery_script(info.recovery_block_height, recovery_key));
        }

        let depth = if tap_leaves.len() > 1 { 1 } else { 0 };
        let mut builder = TaprootBuilder::new();
        for leaf in &tap_leaves {
            builder = builder
                .add_leaf(depth, leaf.clone())
                .map_err(|e| WalletError::Taproot(e.to_string()))?;
        }

        let spend_info = builder
            .finalize(&secp, default_internal_key()?)
            .map_err(|_| WalletError::Taproot("incomplete tap tree".to_string()))?;
        let pk_script = ScriptBuf::new_p2tr_tweaked(spend_info.output_key());

        tracing::debug!(
            required = info.required_sigs,
            total = info.pub_keys.len(),
            leaves = tap_leaves.len(),
            "Built multisig wallet"
        );

        Ok(Self {
            info: info.clone(),
            tap_leaves,
            spend_info,
            pk_script,
        })
    }

    pub fn info(&self) -> &MultisigInfo {
        &self.info
    }

    /// The k-of-n leaf used for every relayer spend
    pub fn multisig_script(&self) -> &ScriptBuf {
        &self.tap_leaves[0]
    }

    pub fn recovery_script(&self) -> Option<&ScriptBuf> {
        self.tap_leaves.get(1)
    }

    pub fn tap_leaves(&self) -> &[ScriptBuf] {
        &self.tap_leaves
    }

    pub fn leaf_hash(&self) -> TapLeafHash {
        TapLeafHash::from_script(self.multisig_script(), LeafVersion::TapScript)
    }

    /// P2TR output script of the wallet
    pub fn pk_script(&self) -> &ScriptBuf {
        &self.pk_script
    }

    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.spend_info.internal_key()
    }

    pub fn output_key(&self) -> TweakedPublicKey {
        self.spend_info.output_key()
    }

    pub fn spend_info(&self) -> &TaprootSpendInfo {
        &self.spend_info
    }

    /// Control block proving the multisig leaf
    pub fn control_block(&self) -> Result<ControlBlock, WalletError> {
        self.control_block_for(self.multisig_script())
    }

    /// Control block proving an arbitrary leaf of this wallet
    pub fn control_block_for(&self, leaf: &Script) -> Result<ControlBlock, WalletError> {
        self.spend_info
            .control_block(&(leaf.to_owned(), LeafVersion::TapScript))
            .ok_or_else(|| WalletError::Taproot("leaf not in tap tree".to_string()))
    }

    /// Bech32m address of the wallet on a given network
    pub fn address_on_chain(&self, network: Network) -> Address {
        Address::p2tr_tweaked(self.spend_info.output_key(), network)
    }

    /// Whether an output script belongs to this wallet
    pub fn owns(&self, script_pubkey: &Script) -> bool {
        script_pubkey == self.pk_script.as_script()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;

    fn keys(n: u8) -> Vec<PublicKey> {
        let secp = Secp256k1::new();
        (1..=n)
            .map(|i| PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[i; 32]).unwrap()))
            .collect()
    }

    fn info(k: usize, n: u8) -> MultisigInfo {
        MultisigInfo {
            pub_keys: keys(n),
            required_sigs: k,
            recovery_pub_key: None,
            recovery_block_height: 0,
        }
    }

    #[test]
    fn test_address_is_deterministic() {
        for n in 1..=16u8 {
            for k in 1..=n as usize {
                let a = MultisigWallet::build(&info(k, n)).unwrap();
                let b = MultisigWallet::build(&info(k, n)).unwrap();
                assert_eq!(
                    a.address_on_chain(Network::Testnet),
                    b.address_on_chain(Network::Testnet)
                );
                assert_eq!(a.pk_script(), b.pk_script());
            }
        }
    }

    #[test]
    fn test_policy_changes_address() {
        let base = MultisigWallet::build(&info(2, 3)).unwrap();
        let threshold = MultisigWallet::build(&info(3, 3)).unwrap();
        assert_ne!(base.pk_script(), threshold.pk_script());

        let mut reordered = info(2, 3);
        reordered.pub_keys.reverse();
        let reordered = MultisigWallet::build(&reordered).unwrap();
        assert_ne!(base.pk_script(), reordered.pk_script());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        assert!(matches!(
            MultisigWallet::build(&info(0, 3)),
            Err(WalletError::InvalidThreshold { .. })
        ));
        assert!(matches!(
            MultisigWallet::build(&info(4, 3)),
            Err(WalletError::InvalidThreshold { required: 4, total: 3 })
        ));
    }

    #[test]
    fn test_address_is_taproot() {
        let wallet = MultisigWallet::build(&info(2, 3)).unwrap();
        let address = wallet.address_on_chain(Network::Testnet).to_string();
        assert!(address.starts_with("tb1p"));
        assert!(wallet.pk_script().is_p2tr());
        assert!(wallet.owns(wallet.pk_script()));
    }

    #[test]
    fn test_control_blocks_commit_to_output_key() {
        let secp = Secp256k1::new();
        let mut with_recovery = info(2, 3);
        with_recovery.recovery_pub_key = Some(keys(4)[3]);
        with_recovery.recovery_block_height = 2_500_000;

        let wallet = MultisigWallet::build(&with_recovery).unwrap();
        assert_eq!(wallet.tap_leaves().len(), 2);

        let output_key = wallet.output_key().to_inner();
        let cb = wallet.control_block().unwrap();
        assert!(cb.verify_taproot_commitment(&secp, output_key, wallet.multisig_script()));

        let recovery = wallet.recovery_script().unwrap().clone();
        let cb = wallet.control_block_for(&recovery).unwrap();
        assert!(cb.verify_taproot_commitment(&secp, output_key, &recovery));

        let plain = MultisigWallet::build(&info(2, 3)).unwrap();
        assert_ne!(plain.pk_script(), wallet.pk_script());
    }

    #[test]
    fn test_recovery_leaf_needs_height() {
        let mut no_height = info(2, 3);
        no_height.recovery_pub_key = Some(keys(4)[3]);
        let wallet = MultisigWallet::build(&no_height).unwrap();
        assert!(wallet.recovery_script().is_none());
    }
}
