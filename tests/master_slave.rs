//! Master/slave signing over HTTP
//!
//! A master relayer routes withdrawals and refunds against two slave signer
//! servers running in-process. The chain is a fake indexer that records
//! broadcasts.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use btc_bridge_relay::codec::message::{ACTION_DEPOSIT, ACTION_WITHDRAW_TO};
use btc_bridge_relay::codec::xcall::{
    result_format, xcall_format, CsMessageResult, WithdrawOrder, CALL_MESSAGE, RESULT_FAILURE,
};
use btc_bridge_relay::codec::{
    amount_to_bytes, create_bridge_message_scripts, read_bridge_payload, BridgeDecodedMsg,
    RuneBalance, RuneId, XCallMessage, BTC_TOKEN_ID,
};
use btc_bridge_relay::indexer::{IndexedTx, Indexer, IndexerError, UtxoPage};
use btc_bridge_relay::provider::{deposit_sn, EventType};
use btc_bridge_relay::server::{create_router, AppState};
use btc_bridge_relay::storage::{KvStore, MemoryKvStore, SqliteKvStore};
use btc_bridge_relay::{
    BridgeConfig, BridgeError, BridgeProvider, BridgeStore, MultisigWallet, NodeMode,
    RelayMessage, SlaveClient, SpentUtxoCache, Utxo,
};

const RECEIVER: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";
const API_KEY: &str = "integration-key";
const CONNECTOR: &str = "cx577f5e756abd89cbcba38a58508b60a12754d2f5";

/// Chain with two funded multisig UTXOs that records broadcasts. Like a
/// lagging indexer it keeps listing both after they are spent.
struct FakeChain {
    utxos: Vec<Utxo>,
    broadcasts: Mutex<Vec<Transaction>>,
}

impl FakeChain {
    fn new(pk_script: ScriptBuf) -> Self {
        let utxo = |n: u8, vout: u32| Utxo {
            txid: Txid::from_byte_array([n; 32]),
            vout,
            amount: 300_000,
            pk_script: pk_script.clone(),
            is_relayers_multisig: true,
            runes: vec![],
        };
        Self {
            utxos: vec![utxo(9, 0), utxo(8, 1)],
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    fn broadcasts(&self) -> Vec<Transaction> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Indexer for FakeChain {
    async fn latest_height(&self) -> Result<u64, IndexerError> {
        Ok(100)
    }

    async fn txs_in_range(&self, _: &str, _: u64, _: u64) -> Result<Vec<IndexedTx>, IndexerError> {
        Ok(vec![])
    }

    async fn bitcoin_utxos(&self, _: &str, cursor: u64, _: u64) -> Result<UtxoPage, IndexerError> {
        if cursor > 0 {
            return Ok(UtxoPage::default());
        }
        Ok(UtxoPage {
            utxos: self.utxos.clone(),
            total: self.utxos.len() as u64,
        })
    }

    async fn rune_utxos(&self, _: &str, _: &RuneId, _: u64, _: u64) -> Result<UtxoPage, IndexerError> {
        Ok(UtxoPage::default())
    }

    async fn rune_balances(&self, _: &Txid, _: u32) -> Result<Vec<RuneBalance>, IndexerError> {
        Ok(vec![])
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, IndexerError> {
        self.broadcasts.lock().unwrap().push(tx.clone());
        Ok(tx.compute_txid())
    }
}

fn secret(i: u8) -> SecretKey {
    SecretKey::from_slice(&[i + 1; 32]).unwrap()
}

fn config(own: u8, mode: &str, slave_urls: &[String]) -> BridgeConfig {
    let secp = Secp256k1::new();
    let mut env: HashMap<&str, String> = HashMap::new();
    env.insert("BRIDGE_MODE", mode.to_string());
    env.insert(
        "BRIDGE_PUBKEYS",
        (0..3u8)
            .map(|i| PublicKey::from_secret_key(&secp, &secret(i)).to_string())
            .collect::<Vec<_>>()
            .join(","),
    );
    env.insert("BRIDGE_RELAYER_PRIVKEY", hex::encode(secret(own).secret_bytes()));
    env.insert("BRIDGE_SLAVE_SERVERS", slave_urls.join(","));
    env.insert("BRIDGE_API_KEY", API_KEY.to_string());
    env.insert("BRIDGE_CONNECTIONS", CONNECTOR.to_string());
    env.insert("BRIDGE_FEE_PER_OUTPUT", "1000".to_string());
    env.insert("BRIDGE_REQUEST_TIMEOUT_SECS", "5".to_string());
    BridgeConfig::from_lookup(|k| env.get(k).cloned()).unwrap()
}

fn node(config: &BridgeConfig, chain: Arc<FakeChain>) -> Arc<BridgeProvider> {
    node_with_store(config, chain, Arc::new(MemoryKvStore::new()))
}

fn node_with_store(
    config: &BridgeConfig,
    chain: Arc<FakeChain>,
    kv: Arc<dyn KvStore>,
) -> Arc<BridgeProvider> {
    let slaves = match config.mode {
        NodeMode::Master => Some(SlaveClient::from_config(config).unwrap()),
        NodeMode::Slave => None,
    };
    Arc::new(
        BridgeProvider::new(
            config,
            chain,
            BridgeStore::new(kv),
            Arc::new(SpentUtxoCache::new()),
            slaves,
        )
        .unwrap(),
    )
}

struct Bridge {
    chain: Arc<FakeChain>,
    master: Arc<BridgeProvider>,
    slaves: Vec<Arc<BridgeProvider>>,
    slave_urls: Vec<String>,
}

/// Master plus two slave servers on ephemeral ports
async fn start_bridge() -> Bridge {
    let template = config(1, "slave", &[]);
    let wallet = MultisigWallet::build(&template.multisig_info()).unwrap();
    let chain = Arc::new(FakeChain::new(wallet.pk_script().clone()));

    let mut slaves = Vec::new();
    let mut urls = Vec::new();
    for own in 1..=2u8 {
        let slave = node(&config(own, "slave", &[]), Arc::clone(&chain));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        urls.push(format!("http://{}", listener.local_addr().unwrap()));

        let app = create_router(Arc::new(AppState {
            provider: Arc::clone(&slave),
            api_key: API_KEY.to_string(),
        }));
        tokio::spawn(async move { axum::serve(listener, app).await });
        slaves.push(slave);
    }

    let master = node(&config(0, "master", &urls), Arc::clone(&chain));
    Bridge {
        chain,
        master,
        slaves,
        slave_urls: urls,
    }
}

fn withdrawal(sn: u64, amount: u128) -> (RelayMessage, WithdrawOrder) {
    let order = WithdrawOrder {
        action: ACTION_WITHDRAW_TO.to_string(),
        token_address: BTC_TOKEN_ID.to_string(),
        to: RECEIVER.to_string(),
        amount: amount_to_bytes(amount),
    };
    let message = RelayMessage {
        src: "0x2.icon".to_string(),
        dst: "0x2.btc".to_string(),
        sn,
        data: xcall_format(
            alloy_rlp::encode(&order),
            "0x2.icon/cxfc86ee7687e1bf681b5548b2667844485c0e7192".to_string(),
            format!("0x2.btc/{}", RECEIVER),
            u128::from(sn),
            vec![],
            CALL_MESSAGE,
        ),
        message_height: 55,
        event_type: EventType::EmitMessage,
    };
    (message, order)
}

#[tokio::test]
async fn test_withdrawal_signed_by_threshold_and_broadcast() {
    let bridge = start_bridge().await;
    let (message, order) = withdrawal(21, 120_000);
    for slave in &bridge.slaves {
        assert_eq!(slave.route(&message).await.unwrap(), None);
    }

    let txid = bridge.master.route(&message).await.unwrap().unwrap();

    let sent = bridge.chain.broadcasts();
    assert_eq!(sent.len(), 1);
    let tx = &sent[0];
    assert_eq!(tx.compute_txid(), txid);
    // Three signature slots, leaf script, control block; one slot empty
    let witness = tx.input[0].witness.to_vec();
    assert_eq!(witness.len(), 5);
    assert_eq!(witness[..3].iter().filter(|w| w.is_empty()).count(), 1);

    let receiver = Address::from_str(RECEIVER)
        .unwrap()
        .require_network(Network::Testnet)
        .unwrap()
        .script_pubkey();
    assert!(tx
        .output
        .iter()
        .any(|o| o.script_pubkey == receiver && o.value.to_sat() == 120_000));
    assert_eq!(read_bridge_payload(tx).unwrap(), alloy_rlp::encode(&order));

    // Every slave signed this txid; the master released their entries
    for slave in &bridge.slaves {
        assert!(slave.store().get_pending(21).await.unwrap().is_none());
    }
    assert!(bridge
        .master
        .spent()
        .is_spent(&OutPoint::new(Txid::from_byte_array([9; 32]), 0)));
}

#[tokio::test]
async fn test_one_slave_is_enough_for_two_of_three() {
    let bridge = start_bridge().await;
    let (message, _) = withdrawal(22, 80_000);
    bridge.slaves[1].route(&message).await.unwrap();

    assert!(bridge.master.route(&message).await.unwrap().is_some());
    assert_eq!(bridge.chain.broadcasts().len(), 1);
}

#[tokio::test]
async fn test_unseen_message_is_not_cosigned() {
    let bridge = start_bridge().await;
    let (message, _) = withdrawal(23, 80_000);

    let err = bridge.master.route(&message).await.unwrap_err();
    assert!(matches!(err, BridgeError::Signing(_)));
    assert!(bridge.chain.broadcasts().is_empty());
    assert!(bridge.master.spent().is_empty());
}

#[tokio::test]
async fn test_restarted_master_does_not_reuse_spent_inputs() {
    let bridge = start_bridge().await;
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("master.db");
    let master_config = config(0, "master", &bridge.slave_urls);

    let (first, _) = withdrawal(24, 50_000);
    let (second, _) = withdrawal(25, 60_000);
    for slave in &bridge.slaves {
        slave.route(&first).await.unwrap();
        slave.route(&second).await.unwrap();
    }

    // Each `route` runs in a fresh process sharing only the database
    let run = |message: RelayMessage| {
        let master_config = master_config.clone();
        let chain = Arc::clone(&bridge.chain);
        let db_path = db_path.clone();
        async move {
            let kv: Arc<dyn KvStore> = Arc::new(SqliteKvStore::new(&db_path).unwrap());
            let master = node_with_store(&master_config, chain, kv);
            assert_eq!(master.restore_spent().await.unwrap(), (message.sn - 24) as usize);
            master.route(&message).await.unwrap().unwrap()
        }
    };
    run(first).await;
    run(second).await;

    let sent = bridge.chain.broadcasts();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].input[0].previous_output, OutPoint::new(Txid::from_byte_array([9; 32]), 0));
    assert_eq!(sent[1].input[0].previous_output, OutPoint::new(Txid::from_byte_array([8; 32]), 1));
}

/// Deposit of `amount` sats from [`RECEIVER`] into the multisig
fn deposit(wallet_script: &ScriptBuf, amount: u64) -> IndexedTx {
    let msg = BridgeDecodedMsg {
        message: XCallMessage {
            message_type: 1,
            action: ACTION_DEPOSIT.to_string(),
            token_address: BTC_TOKEN_ID.to_string(),
            from: RECEIVER.to_string(),
            to: "0x2.icon/hx452e235f9f1fd1006b1941ed1ad19ef51d1192f6".to_string(),
            amount: amount_to_bytes(u128::from(amount)),
            data: vec![],
        },
        chain_id: 3,
        receiver: "cxfc86ee7687e1bf681b5548b2667844485c0e7192".to_string(),
        connectors: vec![CONNECTOR.to_string()],
    };
    let mut output = vec![TxOut {
        value: Amount::from_sat(amount),
        script_pubkey: wallet_script.clone(),
    }];
    output.extend(
        create_bridge_message_scripts(&msg)
            .unwrap()
            .into_iter()
            .map(|script_pubkey| TxOut {
                value: Amount::ZERO,
                script_pubkey,
            }),
    );
    IndexedTx {
        tx: Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([3; 32]), 1),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output,
        },
        height: 70,
        tx_index: 2,
    }
}

#[tokio::test]
async fn test_failed_call_refunds_the_depositor() {
    let bridge = start_bridge().await;
    let deposit = deposit(bridge.master.wallet().pk_script(), 40_000);

    // Every node observes the deposit on its own
    let relayed = bridge
        .master
        .parse_message_from_tx(&deposit)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relayed.sn, deposit_sn(70, 2));
    for slave in &bridge.slaves {
        assert!(slave.parse_message_from_tx(&deposit).await.unwrap().is_some());
    }

    let rollback = RelayMessage {
        src: "0x2.icon".to_string(),
        dst: "0x2.btc".to_string(),
        sn: 31,
        data: result_format(&CsMessageResult {
            sn: u128::from(relayed.sn),
            code: RESULT_FAILURE,
            message: vec![],
        }),
        message_height: 90,
        event_type: EventType::RollbackMessage,
    };
    for slave in &bridge.slaves {
        slave.route(&rollback).await.unwrap();
    }
    bridge.master.route(&rollback).await.unwrap().unwrap();

    let sent = bridge.chain.broadcasts();
    assert_eq!(sent.len(), 1);
    let refund = WithdrawOrder {
        action: ACTION_WITHDRAW_TO.to_string(),
        token_address: BTC_TOKEN_ID.to_string(),
        to: RECEIVER.to_string(),
        amount: amount_to_bytes(40_000),
    };
    assert_eq!(read_bridge_payload(&sent[0]).unwrap(), alloy_rlp::encode(&refund));

    // Every node recorded the refund, so replays pay nothing
    let refund_txid = sent[0].compute_txid().to_string();
    for node in std::iter::once(&bridge.master).chain(&bridge.slaves) {
        let record = node.store().require_deposit(relayed.sn).await.unwrap();
        assert_eq!(record.refund_txid.as_deref(), Some(refund_txid.as_str()));
        assert_eq!(node.route(&rollback).await.unwrap(), None);
    }
    let mut replay = rollback.clone();
    replay.sn = 32;
    assert_eq!(bridge.master.route(&replay).await.unwrap(), None);
    assert_eq!(bridge.chain.broadcasts().len(), 1);
    for slave in &bridge.slaves {
        assert!(slave.store().get_pending(31).await.unwrap().is_none());
        assert!(slave.store().get_pending(32).await.unwrap().is_none());
    }
}
