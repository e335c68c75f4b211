//! UniSat Open API Client
//!
//! UTXO and rune data for the multisig address. Every response is wrapped
//! as `{ code, msg, data }` with `code == 0` on success.

use bitcoin::{ScriptBuf, Txid};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use super::{IndexerError, UtxoPage};
use crate::codec::{RuneBalance, RuneId};
use crate::tx::Utxo;

pub const MAINNET_URL: &str = "https://open-api.unisat.io";
pub const TESTNET_URL: &str = "https://open-api-testnet.unisat.io";

/// UniSat HTTP client
#[derive(Debug, Clone)]
pub struct UnisatClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnisatResponse<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UtxoList {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    utxo: Vec<UnisatUtxo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnisatUtxo {
    txid: String,
    vout: u32,
    satoshi: u64,
    script_pk: String,
    #[serde(default)]
    inscriptions: Vec<serde_json::Value>,
    #[serde(default)]
    runes: Vec<UnisatRune>,
}

#[derive(Debug, Deserialize)]
struct UnisatRune {
    runeid: String,
    /// Decimal string, runes exceed u64
    amount: String,
}

impl UnisatRune {
    fn to_balance(&self) -> Result<RuneBalance, IndexerError> {
        Ok(RuneBalance {
            rune_id: RuneId::from_str(&self.runeid)
                .map_err(|e| IndexerError::Parse(e.to_string()))?,
            amount: self
                .amount
                .parse()
                .map_err(|e| IndexerError::Parse(format!("rune amount {}: {}", self.amount, e)))?,
        })
    }
}

impl UnisatUtxo {
    fn into_utxo(self) -> Result<Utxo, IndexerError> {
        let runes = self
            .runes
            .iter()
            .map(UnisatRune::to_balance)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Utxo {
            txid: Txid::from_str(&self.txid).map_err(|e| IndexerError::Parse(e.to_string()))?,
            vout: self.vout,
            amount: self.satoshi,
            pk_script: ScriptBuf::from_hex(&self.script_pk)
                .map_err(|e| IndexerError::Parse(format!("scriptPk: {}", e)))?,
            is_relayers_multisig: true,
            runes,
        })
    }
}

impl UnisatClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, IndexerError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, IndexerError> {
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(IndexerError::Api {
                code: i64::from(resp.status().as_u16()),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        unwrap_response(resp.json().await?)
    }

    /// Spendable bitcoin UTXOs (no inscriptions or runes attached)
    pub async fn get_btc_utxos(
        &self,
        address: &str,
        cursor: u64,
        size: u64,
    ) -> Result<UtxoPage, IndexerError> {
        let url = format!(
            "{}/v1/indexer/address/{}/available-utxo-data?cursor={}&size={}",
            self.base_url, address, cursor, size
        );
        let list: UtxoList = self.get(&url).await?;

        let utxos = list
            .utxo
            .into_iter()
            .filter(|utxo| utxo.inscriptions.is_empty())
            .map(UnisatUtxo::into_utxo)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(UtxoPage {
            utxos,
            total: list.total,
        })
    }

    /// UTXOs holding `rune_id`
    pub async fn get_rune_utxos(
        &self,
        address: &str,
        rune_id: &RuneId,
        cursor: u64,
        size: u64,
    ) -> Result<UtxoPage, IndexerError> {
        let url = format!(
            "{}/v1/indexer/address/{}/runes/{}/utxo?start={}&limit={}",
            self.base_url, address, rune_id, cursor, size
        );
        let list: UtxoList = self.get(&url).await?;

        Ok(UtxoPage {
            utxos: list
                .utxo
                .into_iter()
                .map(UnisatUtxo::into_utxo)
                .collect::<Result<Vec<_>, _>>()?,
            total: list.total,
        })
    }

    /// Rune balances of one output
    pub async fn get_rune_balances(
        &self,
        txid: &Txid,
        vout: u32,
    ) -> Result<Vec<RuneBalance>, IndexerError> {
        let url = format!(
            "{}/v1/indexer/runes/utxo/{}/{}/balance",
            self.base_url, txid, vout
        );
        let runes: Vec<UnisatRune> = self.get(&url).await?;
        runes.iter().map(UnisatRune::to_balance).collect()
    }
}

fn unwrap_response<T>(resp: UnisatResponse<T>) -> Result<T, IndexerError> {
    if resp.code != 0 {
        return Err(IndexerError::Api {
            code: resp.code,
            message: resp.msg,
        });
    }
    resp.data
        .ok_or_else(|| IndexerError::Parse("response without data".to_string()))
}
