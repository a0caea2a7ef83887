use super::{ChainBlockTime, ChainDataProvider, ChainError, ChainTransaction, ChainTxInput, ChainTxOutput};
use crate::retry::{try_each_with_backoff, BackoffConfig};
use async_trait::async_trait;
use bitcoin::{consensus::encode::serialize_hex, OutPoint, ScriptBuf, Transaction, Txid};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::{str::FromStr, time::Duration};

/// Confirmed history pages hold this many transactions; a shorter page is the last one.
const CHAIN_PAGE_SIZE: usize = 25;

/// Esplora-compatible HTTP chain data provider (blockstream.info, mempool.space, electrs).
#[derive(Debug, Clone)]
pub struct EsploraClient {
    base_urls: Vec<String>,
    client: Client,
    backoff: BackoffConfig,
}

#[derive(Debug, Deserialize)]
struct EsploraStatus {
    confirmed: bool,
    block_height: Option<u32>,
    block_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EsploraPrevout {
    scriptpubkey: String,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraVin {
    txid: String,
    vout: u32,
    prevout: Option<EsploraPrevout>,
}

#[derive(Debug, Deserialize)]
struct EsploraVout {
    scriptpubkey: String,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: String,
    vin: Vec<EsploraVin>,
    vout: Vec<EsploraVout>,
    weight: Option<u64>,
    fee: Option<u64>,
    status: EsploraStatus,
}

fn decode_err(what: &str, e: impl std::fmt::Display) -> ChainError {
    ChainError::Decode(format!("{what}: {e}"))
}

fn script_from_hex(s: &str) -> Result<ScriptBuf, ChainError> {
    ScriptBuf::from_hex(s).map_err(|e| decode_err("scriptpubkey", e))
}

impl TryFrom<EsploraTx> for ChainTransaction {
    type Error = ChainError;

    fn try_from(tx: EsploraTx) -> Result<Self, Self::Error> {
        let txid = Txid::from_str(&tx.txid).map_err(|e| decode_err("txid", e))?;
        let inputs = tx
            .vin
            .into_iter()
            .map(|vin| {
                let prev_txid = Txid::from_str(&vin.txid).map_err(|e| decode_err("vin txid", e))?;
                let prevout = vin
                    .prevout
                    .map(|p| {
                        Ok::<_, ChainError>(ChainTxOutput {
                            script_pubkey: script_from_hex(&p.scriptpubkey)?,
                            value_sats: p.value,
                        })
                    })
                    .transpose()?;
                Ok(ChainTxInput {
                    previous_output: OutPoint {
                        txid: prev_txid,
                        vout: vin.vout,
                    },
                    prevout,
                })
            })
            .collect::<Result<Vec<_>, ChainError>>()?;
        let outputs = tx
            .vout
            .into_iter()
            .map(|o| {
                Ok(ChainTxOutput {
                    script_pubkey: script_from_hex(&o.scriptpubkey)?,
                    value_sats: o.value,
                })
            })
            .collect::<Result<Vec<_>, ChainError>>()?;
        let confirmed = match (tx.status.confirmed, tx.status.block_height) {
            (true, Some(height)) => Some(ChainBlockTime {
                height,
                timestamp: tx.status.block_time.unwrap_or_default(),
            }),
            _ => None,
        };
        Ok(Self {
            txid,
            inputs,
            outputs,
            fee_sats: tx.fee,
            weight: tx.weight,
            confirmed,
        })
    }
}

/// Electrum-style script hash: SHA-256 of the script, byte-reversed, hex.
fn script_hash(script_pubkey: &ScriptBuf) -> String {
    let mut h = crate::crypto::sha256(script_pubkey.as_bytes());
    h.reverse();
    hex::encode(h)
}

fn map_send_err(e: &reqwest::Error) -> ChainError {
    if e.is_decode() {
        decode_err("body", e)
    } else {
        ChainError::Networking(e.to_string())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ChainError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(ChainError::Networking(format!("http {status}: {body}")))
    } else {
        Err(ChainError::Rejected(format!("http {status}: {body}")))
    }
}

impl EsploraClient {
    pub fn new(base_urls: &[String], timeout: Duration) -> eyre::Result<Self> {
        use eyre::Context as _;
        for u in base_urls {
            crate::config::ensure_https_or_loopback(u, "esplora_base_urls")?;
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            base_urls: base_urls
                .iter()
                .map(|u| u.trim().trim_end_matches('/').to_owned())
                .collect(),
            client,
            backoff: BackoffConfig::default(),
        })
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        base: &str,
        path: &str,
    ) -> Result<T, ChainError> {
        let resp = self
            .client
            .get(format!("{base}{path}"))
            .send()
            .await
            .map_err(|e| map_send_err(&e))?;
        check_status(resp)
            .await?
            .json::<T>()
            .await
            .map_err(|e| decode_err(path, e))
    }

    async fn history_from(&self, base: &str, hash: &str) -> Result<Vec<ChainTransaction>, ChainError> {
        let first: Vec<EsploraTx> = self.get_json(base, &format!("/scripthash/{hash}/txs")).await?;
        let mut confirmed_in_page = first.iter().filter(|t| t.status.confirmed).count();
        let mut out = first
            .into_iter()
            .map(ChainTransaction::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        while confirmed_in_page >= CHAIN_PAGE_SIZE {
            let Some(last) = out.iter().rev().find(|t| t.confirmed.is_some()).map(|t| t.txid) else {
                break;
            };
            let page: Vec<EsploraTx> = self
                .get_json(base, &format!("/scripthash/{hash}/txs/chain/{last}"))
                .await?;
            confirmed_in_page = page.len();
            for tx in page {
                out.push(ChainTransaction::try_from(tx)?);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ChainDataProvider for EsploraClient {
    async fn script_history(
        &self,
        script_pubkey: &ScriptBuf,
    ) -> Result<Vec<ChainTransaction>, ChainError> {
        let hash = script_hash(script_pubkey);
        let hash = hash.as_str();
        Ok(try_each_with_backoff(
            &self.base_urls,
            &self.backoff,
            |base| self.history_from(base, hash),
            ChainError::is_retryable,
        )
        .await?)
    }

    async fn tip_height(&self) -> Result<u32, ChainError> {
        Ok(try_each_with_backoff(
            &self.base_urls,
            &self.backoff,
            |base| async move {
                let resp = self
                    .client
                    .get(format!("{base}/blocks/tip/height"))
                    .send()
                    .await
                    .map_err(|e| map_send_err(&e))?;
                let text = check_status(resp)
                    .await?
                    .text()
                    .await
                    .map_err(|e| decode_err("tip height", e))?;
                text.trim()
                    .parse::<u32>()
                    .map_err(|e| decode_err("tip height", e))
            },
            ChainError::is_retryable,
        )
        .await?)
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        let body = serialize_hex(tx);
        let body = body.as_str();
        let txid = try_each_with_backoff(
            &self.base_urls,
            &self.backoff,
            |base| {
                let body = body.to_owned();
                async move {
                    let resp = self
                        .client
                        .post(format!("{base}/tx"))
                        .header("content-type", "text/plain")
                        .body(body)
                        .send()
                        .await
                        .map_err(|e| map_send_err(&e))?;
                    let text = check_status(resp)
                        .await?
                        .text()
                        .await
                        .map_err(|e| decode_err("broadcast", e))?;
                    Txid::from_str(text.trim()).map_err(|e| decode_err("broadcast txid", e))
                }
            },
            ChainError::is_retryable,
        )
        .await?;
        tracing::info!(%txid, "broadcast transaction");
        Ok(txid)
    }

    async fn fee_rate_sats_per_vb(&self, target_blocks: u16) -> Result<u64, ChainError> {
        let estimates: std::collections::BTreeMap<String, f64> = try_each_with_backoff(
            &self.base_urls,
            &self.backoff,
            |base| self.get_json(base, "/fee-estimates"),
            ChainError::is_retryable,
        )
        .await?;
        let target = u32::from(target_blocks.max(1));
        // Closest estimate at or above the requested target; falls back to the slowest one.
        let mut by_target: Vec<(u32, f64)> = estimates
            .iter()
            .filter_map(|(k, v)| k.parse::<u32>().ok().map(|t| (t, *v)))
            .collect();
        by_target.sort_by_key(|(t, _)| *t);
        let rate = by_target
            .iter()
            .find(|(t, _)| *t >= target)
            .or_else(|| by_target.last())
            .map(|(_, r)| *r)
            .ok_or_else(|| ChainError::Decode("empty fee estimates".to_owned()))?;
        Ok(clamp_fee_rate(rate))
    }
}

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "value is clamped to 1..=1000 before the cast"
)]
fn clamp_fee_rate(rate: f64) -> u64 {
    if rate.is_nan() {
        return 1;
    }
    rate.ceil().clamp(1.0_f64, 1_000.0_f64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_esplora_transaction_json() -> eyre::Result<()> {
        let raw = serde_json::json!({
            "txid": format!("{:064x}", 7),
            "vin": [{
                "txid": format!("{:064x}", 1),
                "vout": 1,
                "prevout": {"scriptpubkey": "0014aa", "value": 10_000}
            }],
            "vout": [{"scriptpubkey": "0020bb", "value": 9_000}],
            "weight": 561,
            "fee": 1_000,
            "status": {"confirmed": true, "block_height": 812, "block_time": 1_700_000_000}
        });
        let tx: EsploraTx = serde_json::from_value(raw)?;
        let tx = ChainTransaction::try_from(tx)?;
        assert_eq!(tx.fee_sats, Some(1_000));
        assert_eq!(tx.vsize(), Some(141));
        assert_eq!(tx.confirmed.map(|c| c.height), Some(812));
        assert_eq!(tx.inputs.len(), 1);
        Ok(())
    }

    #[test]
    fn unconfirmed_status_has_no_block_time() -> eyre::Result<()> {
        let raw = serde_json::json!({
            "txid": format!("{:064x}", 7),
            "vin": [],
            "vout": [],
            "status": {"confirmed": false}
        });
        let tx = ChainTransaction::try_from(serde_json::from_value::<EsploraTx>(raw)?)?;
        assert!(tx.confirmed.is_none());
        Ok(())
    }

    #[test]
    fn fee_rates_are_clamped() {
        assert_eq!(clamp_fee_rate(f64::NAN), 1);
        assert_eq!(clamp_fee_rate(0.2), 1);
        assert_eq!(clamp_fee_rate(4.1), 5);
        assert_eq!(clamp_fee_rate(50_000.0), 1_000);
    }

    #[test]
    fn rejects_plaintext_remote_endpoints() {
        let res = EsploraClient::new(&["http://esplora.example.com".to_owned()], Duration::from_secs(1));
        assert!(res.is_err());
    }
}
