use bitcoin::Txid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Pending,
    Confirmed {
        block_height: u32,
        block_time: DateTime<Utc>,
    },
}

impl ConfirmationStatus {
    pub const fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }

    pub const fn block_height(&self) -> Option<u32> {
        match self {
            Self::Pending => None,
            Self::Confirmed { block_height, .. } => Some(*block_height),
        }
    }

    /// Merge a fresh observation into a previous one without letting a confirmed
    /// transaction fall back to a lower height or to pending.
    #[must_use]
    pub fn merge(self, observed: Self) -> Self {
        match (self, observed) {
            (Self::Confirmed { block_height: prev, .. }, Self::Confirmed { block_height: next, .. })
                if next < prev =>
            {
                self
            }
            (Self::Confirmed { .. }, Self::Pending) => self,
            (_, observed) => observed,
        }
    }
}

/// A wallet transaction from this wallet's point of view.
///
/// `total` is what the wallet gained (incoming) or lost (outgoing). Outgoing transactions
/// satisfy `total == subtotal + fee`. Incoming ones carry no fee since the sender paid it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitcoinTransaction {
    pub id: Txid,
    pub recipient_address: Option<String>,
    /// When this wallet first saw the transaction.
    pub broadcast_time: Option<DateTime<Utc>>,
    pub confirmation_status: ConfirmationStatus,
    pub vsize: Option<u64>,
    pub fee_sats: Option<u64>,
    pub subtotal_sats: u64,
    pub total_sats: u64,
    pub incoming: bool,
}

impl BitcoinTransaction {
    /// `+total` for incoming, `-total` for outgoing.
    pub fn signed_total(&self) -> i64 {
        let total = i64::try_from(self.total_sats).unwrap_or(i64::MAX);
        if self.incoming {
            total
        } else {
            -total
        }
    }
}

/// Derived from the transaction set; never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitcoinBalance {
    pub immature: i64,
    pub trusted_pending: i64,
    pub untrusted_pending: i64,
    pub confirmed: i64,
    pub spendable: i64,
    pub total: i64,
}

impl BitcoinBalance {
    pub const ZERO: Self = Self {
        immature: 0,
        trusted_pending: 0,
        untrusted_pending: 0,
        confirmed: 0,
        spendable: 0,
        total: 0,
    };

    /// Fold over `txs`: confirmed and pending signed totals, `spendable = confirmed + pending`.
    pub fn from_transactions<'a>(txs: impl IntoIterator<Item = &'a BitcoinTransaction>) -> Self {
        let (confirmed, pending) = txs.into_iter().fold((0_i64, 0_i64), |(c, p), tx| {
            if tx.confirmation_status.is_confirmed() {
                (c.saturating_add(tx.signed_total()), p)
            } else {
                (c, p.saturating_add(tx.signed_total()))
            }
        });
        let spendable = confirmed.saturating_add(pending);
        Self {
            immature: 0,
            trusted_pending: pending,
            untrusted_pending: 0,
            confirmed,
            spendable,
            total: spendable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr as _;

    fn tx(n: u8, total: u64, incoming: bool, status: ConfirmationStatus) -> eyre::Result<BitcoinTransaction> {
        Ok(BitcoinTransaction {
            id: Txid::from_str(&format!("{n:064x}"))?,
            recipient_address: None,
            broadcast_time: None,
            confirmation_status: status,
            vsize: None,
            fee_sats: (!incoming).then_some(100),
            subtotal_sats: if incoming { total } else { total - 100 },
            total_sats: total,
            incoming,
        })
    }

    #[test]
    fn balance_is_confirmed_plus_pending_for_any_interleaving() -> eyre::Result<()> {
        let confirmed = ConfirmationStatus::Confirmed {
            block_height: 10,
            block_time: DateTime::<Utc>::UNIX_EPOCH,
        };
        let txs = vec![
            tx(1, 50_000, true, confirmed)?,
            tx(2, 10_100, false, ConfirmationStatus::Pending)?,
            tx(3, 7_000, true, ConfirmationStatus::Pending)?,
            tx(4, 1_100, false, confirmed)?,
        ];
        let b = BitcoinBalance::from_transactions(&txs);
        assert_eq!(b.confirmed, 48_900);
        assert_eq!(b.trusted_pending, -3_100);
        assert_eq!(b.spendable, b.confirmed + b.trusted_pending);
        assert_eq!(b.total, b.spendable);

        let reversed: Vec<_> = txs.iter().rev().cloned().collect();
        assert_eq!(BitcoinBalance::from_transactions(&reversed), b);
        Ok(())
    }

    #[test]
    fn confirmation_never_regresses() {
        let at = |h| ConfirmationStatus::Confirmed {
            block_height: h,
            block_time: DateTime::<Utc>::UNIX_EPOCH,
        };
        assert_eq!(at(10).merge(at(9)), at(10));
        assert_eq!(at(10).merge(ConfirmationStatus::Pending), at(10));
        assert_eq!(at(10).merge(at(11)), at(11));
        assert_eq!(ConfirmationStatus::Pending.merge(at(3)), at(3));
    }

    #[test]
    fn txids_serialize_as_display_hex() -> eyre::Result<()> {
        let t = tx(7, 1_000, true, ConfirmationStatus::Pending)?;
        let v = serde_json::to_value(&t)?;
        assert_eq!(v.get("id").and_then(|x| x.as_str()), Some(t.id.to_string().as_str()));
        let back: BitcoinTransaction = serde_json::from_value(v)?;
        assert_eq!(back, t);
        Ok(())
    }
}
