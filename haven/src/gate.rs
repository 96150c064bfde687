use crate::ledger::LedgerOracle;
use crate::AppError;
use overlay_node::ArtifactId;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("no qualifying payment")]
    PaymentRequired,
    #[error("ledger oracle unavailable: {0:#}")]
    Unavailable(#[source] anyhow::Error),
}

impl From<GateError> for AppError {
    fn from(value: GateError) -> Self {
        match value {
            GateError::PaymentRequired => {
                AppError::PaymentRequired("Couldn't find payment".to_string())
            }
            GateError::Unavailable(e) => AppError::ServiceUnavailable(format!("{e:#}")),
        }
    }
}

/// Decides whether `requester` may read the private artifact `id` referenced
/// by ledger transaction `tx`.
///
/// The uploader always may. Anyone else needs a payment targeting `tx` that
/// covers the price in force at the payment's time: the most recent
/// set-price at or before the payment wins, and equal timestamps count.
pub async fn authorize_private_read(
    oracle: &dyn LedgerOracle,
    requester: &str,
    id: &ArtifactId,
    tx: &str,
) -> Result<(), GateError> {
    if requester == id.wallet {
        return Ok(());
    }

    let payments = oracle
        .payments(requester, tx)
        .await
        .map_err(GateError::Unavailable)?;
    let prices = oracle
        .prices(&id.wallet, &id.post_id)
        .await
        .map_err(GateError::Unavailable)?;

    for payment in &payments {
        let effective_price = prices
            .iter()
            .filter(|price| price.timestamp <= payment.timestamp)
            .max_by_key(|price| price.timestamp);

        match effective_price {
            Some(price) if payment.quantity >= price.price => return Ok(()),
            _ => continue,
        }
    }

    Err(GateError::PaymentRequired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::PaymentTx;
    use crate::ledger::PriceTx;
    use anyhow::bail;
    use anyhow::Result;
    use async_trait::async_trait;

    #[derive(Default)]
    struct FakeOracle {
        payments: Vec<PaymentTx>,
        prices: Vec<PriceTx>,
        unreachable: bool,
    }

    #[async_trait]
    impl LedgerOracle for FakeOracle {
        async fn payments(&self, _payer: &str, _target_tx: &str) -> Result<Vec<PaymentTx>> {
            if self.unreachable {
                bail!("gateway down");
            }
            Ok(self.payments.clone())
        }

        async fn prices(&self, _uploader: &str, _post_id: &str) -> Result<Vec<PriceTx>> {
            if self.unreachable {
                bail!("gateway down");
            }
            Ok(self.prices.clone())
        }

        async fn is_private(&self, _id: &ArtifactId, _tx: &str) -> Result<Option<bool>> {
            if self.unreachable {
                bail!("gateway down");
            }
            Ok(Some(true))
        }
    }

    fn id() -> ArtifactId {
        "uploader:post-1:5".parse().unwrap()
    }

    #[tokio::test]
    async fn the_uploader_reads_without_consulting_the_ledger() {
        let oracle = FakeOracle {
            unreachable: true,
            ..Default::default()
        };

        authorize_private_read(&oracle, "uploader", &id(), "tx-1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn a_covering_payment_after_the_price_grants() {
        let oracle = FakeOracle {
            payments: vec![PaymentTx {
                quantity: 100,
                timestamp: 20,
            }],
            prices: vec![PriceTx {
                price: 100,
                timestamp: 10,
            }],
            ..Default::default()
        };

        authorize_private_read(&oracle, "reader", &id(), "tx-1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn equal_timestamps_count() {
        let oracle = FakeOracle {
            payments: vec![PaymentTx {
                quantity: 100,
                timestamp: 10,
            }],
            prices: vec![PriceTx {
                price: 100,
                timestamp: 10,
            }],
            ..Default::default()
        };

        authorize_private_read(&oracle, "reader", &id(), "tx-1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn the_most_recent_price_before_the_payment_governs() {
        // The payment covers the old price but not the raise that preceded it.
        let oracle = FakeOracle {
            payments: vec![PaymentTx {
                quantity: 100,
                timestamp: 30,
            }],
            prices: vec![
                PriceTx {
                    price: 100,
                    timestamp: 10,
                },
                PriceTx {
                    price: 250,
                    timestamp: 20,
                },
            ],
            ..Default::default()
        };

        let result = authorize_private_read(&oracle, "reader", &id(), "tx-1").await;
        assert!(matches!(result, Err(GateError::PaymentRequired)));
    }

    #[tokio::test]
    async fn a_payment_before_any_price_does_not_count() {
        let oracle = FakeOracle {
            payments: vec![PaymentTx {
                quantity: 1_000,
                timestamp: 5,
            }],
            prices: vec![PriceTx {
                price: 100,
                timestamp: 10,
            }],
            ..Default::default()
        };

        let result = authorize_private_read(&oracle, "reader", &id(), "tx-1").await;
        assert!(matches!(result, Err(GateError::PaymentRequired)));
    }

    #[tokio::test]
    async fn no_payment_is_payment_required() {
        let oracle = FakeOracle {
            prices: vec![PriceTx {
                price: 100,
                timestamp: 10,
            }],
            ..Default::default()
        };

        let result = authorize_private_read(&oracle, "reader", &id(), "tx-1").await;
        assert!(matches!(result, Err(GateError::PaymentRequired)));
    }

    #[tokio::test]
    async fn oracle_failure_is_unavailable_not_denied() {
        let oracle = FakeOracle {
            unreachable: true,
            ..Default::default()
        };

        let result = authorize_private_read(&oracle, "reader", &id(), "tx-1").await;
        assert!(matches!(result, Err(GateError::Unavailable(_))));
    }
}
