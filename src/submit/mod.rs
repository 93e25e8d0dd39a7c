//! Transaction submission with preflight, nonce sequencing, and bounded
//! retries.
//!
//! Policy per attempt, in order:
//! 1. balance preflight (value + gas x safety factor), with one faucet
//!    top-up-and-recheck cycle,
//! 2. simulation preflight: a reverting call is never submitted,
//! 3. submission with an explicit per-signer nonce,
//! 4. confirmation wait with its own timeout; a timeout reports `Pending`
//!    and the caller decides, never a blind resubmit,
//! 5. a confirmed-but-reverted receipt is decoded and surfaced.

pub mod faucet;

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use tokio::sync::Mutex;

use crate::config::SubmitterConfig;
use crate::error::{
    is_nonce_conflict, InsufficientFundsError, MarketError, NetworkError, RevertError,
};
use crate::gateway::{ConfirmationStatus, Ledger, LedgerCall, SubmitOptions, TxHandle, TxReceipt};
use crate::utils::backoff::retry_backoff_ms;

use faucet::FundingFaucet;

/// Terminal result of one `execute` attempt.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Confirmed(TxReceipt),
    /// Confirmation wait timed out. The transaction may still land; the
    /// handle lets the caller keep watching.
    Pending(TxHandle),
}

pub struct TransactionSubmitter {
    ledger: Arc<dyn Ledger>,
    identity: Address,
    faucet: Option<Arc<dyn FundingFaucet>>,
    cfg: SubmitterConfig,
    /// Cached next nonce for this signer. Never held across an await that
    /// re-enters the cache.
    nonce_cache: Mutex<Option<u64>>,
}

impl TransactionSubmitter {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        identity: Address,
        faucet: Option<Arc<dyn FundingFaucet>>,
        cfg: SubmitterConfig,
    ) -> Self {
        Self {
            ledger,
            identity,
            faucet,
            cfg,
            nonce_cache: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> Address {
        self.identity
    }

    /// Required balance for a call: value plus estimated gas cost scaled by
    /// the safety multiplier.
    fn required_balance(&self, value: U256, gas: u64, gas_price: u128) -> U256 {
        let gas_cost = U256::from(gas as u128).saturating_mul(U256::from(gas_price));
        let padded = gas_cost
            .saturating_mul(U256::from(self.cfg.gas_safety_bps))
            .checked_div(U256::from(10_000u64))
            .unwrap_or(gas_cost);
        value.saturating_add(padded)
    }

    async fn force_sync_nonce(&self) -> Result<u64, NetworkError> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.ledger.transaction_count(self.identity).await {
                Ok(n) => {
                    let mut cache = self.nonce_cache.lock().await;
                    *cache = Some(n);
                    return Ok(n);
                }
                Err(err) => {
                    if attempts >= 3 {
                        return Err(err);
                    }
                    tokio::time::sleep(tokio::time::Duration::from_millis(retry_backoff_ms(
                        attempts,
                    )))
                    .await;
                }
            }
        }
    }

    /// Step 1: funding preflight. Retries once after a faucet top-up, then
    /// fails permanently for this attempt.
    async fn check_balance(&self, call: &LedgerCall, value: U256) -> Result<u64, MarketError> {
        let gas = self
            .ledger
            .estimate_gas(self.identity, call, value)
            .await?;
        let gas_price = self.ledger.gas_price().await?;
        let required = self.required_balance(value, gas, gas_price);

        let available = self.ledger.balance_of(self.identity).await?;
        if available >= required {
            return Ok(gas);
        }

        let Some(faucet) = self.faucet.as_ref() else {
            tracing::warn!(
                "[SUBMIT] {:#x} short for {}: have {}, need {}, no faucet configured",
                self.identity,
                call.name(),
                available,
                required
            );
            return Err(InsufficientFundsError {
                required,
                available,
                topped_up: false,
            }
            .into());
        };

        tracing::info!(
            "[SUBMIT] {:#x} short for {}: have {}, need {}; requesting top-up",
            self.identity,
            call.name(),
            available,
            required
        );
        faucet.top_up(self.identity).await?;
        tokio::time::sleep(self.cfg.faucet_settle).await;

        // One re-check only; a faucet that cannot cover the call fails the
        // attempt permanently.
        let after = self.ledger.balance_of(self.identity).await?;
        if after >= required {
            crate::utils::audit::record(
                "submitter",
                "funding-recovered",
                Some(serde_json::json!({
                    "identity": format!("{:#x}", self.identity),
                    "call": call.name(),
                })),
            );
            return Ok(gas);
        }
        Err(InsufficientFundsError {
            required,
            available: after,
            topped_up: true,
        }
        .into())
    }

    /// Execute one call end to end. Transient network failures around
    /// submission retry with bounded backoff; simulation reverts are terminal
    /// for this attempt and surfaced to the caller.
    pub async fn execute(&self, call: &LedgerCall, value: U256) -> Result<SubmitOutcome, MarketError> {
        // 1. Funding.
        let gas_limit = self.check_balance(call, value).await?;

        // 2. Simulation preflight: the primary defense against burning gas
        //    on a call that cannot succeed.
        if let Err(err) = self.ledger.simulate(self.identity, call, value).await {
            match &err {
                MarketError::Revert(revert) => {
                    tracing::warn!(
                        "[SUBMIT] preflight rejected {} for {:#x}: {}",
                        call.name(),
                        self.identity,
                        revert
                    );
                    crate::utils::audit::record(
                        "submitter",
                        "preflight-reject",
                        Some(serde_json::json!({
                            "call": call.name(),
                            "reason": revert.reason.clone(),
                        })),
                    );
                }
                _ => {}
            }
            return Err(err);
        }

        // 3. Submission with explicit nonce, retrying transient failures.
        let handle = self.submit_with_retries(call, value, gas_limit).await?;

        // 4. Confirmation wait on its own clock.
        match self
            .ledger
            .wait_for_confirmation(&handle, self.cfg.confirmation_timeout)
            .await?
        {
            ConfirmationStatus::Confirmed(receipt) if receipt.success => {
                tracing::info!(
                    "[SUBMIT] {} confirmed for {:#x} in block {} (tx {:#x})",
                    call.name(),
                    self.identity,
                    receipt.block_number,
                    receipt.tx_hash
                );
                Ok(SubmitOutcome::Confirmed(receipt))
            }
            // 5. Confirmed but reverted: decode and surface, never swallow.
            ConfirmationStatus::Confirmed(receipt) => {
                let reason = match receipt.revert_reason.clone() {
                    Some(reason) => reason,
                    // Replay through simulation for a decoded reason.
                    None => match self.ledger.simulate(self.identity, call, value).await {
                        Err(MarketError::Revert(revert)) => revert.reason,
                        _ => "reverted without reason".to_string(),
                    },
                };
                tracing::error!(
                    "[SUBMIT] {} reverted on ledger for {:#x}: {} (tx {:#x})",
                    call.name(),
                    self.identity,
                    reason,
                    receipt.tx_hash
                );
                Err(RevertError::executed(reason).into())
            }
            ConfirmationStatus::Pending(handle) => {
                tracing::warn!(
                    "[SUBMIT] {} for {:#x} unconfirmed after {:?} (tx {:#x}); reporting pending",
                    call.name(),
                    self.identity,
                    self.cfg.confirmation_timeout,
                    handle.hash
                );
                Ok(SubmitOutcome::Pending(handle))
            }
        }
    }

    async fn submit_with_retries(
        &self,
        call: &LedgerCall,
        value: U256,
        gas_limit: u64,
    ) -> Result<TxHandle, MarketError> {
        let mut attempt: u32 = 0;
        loop {
            // Never hold the nonce mutex across an await that may re-enter it.
            let cached = { *self.nonce_cache.lock().await };
            let nonce = match cached {
                Some(nonce) => nonce,
                None => self.force_sync_nonce().await?,
            };

            let opts = SubmitOptions {
                value,
                nonce: Some(nonce),
                gas_limit: Some(gas_limit),
            };
            match self.ledger.submit(self.identity, call, opts).await {
                Ok(handle) => {
                    *self.nonce_cache.lock().await = Some(nonce + 1);
                    return Ok(handle);
                }
                Err(MarketError::Net(err)) => {
                    attempt += 1;
                    let message = err.to_string();
                    if is_nonce_conflict(&message) {
                        // Another submission from this signer landed first;
                        // resync and go again without burning an attempt.
                        tracing::debug!(
                            "[SUBMIT] nonce conflict for {:#x}, resyncing: {}",
                            self.identity,
                            message
                        );
                        *self.nonce_cache.lock().await = None;
                        if attempt <= self.cfg.submit_retry_attempts {
                            continue;
                        }
                    }
                    if !err.is_retryable() || attempt >= self.cfg.submit_retry_attempts {
                        return Err(MarketError::Net(err));
                    }
                    let wait = retry_backoff_ms(attempt);
                    tracing::debug!(
                        "[SUBMIT] transient submit failure for {} (attempt {}), retrying in {}ms: {}",
                        call.name(),
                        attempt,
                        wait,
                        message
                    );
                    tokio::time::sleep(tokio::time::Duration::from_millis(wait)).await;
                }
                // Simulation-stage reverts at submission (node-side preflight)
                // are terminal for this attempt.
                Err(other) => return Err(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sim::SimLedger;

    fn submitter(sim: &Arc<SimLedger>, identity: Address) -> TransactionSubmitter {
        TransactionSubmitter::new(
            sim.clone() as Arc<dyn Ledger>,
            identity,
            None,
            SubmitterConfig::default(),
        )
    }

    #[test]
    fn test_required_balance_applies_safety_margin() {
        let sim = Arc::new(SimLedger::default());
        let sub = submitter(&sim, Address::repeat_byte(0x01));
        // 100_000 gas at 1 gwei with 1.2x margin = 120_000 gwei.
        let required = sub.required_balance(U256::ZERO, 100_000, 1_000_000_000);
        assert_eq!(required, U256::from(120_000u128 * 1_000_000_000));
    }

    #[tokio::test]
    async fn test_insufficient_funds_without_faucet_is_permanent() {
        let sim = Arc::new(SimLedger::default());
        let identity = Address::repeat_byte(0x02);
        let sub = submitter(&sim, identity);
        let err = sub
            .execute(
                &LedgerCall::CommitTask {
                    commit_hash: alloy::primitives::B256::repeat_byte(0xcc),
                    market_id: 1,
                },
                U256::from(1_000u64),
            )
            .await
            .unwrap_err();
        match err {
            MarketError::Funding(funding) => assert!(!funding.topped_up),
            other => panic!("expected funding error, got {other:?}"),
        }
        assert_eq!(sim.submitted_call_count(), 0);
    }
}
