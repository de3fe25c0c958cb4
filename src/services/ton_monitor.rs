//! TON chain monitor.
//!
//! Polls the shop wallet for incoming TON and USDT transfers and settles the
//! pending payments whose memo they carry. The same matching is used when a
//! buyer's client polls its own payment, so a payment is detected by
//! whichever path looks first; the reconciler makes the second look a no-op.

use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tokio::time::interval;

use crate::error::AppError;
use crate::models::payment::{Payment, PaymentMethod};
use crate::services::reconciler::{self, SettleOutcome, SettleRequest, SettlementSource};
use crate::services::ton_explorer::{Asset, IncomingTransfer, PageRequest};
use crate::state::AppState;

/// Transfers fetched per explorer request.
const PAGE_SIZE: u32 = 100;

/// Pages read per asset on one pass.
const MAX_PAGES: u32 = 20;

/// Slack between our clock and block time when bounding the listing.
const CLOCK_SKEW_SECS: i64 = 300;

/// How long after expiry a late transfer is still matched.
const LATE_FUNDS_WINDOW_HOURS: i64 = 24;

/// A transfer that pays a payment.
#[derive(Debug, Clone)]
pub struct Match<'a> {
    pub payment: &'a Payment,
    pub transfer: &'a IncomingTransfer,
}

/// Result of matching transfers against open payments.
#[derive(Debug, Default)]
pub struct MatchResult<'a> {
    pub matches: Vec<Match<'a>>,
    /// Right memo and asset, but less than expected
    pub underpaid: Vec<Match<'a>>,
}

fn asset_for(method: PaymentMethod) -> Option<Asset> {
    match method {
        PaymentMethod::Ton => Some(Asset::Ton),
        PaymentMethod::Usdt => Some(Asset::Usdt),
        PaymentMethod::Nowpayments => None,
    }
}

/// Pair transfers with payments by memo, asset and amount.
///
/// Each payment is matched at most once, by its oldest sufficient transfer.
pub fn match_transfers<'a>(
    open: &'a [Payment],
    transfers: &'a [IncomingTransfer],
) -> MatchResult<'a> {
    let by_memo: HashMap<&str, &Payment> = open.iter().map(|p| (p.memo.as_str(), p)).collect();

    let mut ordered: Vec<&IncomingTransfer> = transfers.iter().collect();
    ordered.sort_by_key(|t| t.utime);

    let mut result = MatchResult::default();
    let mut matched = HashSet::new();

    for transfer in ordered {
        let Some(comment) = transfer.comment.as_deref() else {
            continue;
        };
        let Some(payment) = by_memo.get(comment.trim()).copied() else {
            continue;
        };
        if asset_for(payment.method) != Some(transfer.asset) || matched.contains(&payment.id) {
            continue;
        }

        let candidate = Match { payment, transfer };
        if transfer.amount >= payment.expected_amount {
            matched.insert(payment.id);
            result.matches.push(candidate);
        } else {
            result.underpaid.push(candidate);
        }
    }

    result
}

/// Counters for one monitor pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub open: usize,
    pub settled: usize,
    pub underpaid: usize,
}

/// Fetch transfers for the assets the given payments need, paging back to
/// the oldest of them.
async fn fetch_transfers(
    state: &AppState,
    payments: &[Payment],
) -> Result<Vec<IncomingTransfer>, AppError> {
    let Some(wallet) = state.config.ton_wallet_address.as_deref() else {
        return Ok(Vec::new());
    };
    let Some(oldest) = payments.iter().map(|p| p.created_at).min() else {
        return Ok(Vec::new());
    };
    let since_utime = oldest.timestamp() - CLOCK_SKEW_SECS;

    let mut transfers = Vec::new();
    if payments.iter().any(|p| p.method == PaymentMethod::Ton) {
        transfers.extend(fetch_pages(state, wallet, None, since_utime).await?);
    }
    if payments.iter().any(|p| p.method == PaymentMethod::Usdt) {
        match state.config.usdt_jetton_master.as_deref() {
            Some(master) => {
                transfers.extend(fetch_pages(state, wallet, Some(master), since_utime).await?)
            }
            None => tracing::warn!("USDT payments are open but USDT_JETTON_MASTER is not set"),
        }
    }
    Ok(transfers)
}

/// Read TON transfers, or jetton transfers when `jetton_master` is given,
/// newer than `since_utime`.
async fn fetch_pages(
    state: &AppState,
    wallet: &str,
    jetton_master: Option<&str>,
    since_utime: i64,
) -> Result<Vec<IncomingTransfer>, AppError> {
    let mut transfers = Vec::new();
    for page_index in 0..MAX_PAGES {
        let page = PageRequest {
            since_utime,
            limit: PAGE_SIZE,
            offset: page_index * PAGE_SIZE,
        };
        let fetched = match jetton_master {
            Some(master) => state.explorer.incoming_jetton(wallet, master, page).await?,
            None => state.explorer.incoming_ton(wallet, page).await?,
        };
        transfers.extend(fetched.transfers);
        if !fetched.has_more {
            return Ok(transfers);
        }
    }

    tracing::warn!(
        fetched = transfers.len(),
        jetton = jetton_master.is_some(),
        "transfer backlog exceeds the page limit, oldest transfers not checked"
    );
    Ok(transfers)
}

/// Match and settle; shared by the monitor loop and client polling.
async fn settle_matches(
    state: &AppState,
    open: &[Payment],
    source: SettlementSource,
) -> Result<ScanSummary, AppError> {
    let transfers = fetch_transfers(state, open).await?;
    let result = match_transfers(open, &transfers);

    for m in &result.underpaid {
        tracing::warn!(
            payment_id = %m.payment.id,
            memo = %m.payment.memo,
            tx_hash = %m.transfer.tx_hash,
            received = m.transfer.amount,
            expected = m.payment.expected_amount,
            "underpaid transfer"
        );
    }

    let mut summary = ScanSummary {
        open: open.len(),
        settled: 0,
        underpaid: result.underpaid.len(),
    };

    for m in &result.matches {
        let request = SettleRequest {
            payment_id: m.payment.id,
            evidence: m.transfer.evidence(),
            source,
            provider_status: None,
        };
        match reconciler::settle(&state.pool, &state.access, request).await {
            Ok(SettleOutcome::Settled { .. }) => summary.settled += 1,
            Ok(SettleOutcome::AlreadySettled { .. }) => {}
            Err(e) => {
                tracing::error!(payment_id = %m.payment.id, error = %e, "failed to settle matched transfer");
            }
        }
    }

    Ok(summary)
}

/// One monitor pass over every open on-chain payment.
pub async fn scan_once(state: &AppState) -> Result<ScanSummary, AppError> {
    if !state.config.ton_enabled() {
        return Ok(ScanSummary::default());
    }

    let late_cutoff = Utc::now() - Duration::hours(LATE_FUNDS_WINDOW_HOURS);
    let open = sqlx::query_as::<_, Payment>(
        r#"
        SELECT * FROM payments
        WHERE method IN ('ton', 'usdt')
          AND (status = 'pending' OR (status = 'expired' AND expires_at > $1))
        "#,
    )
    .bind(late_cutoff)
    .fetch_all(&state.pool)
    .await?;

    if open.is_empty() {
        return Ok(ScanSummary::default());
    }

    settle_matches(state, &open, SettlementSource::TonMonitor).await
}

/// Check a single payment on demand (the buyer's client is polling it).
pub async fn check_payment(state: &AppState, payment: &Payment) -> Result<bool, AppError> {
    if !payment.method.is_on_chain() || !state.config.ton_enabled() {
        return Ok(false);
    }
    let summary = settle_matches(
        state,
        std::slice::from_ref(payment),
        SettlementSource::ClientPoll,
    )
    .await?;
    Ok(summary.settled > 0)
}

/// Poll forever until `shutdown` fires.
pub async fn run(state: AppState, mut shutdown: watch::Receiver<()>) {
    let mut ticker = interval(StdDuration::from_secs(state.config.ton_poll_interval_secs.max(5)));
    tracing::info!(
        interval_secs = state.config.ton_poll_interval_secs,
        "TON monitor started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match scan_once(&state).await {
                    Ok(summary) if summary.settled > 0 || summary.underpaid > 0 => {
                        tracing::info!(?summary, "TON monitor pass");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "TON monitor pass failed"),
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("TON monitor shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::models::payment::tests::pending_payment;
    use crate::services::telegram::tests::FakeTelegram;
    use crate::services::ton_explorer::tests::FakeExplorer;
    use crate::state::tests::test_state;
    use std::sync::Arc;

    fn transfer(hash: &str, asset: Asset, amount: i64, comment: Option<&str>, utime: i64) -> IncomingTransfer {
        IncomingTransfer {
            tx_hash: hash.to_string(),
            asset,
            amount,
            comment: comment.map(str::to_string),
            utime,
        }
    }

    #[test]
    fn matches_by_memo_asset_and_amount() {
        let open = vec![
            pending_payment(PaymentMethod::Ton, "sub-aaa", 1_000),
            pending_payment(PaymentMethod::Usdt, "sub-bbb", 5_000),
        ];
        let transfers = vec![
            transfer("t1", Asset::Ton, 1_000, Some(" sub-aaa\n"), 10),
            transfer("t2", Asset::Usdt, 6_000, Some("sub-bbb"), 11),
            transfer("t3", Asset::Ton, 9_999, Some("unrelated"), 12),
            transfer("t4", Asset::Ton, 9_999, None, 13),
        ];

        let result = match_transfers(&open, &transfers);
        let hashes: Vec<_> = result
            .matches
            .iter()
            .map(|m| (m.payment.memo.as_str(), m.transfer.tx_hash.as_str()))
            .collect();
        assert_eq!(hashes, vec![("sub-aaa", "t1"), ("sub-bbb", "t2")]);
        assert!(result.underpaid.is_empty());
    }

    #[test]
    fn wrong_asset_never_matches() {
        let open = vec![pending_payment(PaymentMethod::Usdt, "sub-ccc", 5_000)];
        let transfers = vec![transfer("t1", Asset::Ton, 5_000_000_000, Some("sub-ccc"), 1)];
        let result = match_transfers(&open, &transfers);
        assert!(result.matches.is_empty());
        assert!(result.underpaid.is_empty());
    }

    #[test]
    fn underpayment_is_reported_not_settled() {
        let open = vec![pending_payment(PaymentMethod::Ton, "sub-ddd", 1_000)];
        let transfers = vec![transfer("t1", Asset::Ton, 999, Some("sub-ddd"), 1)];
        let result = match_transfers(&open, &transfers);
        assert!(result.matches.is_empty());
        assert_eq!(result.underpaid.len(), 1);
    }

    #[test]
    fn oldest_sufficient_transfer_wins() {
        let open = vec![pending_payment(PaymentMethod::Ton, "sub-eee", 1_000)];
        let transfers = vec![
            transfer("newer", Asset::Ton, 1_000, Some("sub-eee"), 20),
            transfer("older", Asset::Ton, 1_000, Some("sub-eee"), 10),
        ];
        let result = match_transfers(&open, &transfers);
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].transfer.tx_hash, "older");
    }

    #[test]
    fn nowpayments_payments_are_not_chain_matched() {
        let open = vec![pending_payment(PaymentMethod::Nowpayments, "sub-fff", 100)];
        let transfers = vec![transfer("t1", Asset::Ton, 1_000, Some("sub-fff"), 1)];
        assert!(match_transfers(&open, &transfers).matches.is_empty());
    }

    #[tokio::test]
    async fn fetches_only_the_assets_open_payments_need() {
        let explorer = Arc::new(FakeExplorer {
            ton: vec![transfer("t1", Asset::Ton, 1, Some("x"), Utc::now().timestamp())],
            ..Default::default()
        });
        let state = test_state(test_config(), explorer.clone(), Arc::new(FakeTelegram::default()));

        let open = vec![pending_payment(PaymentMethod::Ton, "sub-aaa", 1_000)];
        let transfers = fetch_transfers(&state, &open).await.unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(*explorer.requests.lock().unwrap(), 1);

        let both = vec![
            pending_payment(PaymentMethod::Ton, "sub-bbb", 1_000),
            pending_payment(PaymentMethod::Usdt, "sub-ccc", 1_000),
        ];
        fetch_transfers(&state, &both).await.unwrap();
        assert_eq!(*explorer.requests.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn pages_back_through_a_burst_of_transfers() {
        let now = Utc::now().timestamp();
        let burst: Vec<_> = (0..250)
            .map(|i| transfer(&format!("t{i}"), Asset::Ton, 1, Some("noise"), now - i))
            .collect();
        let explorer = Arc::new(FakeExplorer {
            ton: burst,
            ..Default::default()
        });
        let state = test_state(test_config(), explorer.clone(), Arc::new(FakeTelegram::default()));

        let mut payment = pending_payment(PaymentMethod::Ton, "sub-aaa", 1_000);
        payment.created_at = Utc::now() - Duration::hours(1);
        let transfers = fetch_transfers(&state, &[payment]).await.unwrap();

        assert_eq!(transfers.len(), 250);
        assert_eq!(*explorer.requests.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn transfers_older_than_every_open_payment_are_not_fetched() {
        let now = Utc::now();
        let explorer = Arc::new(FakeExplorer {
            ton: vec![
                transfer("old", Asset::Ton, 1, Some("x"), (now - Duration::days(3)).timestamp()),
                transfer("new", Asset::Ton, 1, Some("x"), now.timestamp()),
            ],
            ..Default::default()
        });
        let state = test_state(test_config(), explorer, Arc::new(FakeTelegram::default()));

        let open = vec![pending_payment(PaymentMethod::Ton, "sub-aaa", 1_000)];
        let transfers = fetch_transfers(&state, &open).await.unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].tx_hash, "new");
    }

    #[tokio::test]
    async fn usdt_is_skipped_without_a_jetton_master() {
        let mut config = test_config();
        config.usdt_jetton_master = None;
        let explorer = Arc::new(FakeExplorer::default());
        let state = test_state(config, explorer.clone(), Arc::new(FakeTelegram::default()));

        let open = vec![pending_payment(PaymentMethod::Usdt, "sub-ddd", 1_000)];
        assert!(fetch_transfers(&state, &open).await.unwrap().is_empty());
        assert_eq!(*explorer.requests.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn client_poll_ignores_checkout_payments() {
        let explorer = Arc::new(FakeExplorer::default());
        let state = test_state(test_config(), explorer.clone(), Arc::new(FakeTelegram::default()));

        let payment = pending_payment(PaymentMethod::Nowpayments, "sub-eee", 1_000);
        assert!(!check_payment(&state, &payment).await.unwrap());
        assert_eq!(*explorer.requests.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn unmatched_transfers_settle_nothing() {
        let explorer = Arc::new(FakeExplorer {
            ton: vec![transfer("t1", Asset::Ton, 5_000, Some("someone-else"), 1)],
            ..Default::default()
        });
        let state = test_state(test_config(), explorer, Arc::new(FakeTelegram::default()));

        let payment = pending_payment(PaymentMethod::Ton, "sub-fff", 1_000);
        assert!(!check_payment(&state, &payment).await.unwrap());
    }
}
