//! Domain events
//!
//! Units of work stage events while they run; the store publishes them on
//! the bus only after commit. Subscribers (settlement dispatcher, activity
//! notifier) run on their own tasks, so a slow or failing listener never
//! affects the transaction that produced the event.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::models::{AlertSeverity, AlertType, DisputeStatus, MarketStatus, Side};

/// Default bus capacity before slow subscribers start lagging
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Max entries kept in the activity log
pub const ACTIVITY_LOG_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    TradeExecuted {
        market_id: String,
        option_id: String,
        user_id: String,
        side: Side,
        /// Positive for buys, negative for sells
        quantity: i64,
        total: u64,
        fee: u64,
        at: DateTime<Utc>,
    },
    ResolutionSubmitted {
        market_id: String,
        option_id: String,
        submission_id: String,
        requires_approval: bool,
    },
    OptionResolved {
        market_id: String,
        option_id: String,
        winning_side: Side,
        resolved_by: String,
        at: DateTime<Utc>,
    },
    MarketStatusChanged {
        market_id: String,
        from: MarketStatus,
        to: MarketStatus,
    },
    DisputeFiled {
        dispute_id: String,
        market_id: String,
        option_id: String,
        user_id: String,
    },
    DisputeAdjudicated {
        dispute_id: String,
        market_id: String,
        status: DisputeStatus,
    },
    OptionSettled {
        market_id: String,
        option_id: String,
        winners: usize,
        total_payout: u64,
        skipped: usize,
    },
    LiquidityAlertRaised {
        market_id: String,
        alert_type: AlertType,
        severity: AlertSeverity,
        reserve_ratio: Decimal,
    },
    LiquidityAlertCleared {
        market_id: String,
        alert_type: AlertType,
    },
    WithdrawalRequested {
        withdrawal_id: String,
        user_id: String,
        amount: u64,
    },
    WithdrawalCompleted {
        withdrawal_id: String,
        transaction_id: String,
    },
    WithdrawalFailed {
        withdrawal_id: String,
        reason: String,
    },
}

impl DomainEvent {
    /// Short label used in activity lines
    pub fn action(&self) -> &'static str {
        match self {
            DomainEvent::TradeExecuted { .. } => "TRADE",
            DomainEvent::ResolutionSubmitted { .. } => "RESOLUTION_SUBMITTED",
            DomainEvent::OptionResolved { .. } => "OPTION_RESOLVED",
            DomainEvent::MarketStatusChanged { .. } => "MARKET_STATUS",
            DomainEvent::DisputeFiled { .. } => "DISPUTE_FILED",
            DomainEvent::DisputeAdjudicated { .. } => "DISPUTE_ADJUDICATED",
            DomainEvent::OptionSettled { .. } => "SETTLED",
            DomainEvent::LiquidityAlertRaised { .. } => "LIQUIDITY_ALERT",
            DomainEvent::LiquidityAlertCleared { .. } => "LIQUIDITY_OK",
            DomainEvent::WithdrawalRequested { .. } => "WITHDRAWAL_REQUESTED",
            DomainEvent::WithdrawalCompleted { .. } => "WITHDRAWAL_COMPLETED",
            DomainEvent::WithdrawalFailed { .. } => "WITHDRAWAL_FAILED",
        }
    }

    fn emoji(&self) -> &'static str {
        match self {
            DomainEvent::TradeExecuted { .. } => "🎯",
            DomainEvent::ResolutionSubmitted { .. } => "📝",
            DomainEvent::OptionResolved { .. } => "✅",
            DomainEvent::MarketStatusChanged { .. } => "📊",
            DomainEvent::DisputeFiled { .. } | DomainEvent::DisputeAdjudicated { .. } => "⚖️",
            DomainEvent::OptionSettled { .. } => "💰",
            DomainEvent::LiquidityAlertRaised { .. } => "🚨",
            DomainEvent::LiquidityAlertCleared { .. } => "🟢",
            DomainEvent::WithdrawalRequested { .. }
            | DomainEvent::WithdrawalCompleted { .. }
            | DomainEvent::WithdrawalFailed { .. } => "💸",
        }
    }

    pub fn details(&self) -> String {
        match self {
            DomainEvent::TradeExecuted { market_id, option_id, user_id, side, quantity, total, .. } => {
                format!("{} {} {} {} on {}/{} for {}", user_id, if *quantity > 0 { "bought" } else { "sold" },
                    quantity.unsigned_abs(), side, market_id, option_id, total)
            }
            DomainEvent::ResolutionSubmitted { market_id, option_id, submission_id, requires_approval } => {
                format!("{} for {}/{} (approval required: {})", submission_id, market_id, option_id, requires_approval)
            }
            DomainEvent::OptionResolved { market_id, option_id, winning_side, resolved_by, .. } => {
                format!("{}/{} resolved {} by {}", market_id, option_id, winning_side, resolved_by)
            }
            DomainEvent::MarketStatusChanged { market_id, from, to } => {
                format!("{} {} → {}", market_id, from, to)
            }
            DomainEvent::DisputeFiled { dispute_id, market_id, option_id, user_id } => {
                format!("{} by {} on {}/{}", dispute_id, user_id, market_id, option_id)
            }
            DomainEvent::DisputeAdjudicated { dispute_id, market_id, status } => {
                format!("{} on {} → {:?}", dispute_id, market_id, status)
            }
            DomainEvent::OptionSettled { market_id, option_id, winners, total_payout, skipped } => {
                format!("{}/{} paid {} to {} winners ({} skipped)", market_id, option_id, total_payout, winners, skipped)
            }
            DomainEvent::LiquidityAlertRaised { market_id, alert_type, severity, reserve_ratio } => {
                format!("{} {} {:?} at ratio {}", market_id, alert_type, severity, reserve_ratio)
            }
            DomainEvent::LiquidityAlertCleared { market_id, alert_type } => {
                format!("{} {} cleared", market_id, alert_type)
            }
            DomainEvent::WithdrawalRequested { withdrawal_id, user_id, amount } => {
                format!("{} {} for {}", withdrawal_id, amount, user_id)
            }
            DomainEvent::WithdrawalCompleted { withdrawal_id, transaction_id } => {
                format!("{} tx {}", withdrawal_id, transaction_id)
            }
            DomainEvent::WithdrawalFailed { withdrawal_id, reason } => {
                format!("{}: {}", withdrawal_id, reason)
            }
        }
    }
}

// ============================================================================
// EVENT BUS
// ============================================================================

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Fire and forget; having no subscribers is not an error
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}

// ============================================================================
// ACTIVITY LOG
// ============================================================================

/// Bounded, human-readable feed of recent activity
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    entries: Arc<Mutex<VecDeque<String>>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &DomainEvent) {
        let timestamp = Utc::now().format("%H:%M:%S");
        let entry = format!("[{}] {} {} | {}", timestamp, event.emoji(), event.action(), event.details());
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back(entry);
        while entries.len() > ACTIVITY_LOG_LIMIT {
            entries.pop_front();
        }
    }

    /// Newest last
    pub fn recent(&self, limit: usize) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }
}

/// Mirror every committed event into the activity log and the tracing output
pub fn spawn_notifier(bus: &EventBus, log: ActivityLog) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    tracing::info!(action = event.action(), "{}", event.details());
                    log.record(&event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "activity notifier lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn withdrawal_event(id: &str) -> DomainEvent {
        DomainEvent::WithdrawalRequested { withdrawal_id: id.to_string(), user_id: "alice".into(), amount: 5 }
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.publish(withdrawal_event("w1"));
    }

    #[test]
    fn test_activity_log_is_bounded() {
        let log = ActivityLog::new();
        for i in 0..(ACTIVITY_LOG_LIMIT + 5) {
            log.record(&withdrawal_event(&format!("w{}", i)));
        }
        let recent = log.recent(usize::MAX);
        assert_eq!(recent.len(), ACTIVITY_LOG_LIMIT);
        assert!(recent.last().unwrap().contains(&format!("w{}", ACTIVITY_LOG_LIMIT + 4)));
    }

    #[tokio::test]
    async fn test_notifier_records_events() {
        let bus = EventBus::default();
        let log = ActivityLog::new();
        let handle = spawn_notifier(&bus, log.clone());

        bus.publish(withdrawal_event("w42"));
        for _ in 0..50 {
            if !log.recent(1).is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(log.recent(1)[0].contains("WITHDRAWAL_REQUESTED"));
        handle.abort();
    }
}
