//! 下单确认事件及其处理器
//!
use async_trait::async_trait;
use eventbus::{IntegrationEvent, IntegrationEventHandler};
use eventbus_macros::integration_event;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// 购物车结算被接受，订单服务据此创建订单
#[integration_event(name = "UserCheckoutAcceptedIntegrationEvent")]
pub struct UserCheckoutAccepted {
    pub user_name: String,
    pub city: String,
    pub street: String,
    pub total_cents: i64,
}

/// 已接受的结算计数
#[derive(Debug, Default)]
pub struct CheckoutLedger {
    accepted: AtomicU64,
}

impl CheckoutLedger {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

pub struct UserCheckoutAcceptedHandler {
    ledger: Arc<CheckoutLedger>,
}

impl UserCheckoutAcceptedHandler {
    pub fn new(ledger: Arc<CheckoutLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl IntegrationEventHandler<UserCheckoutAccepted> for UserCheckoutAcceptedHandler {
    async fn handle(&self, event: &UserCheckoutAccepted) -> anyhow::Result<()> {
        anyhow::ensure!(event.total_cents >= 0, "negative checkout total");
        let accepted = self.ledger.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            event_id = %event.id(),
            user_name = %event.user_name,
            city = %event.city,
            total_cents = event.total_cents,
            accepted,
            "checkout accepted, creating order"
        );
        Ok(())
    }
}
