//! 可自愈的代理连接
//!
//! - 连接/重连串行化：同一时刻只有一个物理连接尝试，其余调用方等待并复用结果；
//! - 连接失败按 `RetryPolicy` 指数退避，次数用尽后进入 `Faulted`；
//! - 连接建立后后台监听关闭事件，非主动关闭时自动重连一次完整的退避周期；
//! - `dispose` 之后不再重连。
//!
use crate::config::RetryPolicy;
use crate::error::{EventBusError, EventBusResult};
use crate::transport::{Channel, Connection, ShutdownReason, Transport};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 连接状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// 退避次数用尽仍未连上
    Faulted,
}

pub struct ResilientConnection {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    current: Mutex<Option<Arc<dyn Connection>>>,
    state: watch::Sender<ConnectionState>,
    disposed: CancellationToken,
}

impl ResilientConnection {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            transport,
            policy,
            current: Mutex::new(None),
            state,
            disposed: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(state = ?next, "connection state changed");
        }
    }

    /// 确保存在可用连接；已连接时立即返回 `true`
    pub async fn try_connect(self: &Arc<Self>) -> bool {
        if self.is_disposed() {
            return false;
        }

        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|c| c.is_open()) {
            return true;
        }

        self.set_state(ConnectionState::Connecting);
        let mut delays = self.policy.delays();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.transport.connect().await {
                Ok(connection) => {
                    info!(attempt, "connected to message broker");
                    *current = Some(connection.clone());
                    self.set_state(ConnectionState::Connected);
                    self.watch_shutdown(connection);
                    return true;
                }
                Err(err) => {
                    let Some(delay) = delays.next() else {
                        error!(attempt, error = %err, "could not connect to message broker, giving up");
                        break;
                    };
                    warn!(attempt, ?delay, error = %err, "connect failed, retrying");
                    tokio::select! {
                        _ = self.disposed.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        *current = None;
        self.set_state(if self.is_disposed() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Faulted
        });
        false
    }

    /// 在当前连接上开一个新信道，必要时先(重)连
    pub async fn create_channel(self: &Arc<Self>) -> EventBusResult<Arc<dyn Channel>> {
        if !self.try_connect().await {
            return Err(self.unavailable("could not connect to message broker"));
        }
        let connection = self
            .current
            .lock()
            .await
            .clone()
            .filter(|c| c.is_open())
            .ok_or_else(|| self.unavailable("connection closed while opening channel"))?;
        Ok(connection.create_channel().await?)
    }

    fn unavailable(&self, reason: &str) -> EventBusError {
        EventBusError::ConnectionUnavailable {
            attempts: self.policy.max_attempts,
            reason: reason.to_string(),
        }
    }

    /// 监听连接关闭；非主动关闭时触发一轮重连
    fn watch_shutdown(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        let this = Arc::downgrade(self);
        let disposed = self.disposed.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = disposed.cancelled() => return,
                reason = connection.closed() => reason,
            };
            let Some(this) = this.upgrade() else {
                return;
            };
            if reason == ShutdownReason::ClosedByApplication {
                return;
            }

            warn!(?reason, "broker connection shut down, trying to re-connect");
            {
                let mut current = this.current.lock().await;
                if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &connection)) {
                    *current = None;
                    this.set_state(ConnectionState::Disconnected);
                }
            }
            this.try_connect().await;
        });
    }

    /// 关闭连接并停止后续重连
    pub async fn dispose(&self) {
        self.disposed.cancel();
        if let Some(connection) = self.current.lock().await.take() {
            connection.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
        info!("broker connection disposed");
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::transport::InMemoryBroker;
    use std::time::Duration;
    use tokio::time::timeout;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .initial_delay(Duration::from_millis(5))
            .max_delay(Duration::from_millis(20))
            .build()
    }

    async fn wait_for_state(conn: &ResilientConnection, expected: ConnectionState) {
        let mut changes = conn.state_changes();
        timeout(Duration::from_secs(2), changes.wait_for(|s| *s == expected))
            .await
            .expect("state not reached in time")
            .unwrap();
    }

    #[tokio::test]
    async fn connects_once_and_reuses_connection() {
        let broker = InMemoryBroker::new();
        let conn = ResilientConnection::new(Arc::new(broker.clone()), fast_policy(3));

        assert!(conn.try_connect().await);
        assert!(conn.try_connect().await);
        conn.create_channel().await.unwrap();

        assert!(conn.is_connected());
        assert_eq!(broker.connection_attempts(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_attempt() {
        let broker = InMemoryBroker::new();
        let conn = ResilientConnection::new(Arc::new(broker.clone()), fast_policy(3));

        let (a, b) = tokio::join!(conn.try_connect(), conn.try_connect());
        assert!(a && b);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let conn = ResilientConnection::new(Arc::new(broker.clone()), fast_policy(3));

        assert!(!conn.try_connect().await);
        assert_eq!(conn.state(), ConnectionState::Faulted);
        assert_eq!(broker.connection_attempts(), 3);

        let err = conn.create_channel().await.err().unwrap();
        assert!(matches!(err, EventBusError::ConnectionUnavailable { .. }));
    }

    #[tokio::test]
    async fn recovers_once_broker_comes_back() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let conn = ResilientConnection::new(Arc::new(broker.clone()), fast_policy(50));

        let connecting = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.try_connect().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.set_available(true);

        assert!(connecting.await.unwrap());
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn reconnects_after_connection_loss() {
        let broker = InMemoryBroker::new();
        let conn = ResilientConnection::new(Arc::new(broker.clone()), fast_policy(50));
        assert!(conn.try_connect().await);

        broker.set_available(false);
        broker.disconnect_all();
        wait_for_state(&conn, ConnectionState::Connecting).await;

        broker.set_available(true);
        wait_for_state(&conn, ConnectionState::Connected).await;
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn dispose_stops_reconnecting() {
        let broker = InMemoryBroker::new();
        let conn = ResilientConnection::new(Arc::new(broker.clone()), fast_policy(3));
        assert!(conn.try_connect().await);

        conn.dispose().await;

        assert_eq!(broker.open_connections(), 0);
        assert!(!conn.try_connect().await);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(broker.connection_attempts(), 1);
    }
}
