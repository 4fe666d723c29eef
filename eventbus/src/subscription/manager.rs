use super::{EventTypeInfo, Subscription};
use crate::error::{EventBusError, EventBusResult};
use crate::handler::{DynamicIntegrationEventHandler, HandlerDescriptor, IntegrationEventHandler};
use crate::integration_event::IntegrationEvent;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::any::type_name;
use tokio::sync::broadcast;
use tracing::debug;

const CHANGE_CAPACITY: usize = 64;

/// 订阅表变化通知
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionChange {
    /// 事件名从无订阅变为有订阅
    EventAdded(String),
    /// 事件名的最后一个订阅被移除
    EventRemoved(String),
}

/// 单个事件名在某一时刻的一致视图
#[derive(Clone, Debug)]
pub(crate) struct EventRoute {
    pub(crate) event_type: Option<EventTypeInfo>,
    pub(crate) subscriptions: Vec<Subscription>,
}

/// 内存订阅管理器
///
/// 不变式：
/// - 表中不存在处理器列表为空的事件名；
/// - 同一事件名下同一处理器至多出现一次；
/// - 事件类型表只包含仍有强类型订阅的事件名。
///
/// 锁顺序固定为 `handlers` → `event_types`。
pub struct SubscriptionManager {
    handlers: DashMap<String, Vec<Subscription>>,
    event_types: DashMap<String, EventTypeInfo>,
    changes: broadcast::Sender<SubscriptionChange>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            handlers: DashMap::new(),
            event_types: DashMap::new(),
            changes,
        }
    }

    /// 登记强类型订阅，返回该事件名此前是否没有任何订阅
    pub fn add_subscription<E, H>(&self) -> EventBusResult<bool>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.insert(E::NAME, Some(EventTypeInfo::of::<E>()), Subscription::typed::<E, H>())
    }

    /// 登记动态订阅，返回该事件名此前是否没有任何订阅
    pub fn add_dynamic_subscription<H>(&self, event_name: &str) -> EventBusResult<bool>
    where
        H: DynamicIntegrationEventHandler,
    {
        self.insert(event_name, None, Subscription::dynamic::<H>(event_name))
    }

    fn insert(
        &self,
        event_name: &str,
        event_type: Option<EventTypeInfo>,
        subscription: Subscription,
    ) -> EventBusResult<bool> {
        let first = match self.handlers.entry(event_name.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry
                    .get()
                    .iter()
                    .any(|s| s.descriptor() == subscription.descriptor())
                {
                    return Err(EventBusError::AlreadySubscribed {
                        event_name: event_name.to_string(),
                        handler: subscription.descriptor().to_string(),
                    });
                }
                if let Some(info) = event_type {
                    self.register_type(event_name, info)?;
                }
                entry.get_mut().push(subscription);
                false
            }
            Entry::Vacant(entry) => {
                if let Some(info) = event_type {
                    self.register_type(event_name, info)?;
                }
                entry.insert(vec![subscription]);
                true
            }
        };

        debug!(event_name, first, "subscription added");
        if first {
            let _ = self
                .changes
                .send(SubscriptionChange::EventAdded(event_name.to_string()));
        }
        Ok(first)
    }

    fn register_type(&self, event_name: &str, info: EventTypeInfo) -> EventBusResult<()> {
        match self.event_types.entry(event_name.to_string()) {
            Entry::Occupied(existing) if existing.get().type_id() != info.type_id() => {
                Err(EventBusError::TypeMismatch {
                    event_name: event_name.to_string(),
                    expected: existing.get().type_name().to_string(),
                    found: info.type_name().to_string(),
                })
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(info);
                Ok(())
            }
        }
    }

    /// 移除一条订阅，返回该事件名是否已无任何订阅
    pub fn remove_subscription(
        &self,
        event_name: &str,
        descriptor: &HandlerDescriptor,
    ) -> EventBusResult<bool> {
        let not_found = || EventBusError::SubscriptionNotFound {
            event_name: event_name.to_string(),
            handler: descriptor.to_string(),
        };

        let Entry::Occupied(mut entry) = self.handlers.entry(event_name.to_string()) else {
            return Err(not_found());
        };
        let Some(index) = entry.get().iter().position(|s| s.descriptor() == descriptor) else {
            return Err(not_found());
        };
        entry.get_mut().remove(index);

        let emptied = entry.get().is_empty();
        // 持有处理器表条目时更新类型表
        if emptied {
            self.event_types.remove(event_name);
            entry.remove();
        } else if entry.get().iter().all(|s| s.descriptor().is_dynamic()) {
            self.event_types.remove(event_name);
        } else {
            drop(entry);
        }

        debug!(event_name, handler = %descriptor, emptied, "subscription removed");
        if emptied {
            let _ = self
                .changes
                .send(SubscriptionChange::EventRemoved(event_name.to_string()));
        }
        Ok(emptied)
    }

    /// 移除强类型订阅
    pub fn remove_typed_subscription<E, H>(&self) -> EventBusResult<bool>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.remove_subscription(E::NAME, &HandlerDescriptor::typed::<H>())
    }

    /// 移除动态订阅
    pub fn remove_dynamic_subscription<H>(&self, event_name: &str) -> EventBusResult<bool>
    where
        H: DynamicIntegrationEventHandler,
    {
        self.remove_subscription(event_name, &HandlerDescriptor::dynamic::<H>())
    }

    pub fn has_subscriptions_for_event(&self, event_name: &str) -> bool {
        self.handlers.contains_key(event_name)
    }

    /// 事件名当前的订阅快照（按登记顺序）；无订阅时为空
    pub fn get_handlers_for_event(&self, event_name: &str) -> Vec<Subscription> {
        self.handlers
            .get(event_name)
            .map(|subs| subs.value().clone())
            .unwrap_or_default()
    }

    pub fn get_event_type_by_name(&self, event_name: &str) -> EventBusResult<EventTypeInfo> {
        self.event_types
            .get(event_name)
            .map(|info| *info)
            .ok_or_else(|| EventBusError::UnknownEventType {
                event_name: event_name.to_string(),
            })
    }

    /// 同时读取处理器列表与事件类型，二者来自同一时刻
    pub(crate) fn route(&self, event_name: &str) -> EventBusResult<EventRoute> {
        let subscriptions =
            self.handlers
                .get(event_name)
                .ok_or_else(|| EventBusError::UnknownEventType {
                    event_name: event_name.to_string(),
                })?;
        let event_type = self.event_types.get(event_name).map(|info| *info);
        Ok(EventRoute {
            event_type,
            subscriptions: subscriptions.value().clone(),
        })
    }

    pub fn event_names(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// 清空所有订阅，并为每个事件名发出移除通知
    pub fn clear(&self) {
        let names = self.event_names();
        for name in &names {
            if let Entry::Occupied(entry) = self.handlers.entry(name.clone()) {
                self.event_types.remove(name);
                entry.remove();
                let _ = self
                    .changes
                    .send(SubscriptionChange::EventRemoved(name.clone()));
            }
        }
    }

    /// 订阅表变化的广播接收端
    pub fn changes(&self) -> broadcast::Receiver<SubscriptionChange> {
        self.changes.subscribe()
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("events", &self.event_names())
            .finish()
    }
}
