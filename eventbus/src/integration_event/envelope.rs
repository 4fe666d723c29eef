use super::IntegrationEvent;
use crate::error::{EventBusError, EventBusResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 事件信封：线上传输的统一格式
///
/// ```json
/// { "eventName": "...", "eventId": "uuid", "creationDate": "ISO-8601", "payload": { ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEventEnvelope {
    /// 事件名称（路由键）
    event_name: String,
    /// 事件唯一标识
    event_id: Uuid,
    /// 事件创建时间
    creation_date: DateTime<Utc>,
    /// 事件载荷
    payload: Value,
}

impl IntegrationEventEnvelope {
    pub fn new(
        event_name: impl Into<String>,
        event_id: Uuid,
        creation_date: DateTime<Utc>,
        payload: Value,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            event_id,
            creation_date,
            payload,
        }
    }

    /// 由具体事件构造信封
    pub fn from_event<E: IntegrationEvent>(event: &E) -> EventBusResult<Self> {
        Ok(Self {
            event_name: E::NAME.to_string(),
            event_id: event.id(),
            creation_date: event.creation_date(),
            payload: serde_json::to_value(event)?,
        })
    }

    /// 将载荷还原为具体事件，名称不一致时返回 `TypeMismatch`
    pub fn decode<E: IntegrationEvent>(&self) -> EventBusResult<E> {
        if self.event_name != E::NAME {
            return Err(EventBusError::TypeMismatch {
                event_name: self.event_name.clone(),
                expected: E::NAME.to_string(),
                found: self.event_name.clone(),
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn to_bytes(&self) -> EventBusResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> EventBusResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}
