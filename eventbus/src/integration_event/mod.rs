//! 集成事件（integration event）
//!
//! - `IntegrationEvent`：事件载荷需满足的契约（显式名称、唯一标识、创建时间）；
//! - `IntegrationEventEnvelope`：线上传输的信封格式。
//!
mod envelope;
mod integration_event_trait;

pub use envelope::IntegrationEventEnvelope;
pub use integration_event_trait::IntegrationEvent;
