use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use uuid::Uuid;

/// 集成事件需要满足的通用能力边界
///
/// 通常通过 `#[integration_event(name = "...")]` 宏生成实现，
/// 发布方与订阅方需在带外约定同一个 `NAME`。
pub trait IntegrationEvent:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// 事件名称，同时作为路由键
    const NAME: &'static str;

    /// 事件唯一标识（构造时分配，之后不可变）
    fn id(&self) -> Uuid;

    /// 事件创建时间（UTC）
    fn creation_date(&self) -> DateTime<Utc>;

    fn event_name(&self) -> &'static str {
        Self::NAME
    }
}
