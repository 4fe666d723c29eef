use crate::handler::HandlerDescriptor;
use uuid::Uuid;

/// 消息最终的确认方式
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// 已确认（即使部分处理器失败）
    Acknowledged,
    /// 已处理但确认未送达（信道已断开），代理会重新投递
    Unconfirmed { reason: String },
    /// 已拒绝且不重新入队：未知事件名或无法解码
    Rejected { reason: String },
}

/// 单个处理器的执行结果
#[derive(Clone, Debug)]
pub struct HandlerOutcome {
    pub handler: HandlerDescriptor,
    pub error: Option<String>,
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// 一条消息的分发结果
#[derive(Clone, Debug)]
pub struct DispatchOutcome {
    pub event_name: String,
    /// 信封无法解码时为空
    pub event_id: Option<Uuid>,
    pub disposition: Disposition,
    pub handlers: Vec<HandlerOutcome>,
}

impl DispatchOutcome {
    pub fn is_acknowledged(&self) -> bool {
        self.disposition == Disposition::Acknowledged
    }

    pub fn failures(&self) -> impl Iterator<Item = &HandlerOutcome> {
        self.handlers.iter().filter(|h| !h.is_success())
    }
}
