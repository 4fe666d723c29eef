use crate::error::{EventBusError, EventBusResult};
use crate::handler::{
    DynamicIntegrationEventHandler, HandlerDescriptor, HandlerScope, IntegrationEventHandler,
};
use crate::integration_event::{IntegrationEvent, IntegrationEventEnvelope};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::sync::Arc;

/// 已解码的事件实例（类型擦除）
pub(crate) type DecodedEvent = Arc<dyn Any + Send + Sync>;

/// 单条消息交给处理器的输入
#[derive(Clone)]
pub(crate) struct DispatchInput {
    pub(crate) envelope: Arc<IntegrationEventEnvelope>,
    /// 事件名登记了具体类型时才有值
    pub(crate) event: Option<DecodedEvent>,
}

type InvokeFuture = BoxFuture<'static, EventBusResult<()>>;
type Invoker = Arc<dyn Fn(Arc<dyn HandlerScope>, DispatchInput) -> InvokeFuture + Send + Sync>;

/// 一条订阅：事件名 + 处理器描述
///
/// 内部保存了按具体类型单态化的调用入口，分发时无需再知道 `E`/`H`。
#[derive(Clone)]
pub struct Subscription {
    event_name: String,
    descriptor: HandlerDescriptor,
    invoker: Invoker,
}

impl Subscription {
    pub(crate) fn typed<E, H>() -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let descriptor = HandlerDescriptor::typed::<H>();
        let invoker: Invoker = Arc::new(
            move |scope: Arc<dyn HandlerScope>, input: DispatchInput| -> InvokeFuture {
                Box::pin(async move {
                    let handler = resolve::<H>(scope.as_ref(), &descriptor)?;
                    let event = input
                        .event
                        .and_then(|e| e.downcast::<E>().ok())
                        .ok_or_else(|| EventBusError::TypeMismatch {
                            event_name: E::NAME.to_string(),
                            expected: type_name::<E>().to_string(),
                            found: input.envelope.event_name().to_string(),
                        })?;
                    handler
                        .handle(&event)
                        .await
                        .map_err(|e| invocation_failed(E::NAME, &descriptor, e))
                })
            },
        );
        Self {
            event_name: E::NAME.to_string(),
            descriptor,
            invoker,
        }
    }

    pub(crate) fn dynamic<H>(event_name: &str) -> Self
    where
        H: DynamicIntegrationEventHandler,
    {
        let descriptor = HandlerDescriptor::dynamic::<H>();
        let invoker: Invoker = Arc::new(
            move |scope: Arc<dyn HandlerScope>, input: DispatchInput| -> InvokeFuture {
                Box::pin(async move {
                    let handler = resolve::<H>(scope.as_ref(), &descriptor)?;
                    handler
                        .handle(&input.envelope)
                        .await
                        .map_err(|e| {
                            invocation_failed(input.envelope.event_name(), &descriptor, e)
                        })
                })
            },
        );
        Self {
            event_name: event_name.to_string(),
            descriptor,
            invoker,
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn descriptor(&self) -> &HandlerDescriptor {
        &self.descriptor
    }

    /// 在给定作用域内调用处理器
    pub(crate) fn invoke(
        &self,
        scope: Arc<dyn HandlerScope>,
        input: DispatchInput,
    ) -> InvokeFuture {
        (self.invoker)(scope, input)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event_name", &self.event_name)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

fn resolve<H: Send + Sync + 'static>(
    scope: &dyn HandlerScope,
    descriptor: &HandlerDescriptor,
) -> EventBusResult<Arc<H>> {
    scope
        .resolve(descriptor.handler_type())
        .ok_or_else(|| EventBusError::HandlerNotRegistered {
            handler: descriptor.to_string(),
        })?
        .downcast::<H>()
        .map_err(|_| EventBusError::HandlerNotRegistered {
            handler: descriptor.to_string(),
        })
}

fn invocation_failed(
    event_name: &str,
    descriptor: &HandlerDescriptor,
    err: anyhow::Error,
) -> EventBusError {
    EventBusError::HandlerInvocationFailed {
        event_name: event_name.to_string(),
        handler: descriptor.to_string(),
        reason: format!("{err:#}"),
    }
}

fn decode_payload<E: IntegrationEvent>(payload: &Value) -> Result<DecodedEvent, serde_json::Error> {
    let event: E = serde_json::from_value(payload.clone())?;
    Ok(Arc::new(event))
}

/// 事件名对应的具体事件类型
#[derive(Clone, Copy, Debug)]
pub struct EventTypeInfo {
    name: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    decoder: fn(&Value) -> Result<DecodedEvent, serde_json::Error>,
}

impl EventTypeInfo {
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            name: E::NAME,
            type_id: TypeId::of::<E>(),
            type_name: type_name::<E>(),
            decoder: decode_payload::<E>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<E: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<E>()
    }

    /// 将信封载荷解码为具体事件
    pub(crate) fn decode(&self, payload: &Value) -> EventBusResult<DecodedEvent> {
        Ok((self.decoder)(payload)?)
    }
}
