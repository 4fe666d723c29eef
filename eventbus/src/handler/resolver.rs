//! 处理器解析
//!
//! 总线不负责构造处理器实例：每条消息开启一个解析作用域，
//! 由外部提供的 `HandlerResolver` 在作用域内给出可用实例。
//!
use super::HandlerType;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::sync::Arc;

/// 类型擦除后的处理器实例
pub type AnyHandler = Arc<dyn Any + Send + Sync>;

/// 处理器解析器：为单条消息的处理过程开启作用域
pub trait HandlerResolver: Send + Sync {
    fn begin_scope(&self) -> Arc<dyn HandlerScope>;
}

/// 单条消息处理期间的解析作用域
pub trait HandlerScope: Send + Sync {
    /// 解析处理器实例；未注册时返回 `None`
    fn resolve(&self, handler: &HandlerType) -> Option<AnyHandler>;
}

type HandlerFactory = Arc<dyn Fn() -> AnyHandler + Send + Sync>;

#[derive(Clone)]
enum Registration {
    /// 每个作用域新建一次
    Scoped(HandlerFactory),
    /// 全局共享同一实例
    Singleton(AnyHandler),
}

/// 基于内存的默认解析器
/// - 通过 TypeId 注册处理器工厂或单例
/// - 作用域内同一处理器只构造一次
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    registrations: Arc<DashMap<TypeId, Registration>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册作用域级处理器：每条消息都会调用 `factory` 构造新实例
    pub fn register_scoped<H, F>(&self, factory: F)
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: HandlerFactory = Arc::new(move || Arc::new(factory()) as AnyHandler);
        self.registrations
            .insert(TypeId::of::<H>(), Registration::Scoped(factory));
    }

    /// 注册单例处理器
    pub fn register_singleton<H>(&self, handler: Arc<H>)
    where
        H: Send + Sync + 'static,
    {
        self.registrations
            .insert(TypeId::of::<H>(), Registration::Singleton(handler));
    }

    pub fn is_registered<H: 'static>(&self) -> bool {
        self.registrations.contains_key(&TypeId::of::<H>())
    }
}

impl HandlerResolver for ServiceRegistry {
    fn begin_scope(&self) -> Arc<dyn HandlerScope> {
        Arc::new(RegistryScope {
            registrations: self.registrations.clone(),
            resolved: DashMap::new(),
        })
    }
}

struct RegistryScope {
    registrations: Arc<DashMap<TypeId, Registration>>,
    resolved: DashMap<TypeId, AnyHandler>,
}

impl HandlerScope for RegistryScope {
    fn resolve(&self, handler: &HandlerType) -> Option<AnyHandler> {
        let key = handler.type_id();
        if let Some(instance) = self.resolved.get(&key) {
            return Some(instance.clone());
        }

        // 先克隆出注册项再构造，避免持有分片锁调用外部工厂
        let registration = self.registrations.get(&key).map(|r| r.clone())?;
        let instance = match registration {
            Registration::Scoped(factory) => factory(),
            Registration::Singleton(instance) => instance,
        };
        self.resolved.insert(key, instance.clone());
        Some(instance)
    }
}
