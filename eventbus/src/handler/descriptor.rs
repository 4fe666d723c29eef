use std::any::{TypeId, type_name};
use std::fmt;

/// 处理器类型标识
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerType {
    type_id: TypeId,
    type_name: &'static str,
}

impl HandlerType {
    pub fn of<H: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<H>(),
            type_name: type_name::<H>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// 订阅表中的处理器描述
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerDescriptor {
    /// 处理已知具体事件类型
    Typed(HandlerType),
    /// 仅按事件名订阅，处理原始信封
    Dynamic(HandlerType),
}

impl HandlerDescriptor {
    pub fn typed<H: 'static>() -> Self {
        Self::Typed(HandlerType::of::<H>())
    }

    pub fn dynamic<H: 'static>() -> Self {
        Self::Dynamic(HandlerType::of::<H>())
    }

    pub fn handler_type(&self) -> &HandlerType {
        match self {
            Self::Typed(t) | Self::Dynamic(t) => t,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic(_))
    }
}

impl fmt::Display for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Typed(t) => f.write_str(t.type_name()),
            Self::Dynamic(t) => write!(f, "{} (dynamic)", t.type_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct A;
    struct B;

    #[test]
    fn descriptors_compare_by_kind_and_type() {
        assert_eq!(HandlerDescriptor::typed::<A>(), HandlerDescriptor::typed::<A>());
        assert_ne!(HandlerDescriptor::typed::<A>(), HandlerDescriptor::typed::<B>());
        assert_ne!(HandlerDescriptor::typed::<A>(), HandlerDescriptor::dynamic::<A>());
    }

    #[test]
    fn display_marks_dynamic_handlers() {
        let d = HandlerDescriptor::dynamic::<A>();
        assert!(d.is_dynamic());
        assert!(d.to_string().ends_with("A (dynamic)"));
    }
}
