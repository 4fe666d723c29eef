use proc_macro::TokenStream;

mod integration_event;
mod utils;

/// 集成事件宏
/// - 仅支持具名字段结构体
/// - 追加私有字段：`id: Uuid`, `creation_date: DateTime<Utc>`，并置于字段最前
/// - 合并默认派生：`Debug, Clone, PartialEq, Serialize, Deserialize`
/// - 生成 `new(..)` 构造函数（按原字段顺序接收参数，构造时分配 id 与创建时间）
/// - 为目标结构体实现 `::eventbus::IntegrationEvent`
/// - 参数：`#[integration_event(name = "OrderCreated")]`，`name` 必填
#[proc_macro_attribute]
pub fn integration_event(attr: TokenStream, item: TokenStream) -> TokenStream {
    integration_event::expand(attr, item)
}
