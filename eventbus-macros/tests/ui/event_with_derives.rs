use eventbus_macros::integration_event;
use serde::{Deserialize, Serialize};

// 已有的派生与 serde 属性应被保留且不重复
#[integration_event(name = "order.paid")]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderPaid {
    order_id: String,
    paid_cents: u64,
}

fn main() {
    let event = OrderPaid::new("o-1".into(), 10);
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["orderId"], "o-1");
    assert!(json.get("creationDate").is_some());
}
