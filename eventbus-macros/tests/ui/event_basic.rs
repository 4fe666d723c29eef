use eventbus::IntegrationEvent;
use eventbus_macros::integration_event;

#[integration_event(name = "UserCheckoutAccepted")]
pub struct UserCheckoutAccepted {
    pub user_id: String,
    pub basket_id: String,
    pub total_cents: i64,
}

fn main() {
    let event = UserCheckoutAccepted::new("u-1".into(), "b-1".into(), 1999);
    assert_eq!(UserCheckoutAccepted::NAME, "UserCheckoutAccepted");
    assert_eq!(event.event_name(), "UserCheckoutAccepted");
    let _ = event.id();
    let _ = event.creation_date();
}
