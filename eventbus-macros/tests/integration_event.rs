use eventbus::{IntegrationEvent, IntegrationEventEnvelope};
use eventbus_macros::integration_event;

#[integration_event(name = "OrderStarted")]
struct OrderStarted {
    order_id: String,
    items: Vec<String>,
}

#[test]
fn each_construction_assigns_a_fresh_identity() {
    let a = OrderStarted::new("o-1".into(), vec!["apple".into()]);
    let b = OrderStarted::new("o-1".into(), vec!["apple".into()]);

    assert_ne!(a.id(), b.id());
    assert!(a.creation_date() <= b.creation_date());
    assert_eq!(a.order_id, "o-1");
}

#[test]
fn identity_survives_serialization() {
    let event = OrderStarted::new("o-2".into(), vec![]);
    let json = serde_json::to_string(&event).unwrap();
    let back: OrderStarted = serde_json::from_str(&json).unwrap();

    assert_eq!(back, event);
    assert_eq!(back.id(), event.id());
}

#[test]
fn envelope_uses_declared_name() {
    let event = OrderStarted::new("o-3".into(), vec!["pear".into()]);
    let envelope = IntegrationEventEnvelope::from_event(&event).unwrap();

    assert_eq!(envelope.event_name(), "OrderStarted");
    assert_eq!(envelope.event_id(), event.id());
    assert_eq!(envelope.decode::<OrderStarted>().unwrap(), event);
}
