use eventbus::IntegrationEvent;
use eventbus_macros::integration_event;

#[integration_event(name = "CatalogRefreshed")]
struct CatalogRefreshed;

fn main() {
    let event = CatalogRefreshed::new();
    assert_eq!(CatalogRefreshed::NAME, "CatalogRefreshed");
    assert_eq!(event.clone(), event);
}
