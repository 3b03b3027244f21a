//! Delivery matching rules.
//!
//! Given a bus event delivered under an SSE event-type label, decide whether
//! a connection receives it. Missing required payload fields drop the event
//! for that connection; they are never an error.

use cmp_types::{Event, EventFamily};

use crate::registry::SubscriptionState;

/// Should `event`, delivered under `label`, reach a connection with this
/// subscription state?
pub fn event_matches(event: &Event, label: &str, subscription: &SubscriptionState) -> bool {
    let family = EventFamily::of(label);

    // System-class events bypass every subscription check.
    if family == EventFamily::System {
        return true;
    }

    if !subscription.event_types.is_empty() && !subscription.event_types.contains(label) {
        return false;
    }

    match family {
        EventFamily::Vm => match event.data_str("vmId") {
            Some(vm_id) => subscription.vm_ids.contains(vm_id),
            None => false,
        },
        EventFamily::Provider => match event.data_str("provider") {
            Some(provider) => subscription.provider_ids.contains(provider),
            None => false,
        },
        EventFamily::Kubernetes | EventFamily::Network => {
            let filters = &subscription.filters;

            if !filters.providers.is_empty() {
                match event.data_str("provider") {
                    Some(provider) if filters.providers.contains(provider) => {}
                    _ => return false,
                }
            }

            if !filters.credential_ids.is_empty() {
                let credential = event
                    .data_str("credential_id")
                    .or_else(|| event.data_str("credentialId"));
                match credential {
                    Some(credential) if filters.credential_ids.contains(credential) => {}
                    _ => return false,
                }
            }

            if !filters.regions.is_empty() {
                match event.data_str("region") {
                    Some(region) if filters.regions.contains(region) => {}
                    _ => return false,
                }
            }

            true
        }
        EventFamily::System => unreachable!(),
        EventFamily::Other => true,
    }
}
