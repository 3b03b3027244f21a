//! Subscription control endpoints.
//!
//! Subscriptions are mutated over authenticated REST, never over the SSE
//! channel itself. Each endpoint locates the caller's active connection and
//! fails 404 when none is live.

use std::collections::HashSet;

use axum::extract::State;
use axum::Json;
use cmp_eventstore::FilterSets;
use cmp_types::EventFamily;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::auth::AuthUser;
use crate::errors::ApiError;
use crate::state::AppState;

/// Filter fragment accepted by `POST /subscribe`; merged into the
/// connection's existing sets.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterPayload {
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub credential_ids: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<String>,
}

impl From<FilterPayload> for FilterSets {
    fn from(payload: FilterPayload) -> Self {
        FilterSets {
            providers: payload.providers.into_iter().collect(),
            credential_ids: payload.credential_ids.into_iter().collect(),
            regions: payload.regions.into_iter().collect(),
            resource_types: payload.resource_types.into_iter().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub event_type: String,
    #[serde(default)]
    pub filters: Option<FilterPayload>,
    /// VM ids for VM-family delivery
    #[serde(default)]
    pub vm_ids: Vec<String>,
    /// Provider ids for provider-family delivery
    #[serde(default)]
    pub provider_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    pub event_type: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub client_id: String,
    pub event_type: String,
    pub subscribed: bool,
}

/// `POST /subscribe`: add an event type (and optional filters) to the
/// caller's active connection.
pub async fn subscribe(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<SubscribeRequest>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    if body.event_type.trim().is_empty() {
        return Err(ApiError::validation("event_type must not be empty"));
    }

    let connection = state
        .multiplexer
        .registry()
        .find_for_user(&user.user_id)
        .await
        .ok_or_else(|| ApiError::NoActiveConnection {
            user_id: user.user_id.clone(),
        })?;

    let event_type = body.event_type.trim().to_string();
    let filters: Option<FilterSets> = body.filters.map(Into::into);

    connection
        .mutate(|subscription| {
            subscription.event_types.insert(event_type.clone());
            subscription.vm_ids.extend(body.vm_ids.iter().cloned());
            subscription
                .provider_ids
                .extend(body.provider_ids.iter().cloned());
            if let Some(filters) = filters.clone() {
                subscription.filters.merge(filters);
            }
        })
        .await;

    debug!(
        connection_id = %connection.id,
        event_type = %event_type,
        "subscription added"
    );

    // Targeting sets and the mirror refresh happen off the request path.
    if let (Some(store), Some(filters)) = (state.multiplexer.store(), filters) {
        let resource_type = resource_type_of(&event_type);
        let store = store.clone();
        let connection_id = connection.id.clone();
        tokio::spawn(async move {
            let regions: HashSet<String> = if filters.regions.is_empty() {
                ["all".to_string()].into()
            } else {
                filters.regions
            };
            for credential_id in &filters.credential_ids {
                for region in &regions {
                    let _ = store
                        .track_subscription(&resource_type, credential_id, region, &connection_id)
                        .await;
                }
            }
        });
    }
    state.multiplexer.mirror(&connection);

    Ok(Json(SubscriptionResponse {
        client_id: connection.id.clone(),
        event_type,
        subscribed: true,
    }))
}

/// `POST /unsubscribe`: drop an event type from the caller's connection.
/// Removing a type that was never subscribed is a no-op success.
pub async fn unsubscribe(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<UnsubscribeRequest>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let connection = state
        .multiplexer
        .registry()
        .find_for_user(&user.user_id)
        .await
        .ok_or_else(|| ApiError::NoActiveConnection {
            user_id: user.user_id.clone(),
        })?;

    let event_type = body.event_type.trim().to_string();
    connection
        .mutate(|subscription| subscription.event_types.remove(&event_type))
        .await;
    state.multiplexer.mirror(&connection);

    Ok(Json(SubscriptionResponse {
        client_id: connection.id.clone(),
        event_type,
        subscribed: false,
    }))
}

/// `GET /connection`: the caller's live connection info.
pub async fn connection_info(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Value>, ApiError> {
    let connection = state
        .multiplexer
        .registry()
        .find_for_user(&user.user_id)
        .await
        .ok_or_else(|| ApiError::NoActiveConnection {
            user_id: user.user_id.clone(),
        })?;

    let subscription = connection.subscription().await;
    let mut subscribed_events: Vec<&String> = subscription.event_types.iter().collect();
    subscribed_events.sort();

    Ok(Json(json!({
        "connection_id": connection.id,
        "user_id": connection.user_id,
        "workspace_id": connection.workspace_id,
        "last_seen": connection.last_seen(),
        "subscribed_events": subscribed_events,
        "subscribed_vm_ids": subscription.vm_ids,
        "subscribed_provider_ids": subscription.provider_ids,
        "filters": {
            "providers": subscription.filters.providers,
            "credential_ids": subscription.filters.credential_ids,
            "regions": subscription.filters.regions,
            "resource_types": subscription.filters.resource_types,
        },
    })))
}

/// Resource class used for the Redis targeting sets.
fn resource_type_of(event_type: &str) -> String {
    match EventFamily::of(event_type) {
        EventFamily::Kubernetes => "kubernetes".to_string(),
        EventFamily::Network => "network".to_string(),
        EventFamily::Vm => "vm".to_string(),
        EventFamily::Provider => "provider".to_string(),
        EventFamily::System | EventFamily::Other => event_type
            .split(['.', '-'])
            .next()
            .unwrap_or("other")
            .to_string(),
    }
}
