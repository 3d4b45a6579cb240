use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use serde::{Serialize, de::DeserializeOwned};
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

use crate::channel::gossip::GossipChannel;
use crate::channel::group::GroupChannel;

use super::engine::MapError;
use super::protocol::{
    GetResponse, MapMessage, MessageAck, PutRequest, PutResponse, StateResponse, StatusResponse,
};
use super::store::ReplicatedMap;

pub async fn handle_put<K, V>(
    Extension(map): Extension<Arc<ReplicatedMap<K, V>>>,
    Json(req): Json<PutRequest>,
) -> (StatusCode, Json<PutResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = match req.key.parse() {
        Ok(key) => key,
        Err(error) => {
            tracing::error!("Failed to parse key: {}", error);
            return (
                StatusCode::BAD_REQUEST,
                Json(PutResponse {
                    success: false,
                    error: Some(format!("bad key: {}", error)),
                }),
            );
        }
    };

    let value: V = match serde_json::from_str(&req.value_json) {
        Ok(value) => value,
        Err(error) => {
            tracing::error!("Failed to deserialize value: {}", error);
            return (
                StatusCode::BAD_REQUEST,
                Json(PutResponse {
                    success: false,
                    error: Some(format!("bad value: {}", error)),
                }),
            );
        }
    };

    match map.put(key, value).await {
        Ok(()) => (
            StatusCode::OK,
            Json(PutResponse {
                success: true,
                error: None,
            }),
        ),
        Err(error @ MapError::NotOwner { .. }) => (
            StatusCode::CONFLICT,
            Json(PutResponse {
                success: false,
                error: Some(error.to_string()),
            }),
        ),
        Err(error) => {
            tracing::error!("Failed to put: {}", error);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PutResponse {
                    success: false,
                    error: Some(error.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_get<K, V>(
    Extension(map): Extension<Arc<ReplicatedMap<K, V>>>,
    Path(key_str): Path<String>,
) -> (StatusCode, Json<GetResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = match key_str.parse() {
        Ok(key) => key,
        Err(error) => {
            tracing::error!("Failed to parse key: {}", error);
            return (
                StatusCode::BAD_REQUEST,
                Json(GetResponse { value_json: None }),
            );
        }
    };

    match map.get(&key) {
        Some(value) => match serde_json::to_string(&value) {
            Ok(value_json) => (
                StatusCode::OK,
                Json(GetResponse {
                    value_json: Some(value_json),
                }),
            ),
            Err(error) => {
                tracing::error!("Failed to serialize value: {}", error);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(GetResponse { value_json: None }),
                )
            }
        },
        None => (
            StatusCode::NOT_FOUND,
            Json(GetResponse { value_json: None }),
        ),
    }
}

pub async fn handle_remove<K, V>(
    Extension(map): Extension<Arc<ReplicatedMap<K, V>>>,
    Path(key_str): Path<String>,
) -> (StatusCode, Json<PutResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = match key_str.parse() {
        Ok(key) => key,
        Err(error) => {
            tracing::error!("Failed to parse key: {}", error);
            return (
                StatusCode::BAD_REQUEST,
                Json(PutResponse {
                    success: false,
                    error: Some(format!("bad key: {}", error)),
                }),
            );
        }
    };

    match map.remove(&key).await {
        Ok(_) => (
            StatusCode::OK,
            Json(PutResponse {
                success: true,
                error: None,
            }),
        ),
        Err(error @ MapError::NotOwner { .. }) => (
            StatusCode::CONFLICT,
            Json(PutResponse {
                success: false,
                error: Some(error.to_string()),
            }),
        ),
        Err(error) => {
            tracing::error!("Failed to remove: {}", error);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PutResponse {
                    success: false,
                    error: Some(error.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_status<K, V>(
    Extension(map): Extension<Arc<ReplicatedMap<K, V>>>,
    Extension(channel): Extension<Arc<GossipChannel>>,
) -> Json<StatusResponse>
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    Json(StatusResponse {
        node: channel.local_node(),
        live_members: channel.live_members(),
        entries: map.len(),
    })
}

/// Inbound replication traffic. An application error while applying the
/// message answers 500, which the sending side classifies as a
/// remote-processing fault rather than node death.
pub async fn handle_message(
    Extension(channel): Extension<Arc<GossipChannel>>,
    Json(message): Json<MapMessage>,
) -> (StatusCode, Json<MessageAck>) {
    let Some(listener) = channel.listener(&message.map_id) else {
        tracing::warn!("Message for unregistered map '{}'", message.map_id);
        return (StatusCode::NOT_FOUND, Json(MessageAck { success: false }));
    };

    match listener.on_message(message).await {
        Ok(()) => (StatusCode::OK, Json(MessageAck { success: true })),
        Err(error) => {
            tracing::error!("Failed to apply replication message: {}", error);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(MessageAck { success: false }),
            )
        }
    }
}

/// Full-state snapshot served to a joining node.
pub async fn handle_state(
    Extension(channel): Extension<Arc<GossipChannel>>,
    Path(map_id): Path<String>,
) -> (StatusCode, Json<StateResponse>) {
    match channel.listener(&map_id) {
        Some(listener) => (
            StatusCode::OK,
            Json(StateResponse {
                messages: listener.state_snapshot(),
                map_id,
            }),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(StateResponse {
                map_id,
                messages: Vec::new(),
            }),
        ),
    }
}
