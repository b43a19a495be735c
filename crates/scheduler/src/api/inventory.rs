//! Node agent endpoints: register, heartbeat, query, deregister

use std::sync::Arc;

use api_types::DeregisterResponse;
use api_types::HeartbeatRequest;
use api_types::HeartbeatResponse;
use api_types::InventoryResponse;
use api_types::QueryRequest;
use api_types::QueryResponse;
use api_types::RegisterRequest;
use api_types::RegisterResponse;
use error_stack::Report;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use poem::IntoResponse;
use poem::Response;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use super::errors::store_status;
use crate::inventory::InventoryService;
use crate::inventory::InventorySnapshot;
use crate::inventory::StoreError;

fn ok<T: Serialize + Send>(data: T, message: impl Into<String>) -> Response {
    Json(InventoryResponse::ok(data, message)).into_response()
}

fn failed(report: &Report<StoreError>) -> Response {
    let context = report.current_context();
    Json(InventoryResponse::<()>::failed(context.to_string()))
        .with_status(store_status(context))
        .into_response()
}

fn query_response(snapshot: InventorySnapshot) -> QueryResponse {
    QueryResponse {
        nodes: snapshot.nodes.values().map(|node| node.to_view()).collect(),
        missing: snapshot
            .missing
            .iter()
            .map(|(node, absence)| (node.clone(), absence.to_string()))
            .collect(),
    }
}

#[handler]
pub async fn register(
    Json(req): Json<RegisterRequest>,
    Data(inventory): Data<&Arc<InventoryService>>,
) -> Response {
    match inventory.register(&req.node, req.devices, req.policy) {
        Ok(outcome) => ok(
            RegisterResponse {
                node: req.node,
                generation: outcome.generation,
                released_reservations: outcome.released.len(),
            },
            "registered",
        ),
        Err(e) => {
            warn!(node = %req.node, "Registration rejected: {e:?}");
            failed(&e)
        }
    }
}

#[handler]
pub async fn heartbeat(
    Json(req): Json<HeartbeatRequest>,
    Data(inventory): Data<&Arc<InventoryService>>,
) -> Response {
    match inventory.heartbeat(&req.node) {
        Ok(generation) => ok(
            HeartbeatResponse {
                node: req.node,
                generation,
            },
            "ok",
        ),
        Err(e) => failed(&e),
    }
}

#[handler]
pub async fn query(
    Json(req): Json<QueryRequest>,
    Data(inventory): Data<&Arc<InventoryService>>,
) -> Response {
    ok(query_response(inventory.query(&req.nodes)), "ok")
}

#[handler]
pub async fn list_nodes(Data(inventory): Data<&Arc<InventoryService>>) -> Response {
    ok(query_response(inventory.query(&[])), "ok")
}

#[handler]
pub async fn deregister(
    Path(node): Path<String>,
    Data(inventory): Data<&Arc<InventoryService>>,
) -> Response {
    if inventory.store().node_absence(&node).is_some() {
        return Json(InventoryResponse::<()>::failed(format!(
            "Node {node} is not registered"
        )))
        .with_status(StatusCode::NOT_FOUND)
        .into_response();
    }
    let released = inventory.deregister(&node);
    info!(node = %node, released = released.len(), "Node deregistered");
    ok(
        DeregisterResponse {
            node,
            released_reservations: released.len(),
        },
        "deregistered",
    )
}
