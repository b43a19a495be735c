//! kube-scheduler extender verbs

use std::sync::Arc;

use api_types::ExtenderArgs;
use api_types::ExtenderBindingArgs;
use api_types::ExtenderBindingResult;
use api_types::ExtenderFilterResult;
use api_types::ExtenderNodeList;
use api_types::HostPriorityList;
use poem::handler;
use poem::web::Data;
use poem::web::Json;
use tracing::info;
use tracing::warn;

use super::errors::scheduling_status;
use crate::inventory::PodIdentifier;
use crate::scheduling::SchedulingService;

/// Keeps the feasible nodes in the same shape the scheduler sent them.
#[handler]
pub async fn filter(
    Json(args): Json<ExtenderArgs>,
    Data(service): Data<&Arc<SchedulingService>>,
) -> Json<ExtenderFilterResult> {
    let Some(pod) = args.pod.as_ref() else {
        return Json(filter_error("extender args carry no pod"));
    };
    let Some(candidates) = args.candidate_names() else {
        return Json(filter_error("extender args carry no candidate nodes"));
    };

    let outcome = match service.filter(pod, &candidates) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(pod = ?pod.metadata.name, "Filter failed: {e:?}");
            return Json(filter_error(e.current_context().to_string()));
        }
    };

    let feasible: Vec<String> = outcome
        .report
        .feasible
        .iter()
        .map(|n| n.node.clone())
        .collect();
    let failed_nodes = outcome
        .report
        .infeasible
        .iter()
        .map(|(node, reason)| (node.clone(), reason.to_string()))
        .collect();

    let mut result = ExtenderFilterResult {
        failed_nodes,
        ..Default::default()
    };
    if args.node_names.is_some() {
        result.node_names = Some(feasible);
    } else if let Some(list) = &args.nodes {
        let items = feasible
            .iter()
            .filter_map(|name| {
                list.items
                    .iter()
                    .find(|node| node.metadata.name.as_deref() == Some(name.as_str()))
                    .cloned()
            })
            .collect();
        result.nodes = Some(ExtenderNodeList { items });
    }
    Json(result)
}

fn filter_error(message: impl Into<String>) -> ExtenderFilterResult {
    ExtenderFilterResult {
        error: message.into(),
        ..Default::default()
    }
}

#[handler]
pub async fn prioritize(
    Json(args): Json<ExtenderArgs>,
    Data(service): Data<&Arc<SchedulingService>>,
) -> poem::Result<Json<HostPriorityList>> {
    let pod = args.pod.as_ref().ok_or_else(|| {
        poem::Error::from_string(
            "extender args carry no pod",
            poem::http::StatusCode::BAD_REQUEST,
        )
    })?;
    let candidates = args.candidate_names().unwrap_or_default();

    service
        .prioritize(pod, &candidates)
        .map(Json)
        .map_err(|e| {
            warn!(pod = ?pod.metadata.name, "Prioritize failed: {e:?}");
            poem::Error::from_string(
                e.current_context().to_string(),
                scheduling_status(e.current_context()),
            )
        })
}

#[handler]
pub async fn bind(
    Json(args): Json<ExtenderBindingArgs>,
    Data(service): Data<&Arc<SchedulingService>>,
) -> Json<ExtenderBindingResult> {
    let pod = PodIdentifier::new(args.pod_namespace, args.pod_name);
    match service.bind(&pod, &args.pod_uid, &args.node).await {
        Ok(binding) => {
            info!(
                pod = %pod,
                node = %binding.node,
                attempt = binding.attempt,
                "Bind succeeded"
            );
            Json(ExtenderBindingResult::default())
        }
        Err(e) => {
            warn!(pod = %pod, node = %args.node, "Bind failed: {e:?}");
            Json(ExtenderBindingResult {
                error: e.current_context().to_string(),
            })
        }
    }
}
