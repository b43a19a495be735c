//! Mutating admission webhook routing vGPU pods to this scheduler

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::AdmissionRequest;
use kube::core::admission::AdmissionResponse;
use kube::core::admission::AdmissionReview;
use kube::core::admission::Operation;
use kube::core::DynamicObject;
use poem::handler;
use poem::web::Data;
use poem::web::Json;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::scheduling::SchedulingService;

/// Scheduler name written into admitted pods
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub scheduler_name: String,
}

#[handler]
pub async fn mutate(
    Json(review): Json<AdmissionReview<Pod>>,
    Data(service): Data<&Arc<SchedulingService>>,
    Data(config): Data<&Arc<WebhookConfig>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<Pod> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!("Malformed admission review: {e}");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(admit(&request, service, &config.scheduler_name).into_review())
}

fn admit(
    request: &AdmissionRequest<Pod>,
    service: &SchedulingService,
    scheduler_name: &str,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    if !matches!(request.operation, Operation::Create) {
        return response;
    }
    let Some(pod) = request.object.as_ref() else {
        return response;
    };
    if !service.parser().requests_vgpu(pod) {
        return response;
    }
    let current = pod.spec.as_ref().and_then(|spec| spec.scheduler_name.as_deref());
    if current == Some(scheduler_name) {
        debug!(pod = ?pod.metadata.name, "Pod already targets this scheduler");
        return response;
    }

    let patch = match serde_json::from_value::<json_patch::Patch>(json!([
        { "op": "add", "path": "/spec/schedulerName", "value": scheduler_name }
    ])) {
        Ok(patch) => patch,
        Err(e) => return AdmissionResponse::invalid(format!("failed to build patch: {e}")),
    };
    match response.with_patch(patch) {
        Ok(response) => {
            info!(
                pod = ?pod.metadata.name,
                namespace = ?request.namespace,
                scheduler = scheduler_name,
                "Routed vGPU pod to scheduler"
            );
            response
        }
        Err(e) => AdmissionResponse::invalid(format!("failed to serialize patch: {e}")),
    }
}
