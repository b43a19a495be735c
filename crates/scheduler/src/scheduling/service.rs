//! Scheduling decision service: the extender `filter`, `prioritize` and `bind` verbs
//!
//! Filtering is a pure simulation; the request it parsed is cached per pod under
//! an attempt generation so `bind` does not need to fetch the pod again. Binding
//! reserves, annotates, binds and only then commits. Bind and release of the same
//! pod are serialized through a per-pod async lock.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use api_types::HostPriority;
use chrono::Utc;
use dashmap::DashMap;
use error_stack::bail;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use utils::keyed_lock::KeyedAsyncLock;

use super::binder::PodBinder;
use super::binder::PodLister;
use super::error::SchedulingError;
use crate::allocation::Allocation;
use crate::allocation::AllocationEngine;
use crate::allocation::AllocationError;
use crate::allocation::FeasibilityReport;
use crate::allocation::Request;
use crate::allocation::MAX_NODE_SCORE;
use crate::inventory::DeviceRecordStore;
use crate::inventory::NodeId;
use crate::inventory::PodIdentifier;
use crate::inventory::Reservation;
use crate::k8s::annotations::bind_annotations;
use crate::k8s::pod_request::PodRequestParser;
use crate::k8s::pod_request::RequestParseError;
use crate::k8s::PodEvent;

pub type SchedulingResult<T> = Result<T, Report<SchedulingError>>;

/// Highest score the kube-scheduler accepts from an extender
pub const MAX_EXTENDER_SCORE: i64 = 10;

/// How long a filtered request stays cached waiting for its `bind`
pub const ATTEMPT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct Attempt {
    generation: u64,
    uid: Option<String>,
    request: Request,
    started_at: Instant,
}

/// Outcome of a `filter` call
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    /// Attempt generation assigned to this filtering round
    pub attempt: u64,
    pub report: FeasibilityReport,
}

/// A committed pod-to-node assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodBinding {
    pub node: NodeId,
    /// UID of the pod instance that was bound; empty when the caller sent none
    pub uid: String,
    pub attempt: u64,
    pub allocation: Allocation,
    pub bound_at: Instant,
}

pub struct SchedulingService {
    engine: AllocationEngine,
    store: Arc<DeviceRecordStore>,
    parser: PodRequestParser,
    binder: Arc<dyn PodBinder>,
    pod_locks: KeyedAsyncLock<PodIdentifier>,
    attempts: DashMap<PodIdentifier, Attempt>,
    bindings: DashMap<PodIdentifier, PodBinding>,
    next_attempt: AtomicU64,
}

impl SchedulingService {
    pub fn new(
        engine: AllocationEngine,
        store: Arc<DeviceRecordStore>,
        parser: PodRequestParser,
        binder: Arc<dyn PodBinder>,
    ) -> Self {
        Self {
            engine,
            store,
            parser,
            binder,
            pod_locks: KeyedAsyncLock::new(),
            attempts: DashMap::new(),
            bindings: DashMap::new(),
            next_attempt: AtomicU64::new(1),
        }
    }

    pub fn parser(&self) -> &PodRequestParser {
        &self.parser
    }

    /// Committed assignment of `pod`, if any
    pub fn binding(&self, pod: &PodIdentifier) -> Option<PodBinding> {
        self.bindings.get(pod).map(|b| b.value().clone())
    }

    fn parse(&self, pod: &Pod) -> SchedulingResult<Request> {
        self.parser.parse(pod).map_err(bad_request)
    }

    /// Returns the nodes that can host `pod`, best first, with the reason every
    /// other candidate was rejected. Nothing is reserved.
    ///
    /// # Errors
    ///
    /// - [`SchedulingError::BadRequest`] if the pod's vGPU request cannot be parsed
    /// - [`SchedulingError::RequestUnsatisfiable`] if no device could ever hold a slice
    #[tracing::instrument(skip_all, fields(pod = ?pod.metadata.name, candidates = candidates.len()))]
    pub fn filter(&self, pod: &Pod, candidates: &[NodeId]) -> SchedulingResult<FilterOutcome> {
        self.expire_attempts(Instant::now());
        let request = self.parse(pod)?;
        let report = self
            .engine
            .feasible_nodes(&request, candidates)
            .map_err(from_allocation)?;

        let generation = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        debug!(
            pod = %request.pod,
            attempt = generation,
            feasible = report.feasible.len(),
            "Filtered candidates"
        );
        self.attempts.insert(
            request.pod.clone(),
            Attempt {
                generation,
                uid: pod.metadata.uid.clone(),
                request,
                started_at: Instant::now(),
            },
        );
        Ok(FilterOutcome {
            attempt: generation,
            report,
        })
    }

    /// Drops cached filter attempts older than [`ATTEMPT_TTL`] at `now`.
    pub fn expire_attempts(&self, now: Instant) -> usize {
        let before = self.attempts.len();
        self.attempts
            .retain(|_, attempt| now.saturating_duration_since(attempt.started_at) < ATTEMPT_TTL);
        let expired = before.saturating_sub(self.attempts.len());
        if expired > 0 {
            debug!(expired, "Expired filter attempts that were never bound");
        }
        expired
    }

    /// Scores every candidate on the extender scale `0..=10`; infeasible nodes get 0.
    pub fn prioritize(&self, pod: &Pod, candidates: &[NodeId]) -> SchedulingResult<Vec<HostPriority>> {
        let request = self.parse(pod)?;
        let report = self
            .engine
            .feasible_nodes(&request, candidates)
            .map_err(from_allocation)?;

        Ok(candidates
            .iter()
            .map(|host| {
                let score = report
                    .feasible
                    .iter()
                    .find(|n| &n.node == host)
                    .map_or(0, |n| n.score * MAX_EXTENDER_SCORE / MAX_NODE_SCORE);
                HostPriority {
                    host: host.clone(),
                    score,
                }
            })
            .collect())
    }

    /// Reserves devices for `pod` on `node`, annotates and binds the pod, then
    /// commits the reservations.
    ///
    /// # Errors
    ///
    /// - [`SchedulingError::Oversubscribed`] if the capacity seen while filtering is gone
    /// - [`SchedulingError::BindFailed`] if the pod could not be annotated or bound;
    ///   every reservation made by this call is released
    /// - [`SchedulingError::BadRequest`] if the pod is already bound elsewhere
    ///
    /// A pod recreated under the same name (different `uid`) is bound from scratch
    /// after the reservations of the previous instance are released.
    /// - [`SchedulingError::UnknownNode`] / [`SchedulingError::StaleNode`]
    #[tracing::instrument(skip(self, uid), fields(pod = %pod))]
    pub async fn bind(
        &self,
        pod: &PodIdentifier,
        uid: &str,
        node: &str,
    ) -> SchedulingResult<PodBinding> {
        let _guard = self.pod_locks.lock(pod).await;

        if let Some(existing) = self.binding(pod) {
            if !same_instance(&existing.uid, uid) {
                let released = self.release_binding(pod);
                info!(
                    previous_uid = %existing.uid,
                    released = released.len(),
                    "Pod was recreated, released the previous instance"
                );
            } else if existing.node == node {
                info!(attempt = existing.attempt, "Pod already bound to this node");
                return Ok(existing);
            } else {
                bail!(SchedulingError::BadRequest {
                    message: format!("pod {pod} is already bound to node {}", existing.node),
                });
            }
        }

        let (attempt, request) = self.request_for(pod, uid, node).await?;
        let allocation = self
            .engine
            .plan_and_reserve(&request, node)
            .map_err(from_allocation)?;

        if let Err(report) = self.publish(pod, uid, node, &allocation).await {
            for token in allocation.tokens() {
                self.store.release(token);
            }
            warn!(
                attempt = attempt,
                released = allocation.slices.len(),
                error = ?report,
                "Bind failed, reservations released"
            );
            return Err(report);
        }

        for token in allocation.tokens() {
            if let Err(e) = self.store.commit(token) {
                // the node went away between reserve and commit; the pod stays bound
                warn!(token = %token, error = %e, "Reservation vanished before commit");
            }
        }

        let binding = PodBinding {
            node: node.to_string(),
            uid: uid.to_string(),
            attempt,
            allocation,
            bound_at: Instant::now(),
        };
        self.bindings.insert(pod.clone(), binding.clone());
        self.attempts.remove(pod);
        info!(
            attempt = attempt,
            slices = binding.allocation.slices.len(),
            "Pod bound"
        );
        Ok(binding)
    }

    async fn request_for(
        &self,
        pod: &PodIdentifier,
        uid: &str,
        node: &str,
    ) -> SchedulingResult<(u64, Request)> {
        let cached = self.attempts.get(pod).and_then(|attempt| {
            let same_pod = same_instance(attempt.uid.as_deref().unwrap_or_default(), uid);
            same_pod.then(|| (attempt.generation, attempt.request.clone()))
        });
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let object = self
            .binder
            .get_pod(pod)
            .await
            .change_context(SchedulingError::BindFailed {
                pod: pod.to_string(),
                node: node.to_string(),
            })?;
        let request = self.parse(&object)?;
        let generation = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        debug!(attempt = generation, "No filtered attempt cached, parsed pod from API");
        Ok((generation, request))
    }

    async fn publish(
        &self,
        pod: &PodIdentifier,
        uid: &str,
        node: &str,
        allocation: &Allocation,
    ) -> SchedulingResult<()> {
        let failed = || SchedulingError::BindFailed {
            pod: pod.to_string(),
            node: node.to_string(),
        };
        let annotations = bind_annotations(node, &allocation.slices, Utc::now());
        self.binder
            .annotate(pod, annotations)
            .await
            .change_context_lazy(failed)?;
        self.binder
            .bind(pod, uid, node)
            .await
            .change_context_lazy(failed)?;
        Ok(())
    }

    /// Releases every reservation owned by `pod`. Calling it again is a no-op.
    #[tracing::instrument(skip(self), fields(pod = %pod))]
    pub async fn pod_deleted(&self, pod: &PodIdentifier) -> Vec<Reservation> {
        let _guard = self.pod_locks.lock(pod).await;
        self.forget(pod)
    }

    /// Like [`Self::pod_deleted`], but ignores events of an earlier instance when
    /// the name already belongs to a pod with a different `uid`.
    #[tracing::instrument(skip(self, uid), fields(pod = %pod))]
    pub async fn pod_released(&self, pod: &PodIdentifier, uid: Option<&str>) -> Vec<Reservation> {
        let _guard = self.pod_locks.lock(pod).await;
        let uid = uid.unwrap_or_default();
        let bound_uid = self.bindings.get(pod).map(|b| b.uid.clone());
        let attempt_uid = self
            .attempts
            .get(pod)
            .map(|a| a.uid.clone().unwrap_or_default());
        if let Some(current) = bound_uid.or(attempt_uid) {
            if !same_instance(&current, uid) {
                debug!(uid, current = %current, "Ignoring release of a previous pod instance");
                return Vec::new();
            }
        }
        self.forget(pod)
    }

    /// Must be called with the pod lock held.
    fn forget(&self, pod: &PodIdentifier) -> Vec<Reservation> {
        self.attempts.remove(pod);
        self.release_binding(pod)
    }

    /// Releases the committed binding of `pod` and anything else it still holds,
    /// keeping a cached filter attempt. Must be called with the pod lock held.
    fn release_binding(&self, pod: &PodIdentifier) -> Vec<Reservation> {
        let mut released: Vec<Reservation> = Vec::new();
        if let Some((_, binding)) = self.bindings.remove(pod) {
            released.extend(
                binding
                    .allocation
                    .tokens()
                    .into_iter()
                    .filter_map(|token| self.store.release(token)),
            );
        }
        released.extend(self.store.release_owned_by(pod));

        if !released.is_empty() {
            info!(pod = %pod, released = released.len(), "Released pod reservations");
        }
        released
    }

    /// Releases reservations whose owner is not in `live`.
    ///
    /// `listed_at` is when `live` was captured; pods bound or filtered after that
    /// instant may legitimately be missing from the list and are left alone.
    pub async fn reconcile(
        &self,
        live: &BTreeSet<PodIdentifier>,
        listed_at: Instant,
    ) -> Vec<PodIdentifier> {
        let mut owners = self.store.reservation_owners();
        owners.extend(self.bindings.iter().map(|entry| entry.key().clone()));

        let mut cleaned = Vec::new();
        for pod in owners.into_iter().filter(|pod| !live.contains(pod)) {
            let _guard = self.pod_locks.lock(&pod).await;
            if self
                .bindings
                .get(&pod)
                .is_some_and(|binding| binding.bound_at >= listed_at)
            {
                continue;
            }
            let released = self.forget(&pod);
            warn!(
                pod = %pod,
                released = released.len(),
                "Released reservations of a pod that no longer exists"
            );
            cleaned.push(pod);
        }

        self.attempts
            .retain(|pod, attempt| live.contains(pod) || attempt.started_at >= listed_at);
        cleaned
    }

    /// Applies pod lifecycle events until the channel closes or shutdown is requested.
    pub async fn process_pod_events(
        &self,
        mut events: mpsc::Receiver<PodEvent>,
        cancellation_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Pod event processor shutdown requested");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(PodEvent::Released { pod, uid, reason }) => {
                            debug!(pod = %pod, reason = %reason, "Pod released");
                            self.pod_released(&pod, uid.as_deref()).await;
                        }
                        None => {
                            info!("Pod event channel closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Periodically drops reservations of pods the cluster no longer knows about.
    pub async fn run_reconciler(
        &self,
        lister: Arc<dyn PodLister>,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Reconciler shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let listed_at = Instant::now();
                    match lister.live_pods().await {
                        Ok(live) => {
                            let cleaned = self.reconcile(&live, listed_at).await;
                            debug!(live = live.len(), cleaned = cleaned.len(), "Reconciliation pass finished");
                        }
                        Err(e) => warn!("Failed to list live pods: {e:?}"),
                    }
                }
            }
        }
    }
}

/// An empty UID on either side matches anything.
fn same_instance(known: &str, uid: &str) -> bool {
    known.is_empty() || uid.is_empty() || known == uid
}

fn bad_request(report: Report<RequestParseError>) -> Report<SchedulingError> {
    let message = report.current_context().to_string();
    report.change_context(SchedulingError::BadRequest { message })
}

fn from_allocation(report: Report<AllocationError>) -> Report<SchedulingError> {
    let context = SchedulingError::from(report.current_context());
    report.change_context(context)
}
