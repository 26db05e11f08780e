//! Pet identification: classify an uploaded image, look the winning label up
//! in two independent sources, and deliver the combined result to the
//! subscriber who uploaded it.
//!
//! Two orchestrations share the flow:
//!
//! - [`PET_IDENTIFICATION`] resolves the subscriber from the image while the
//!   image is being classified.
//! - [`PET_IDENTIFICATION_FOR_SUBSCRIBER`] is started with the subscriber id
//!   already known and skips resolution.
//!
//! Both wait for classification and identity together before the lookups
//! are scheduled. Nothing branches on identity alone.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::registry::{ActivityRegistryBuilder, OrchestrationRegistryBuilder};
use crate::{ActivityContext, ActivityFailure, OrchestrationContext, WorkflowFault, durable_info};

pub const PET_IDENTIFICATION: &str = "PetIdentification";
pub const PET_IDENTIFICATION_FOR_SUBSCRIBER: &str = "PetIdentificationForSubscriber";

/// Activity names the workflow schedules.
pub mod activities {
    pub const CLASSIFY_IMAGE: &str = "ClassifyImage";
    pub const RESOLVE_SUBSCRIBER: &str = "ResolveSubscriber";
    pub const LOOKUP_BREED_INFO: &str = "LookupBreedInfo";
    pub const LOOKUP_ADOPTION_CENTRES: &str = "LookupAdoptionCentres";
    pub const DELIVER: &str = "Deliver";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PetIdentificationInput {
    pub image_reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_id: Option<String>,
}

/// One candidate label from the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
}

/// Merged lookup results. The two lookups fill disjoint fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PetIdentificationCanonical {
    pub label: String,
    pub breed_information: Value,
    pub adoption_centres: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRequest {
    pub subscriber_id: String,
    /// JSON-encoded [`PetIdentificationCanonical`].
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PetIdentificationOutcome {
    pub subscriber_id: String,
    pub canonical: PetIdentificationCanonical,
    pub ack: String,
}

/// Pick the candidate with the highest confidence. Ties go to the candidate
/// listed first and NaN never wins.
pub fn select_highest_confidence(predictions: &[Prediction]) -> Result<&Prediction, WorkflowFault> {
    let key = |p: &Prediction| if p.confidence.is_nan() { f64::NEG_INFINITY } else { p.confidence };
    let mut iter = predictions.iter();
    let first = iter
        .next()
        .ok_or_else(|| WorkflowFault::invalid_state("classification returned no candidates"))?;
    Ok(iter.fold(first, |best, p| if key(p) > key(best) { p } else { best }))
}

/// Event-driven variant: classification and subscriber resolution fan out
/// from the image reference.
pub async fn pet_identification(
    ctx: OrchestrationContext,
    input: PetIdentificationInput,
) -> Result<PetIdentificationOutcome, WorkflowFault> {
    durable_info!(ctx, image = %input.image_reference, "pet identification started");

    let classify = ctx
        .schedule_activity_typed(activities::CLASSIFY_IMAGE, &input.image_reference)?
        .into_activity_typed::<Vec<Prediction>>();
    let resolve = ctx
        .schedule_activity_typed(activities::RESOLVE_SUBSCRIBER, &input.image_reference)?
        .into_activity_typed::<String>();
    let (predictions, subscriber_id) = join(classify, resolve).await;

    look_up_and_deliver(&ctx, predictions?, subscriber_id?).await
}

/// Form-driven variant: the subscriber is part of the input.
pub async fn pet_identification_for_subscriber(
    ctx: OrchestrationContext,
    input: PetIdentificationInput,
) -> Result<PetIdentificationOutcome, WorkflowFault> {
    let subscriber_id = input
        .subscriber_id
        .ok_or_else(|| WorkflowFault::invalid_state("subscriberId is required"))?;
    durable_info!(ctx, image = %input.image_reference, subscriber = %subscriber_id, "pet identification started");

    let predictions = ctx
        .schedule_activity_typed(activities::CLASSIFY_IMAGE, &input.image_reference)?
        .into_activity_typed::<Vec<Prediction>>()
        .await?;

    look_up_and_deliver(&ctx, predictions, subscriber_id).await
}

async fn look_up_and_deliver(
    ctx: &OrchestrationContext,
    predictions: Vec<Prediction>,
    subscriber_id: String,
) -> Result<PetIdentificationOutcome, WorkflowFault> {
    let label = select_highest_confidence(&predictions)?.label.clone();
    durable_info!(ctx, label = %label, candidates = predictions.len(), "label selected");

    let breed = ctx
        .schedule_activity_typed(activities::LOOKUP_BREED_INFO, &label)?
        .into_activity_typed::<Value>();
    let centres = ctx
        .schedule_activity_typed(activities::LOOKUP_ADOPTION_CENTRES, &label)?
        .into_activity_typed::<Value>();
    let (breed_information, adoption_centres) = join(breed, centres).await;

    let canonical = PetIdentificationCanonical {
        label,
        breed_information: breed_information?,
        adoption_centres: adoption_centres?,
    };
    let message = serde_json::to_string(&canonical)
        .map_err(|e| WorkflowFault::codec(format!("encode canonical payload: {e}")))?;
    let request = DeliveryRequest {
        subscriber_id: subscriber_id.clone(),
        message,
    };
    let ack = ctx
        .schedule_activity_typed(activities::DELIVER, &request)?
        .into_activity()
        .await?;

    durable_info!(ctx, subscriber = %subscriber_id, "pet identification delivered");
    Ok(PetIdentificationOutcome {
        subscriber_id,
        canonical,
        ack,
    })
}

/// The external capabilities the workflow's activities call into.
///
/// Implementations should treat [`ActivityContext::idempotency_key`] as the
/// key for any side effect, since an attempt can be re-run after a crash.
#[async_trait]
pub trait PetIdentificationServices: Send + Sync {
    async fn classify_image(&self, ctx: &ActivityContext, image_reference: &str)
    -> Result<Vec<Prediction>, ActivityFailure>;
    async fn resolve_subscriber(&self, ctx: &ActivityContext, image_reference: &str) -> Result<String, ActivityFailure>;
    async fn lookup_breed_info(&self, ctx: &ActivityContext, label: &str) -> Result<Value, ActivityFailure>;
    async fn lookup_adoption_centres(&self, ctx: &ActivityContext, label: &str) -> Result<Value, ActivityFailure>;
    async fn deliver(&self, ctx: &ActivityContext, request: &DeliveryRequest) -> Result<String, ActivityFailure>;
}

/// Register both orchestrations.
pub fn register_orchestrations(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder
        .register_typed(PET_IDENTIFICATION, pet_identification)
        .register_typed(PET_IDENTIFICATION_FOR_SUBSCRIBER, pet_identification_for_subscriber)
}

/// Register the five activities against `services`.
pub fn register_activities(
    builder: ActivityRegistryBuilder,
    services: Arc<dyn PetIdentificationServices>,
) -> ActivityRegistryBuilder {
    let s1 = services.clone();
    let s2 = services.clone();
    let s3 = services.clone();
    let s4 = services.clone();
    let s5 = services;
    builder
        .register_typed(activities::CLASSIFY_IMAGE, move |ctx: ActivityContext, image: String| {
            let s = s1.clone();
            async move { s.classify_image(&ctx, &image).await }
        })
        .register_typed(activities::RESOLVE_SUBSCRIBER, move |ctx: ActivityContext, image: String| {
            let s = s2.clone();
            async move { s.resolve_subscriber(&ctx, &image).await }
        })
        .register_typed(activities::LOOKUP_BREED_INFO, move |ctx: ActivityContext, label: String| {
            let s = s3.clone();
            async move { s.lookup_breed_info(&ctx, &label).await }
        })
        .register_typed(activities::LOOKUP_ADOPTION_CENTRES, move |ctx: ActivityContext, label: String| {
            let s = s4.clone();
            async move { s.lookup_adoption_centres(&ctx, &label).await }
        })
        .register_typed(activities::DELIVER, move |ctx: ActivityContext, request: DeliveryRequest| {
            let s = s5.clone();
            async move { s.deliver(&ctx, &request).await }
        })
}
