use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use petflow::providers::HistoryStore;
use petflow::providers::fs::FsHistoryStore;
use petflow::runtime::{Runtime, run_pass};
use petflow::workflows::pet_identification::{
    self, DeliveryRequest, PET_IDENTIFICATION, PetIdentificationInput, PetIdentificationServices, Prediction,
};
use petflow::{ActivityContext, ActivityFailure, ActivityRegistry, OrchestrationRegistry};
use serde_json::{Value, json};

/// Canned services so the workflow can run end to end without any backend.
struct CannedServices;

#[async_trait]
impl PetIdentificationServices for CannedServices {
    async fn classify_image(&self, _ctx: &ActivityContext, image: &str) -> Result<Vec<Prediction>, ActivityFailure> {
        let guess = if image.contains("cat") { "tabby" } else { "labrador" };
        Ok(vec![
            Prediction {
                label: guess.to_string(),
                confidence: 0.87,
            },
            Prediction {
                label: "unknown".to_string(),
                confidence: 0.13,
            },
        ])
    }

    async fn resolve_subscriber(&self, _ctx: &ActivityContext, image: &str) -> Result<String, ActivityFailure> {
        Ok(image.split('/').next().unwrap_or("anonymous").to_string())
    }

    async fn lookup_breed_info(&self, _ctx: &ActivityContext, label: &str) -> Result<Value, ActivityFailure> {
        Ok(json!({ "breed": label, "temperament": "friendly" }))
    }

    async fn lookup_adoption_centres(&self, _ctx: &ActivityContext, label: &str) -> Result<Value, ActivityFailure> {
        Ok(json!([{ "name": "City Shelter", "has": label }]))
    }

    async fn deliver(&self, ctx: &ActivityContext, request: &DeliveryRequest) -> Result<String, ActivityFailure> {
        println!("-> {}: {}", request.subscriber_id, request.message);
        Ok(ctx.idempotency_key())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let image_reference = args.next().unwrap_or_else(|| "alice/dog.jpg".to_string());
    let root = args.next().unwrap_or_else(|| "./petflow-data".to_string());

    let store: Arc<dyn HistoryStore> = Arc::new(FsHistoryStore::new(&root, false)?);
    let activities =
        pet_identification::register_activities(ActivityRegistry::builder(), Arc::new(CannedServices)).build();
    let orchestrations = pet_identification::register_orchestrations(OrchestrationRegistry::builder()).build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations.clone()).await?;
    let client = rt.client();

    let input = PetIdentificationInput {
        image_reference: image_reference.clone(),
        subscriber_id: None,
    };
    // Re-running with the same image joins the existing instance
    let payload = serde_json::to_string(&input)?;
    let id = client
        .start_orchestration_with_key(PET_IDENTIFICATION, &image_reference, payload)
        .await?;
    let status = client.wait_for_orchestration(&id, Duration::from_secs(30)).await?;
    println!("{id}: {} {}", status.status, status.output.unwrap_or_default());

    println!("\nReplaying to verify determinism...");
    let history = store.read_all(&id).await?;
    let pass = run_pass(&id, &history, &orchestrations, &rt.options().retry_policy);
    println!("replay of {} events: {:?}", history.len(), pass.outcome);

    rt.shutdown().await;
    Ok(())
}
