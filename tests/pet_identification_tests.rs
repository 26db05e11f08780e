use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use petflow::providers::HistoryStore;
use petflow::runtime::Runtime;
use petflow::workflows::pet_identification::{
    self, DeliveryRequest, PET_IDENTIFICATION, PET_IDENTIFICATION_FOR_SUBSCRIBER, PetIdentificationCanonical,
    PetIdentificationInput, PetIdentificationOutcome, PetIdentificationServices, Prediction, activities,
};
use petflow::{
    ActivityContext, ActivityFailure, ActivityRegistry, EventKind, FaultKind, OrchestrationRegistry,
    OrchestrationStatus,
};
use serde_json::{Value, json};

mod common;

#[derive(Default)]
struct FakeServices {
    breed_lookup_fails: bool,
    breed_info: Option<Value>,
    flaky_classifier_failures: AtomicU32,
    deliveries: Mutex<Vec<(String, DeliveryRequest)>>,
    lookups: AtomicU32,
}

#[async_trait]
impl PetIdentificationServices for FakeServices {
    async fn classify_image(&self, _ctx: &ActivityContext, image_reference: &str) -> Result<Vec<Prediction>, ActivityFailure> {
        if self.flaky_classifier_failures.load(Ordering::SeqCst) > 0 {
            self.flaky_classifier_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ActivityFailure::transient("classifier busy"));
        }
        if image_reference.is_empty() {
            return Err(ActivityFailure::invalid_input("empty image reference"));
        }
        Ok(vec![
            Prediction {
                label: "beagle".into(),
                confidence: 0.31,
            },
            Prediction {
                label: "border-collie".into(),
                confidence: 0.64,
            },
            Prediction {
                label: "pug".into(),
                confidence: 0.05,
            },
        ])
    }

    async fn resolve_subscriber(&self, _ctx: &ActivityContext, image_reference: &str) -> Result<String, ActivityFailure> {
        // Uploads land under <subscriber>/<file>
        image_reference
            .split_once('/')
            .map(|(subscriber, _)| subscriber.to_string())
            .ok_or_else(|| ActivityFailure::permanent(format!("no subscriber in {image_reference}")))
    }

    async fn lookup_breed_info(&self, _ctx: &ActivityContext, label: &str) -> Result<Value, ActivityFailure> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(15)).await;
        if self.breed_lookup_fails {
            return Err(ActivityFailure::permanent(format!("no breed entry for {label}")));
        }
        Ok(self
            .breed_info
            .clone()
            .unwrap_or_else(|| json!({ "name": label, "group": "herding" })))
    }

    async fn lookup_adoption_centres(&self, _ctx: &ActivityContext, label: &str) -> Result<Value, ActivityFailure> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(json!([{ "centre": "North Shelter", "breed": label }]))
    }

    async fn deliver(&self, ctx: &ActivityContext, request: &DeliveryRequest) -> Result<String, ActivityFailure> {
        let key = ctx.idempotency_key();
        let mut deliveries = self.deliveries.lock().unwrap();
        if !deliveries.iter().any(|(k, _)| *k == key) {
            deliveries.push((key.clone(), request.clone()));
        }
        Ok(format!("ack:{key}"))
    }
}

async fn start(services: Arc<FakeServices>) -> (Arc<Runtime>, Arc<dyn HistoryStore>) {
    let activities = pet_identification::register_activities(ActivityRegistry::builder(), services).build();
    let orchestrations = pet_identification::register_orchestrations(OrchestrationRegistry::builder()).build();
    let store = common::in_memory_store();
    let rt = Runtime::start_with_options(store.clone(), Arc::new(activities), orchestrations, common::fast_options())
        .await
        .unwrap();
    (rt, store)
}

#[tokio::test]
async fn upload_is_classified_looked_up_and_delivered() {
    let services = Arc::new(FakeServices::default());
    let (rt, store) = start(services.clone()).await;
    let client = rt.client();

    let input = PetIdentificationInput {
        image_reference: "sub-7/rex.jpg".into(),
        subscriber_id: None,
    };
    let id = client.start_orchestration_typed(PET_IDENTIFICATION, &input).await.unwrap();
    let status = client.wait_for_orchestration(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.status, OrchestrationStatus::Completed, "{status:?}");

    let outcome: PetIdentificationOutcome = serde_json::from_str(status.output.as_deref().unwrap()).unwrap();
    assert_eq!(outcome.subscriber_id, "sub-7");
    assert_eq!(outcome.canonical.label, "border-collie");
    assert_eq!(outcome.canonical.breed_information["group"], "herding");
    assert_eq!(outcome.canonical.adoption_centres[0]["centre"], "North Shelter");

    let deliveries = services.deliveries.lock().unwrap().clone();
    assert_eq!(deliveries.len(), 1);
    let (key, request) = &deliveries[0];
    assert_eq!(outcome.ack, format!("ack:{key}"));
    assert_eq!(request.subscriber_id, "sub-7");
    let delivered: PetIdentificationCanonical = serde_json::from_str(&request.message).unwrap();
    assert_eq!(delivered, outcome.canonical);

    // Classification and identity are scheduled together, lookups only after both
    let hist = store.read_all(&id).await.unwrap();
    let order: Vec<String> = hist
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ActivityScheduled { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        order,
        vec![
            activities::CLASSIFY_IMAGE,
            activities::RESOLVE_SUBSCRIBER,
            activities::LOOKUP_BREED_INFO,
            activities::LOOKUP_ADOPTION_CENTRES,
            activities::DELIVER,
        ]
    );
    assert!(matches!(hist[1].kind, EventKind::ActivityScheduled { .. }));
    assert!(matches!(hist[2].kind, EventKind::ActivityScheduled { .. }));
    common::assert_single_terminal(&hist);
    rt.shutdown().await;
}

#[tokio::test]
async fn permanent_lookup_failure_fails_without_delivery() {
    let services = Arc::new(FakeServices {
        breed_lookup_fails: true,
        ..FakeServices::default()
    });
    let (rt, store) = start(services.clone()).await;
    let client = rt.client();

    let input = PetIdentificationInput {
        image_reference: "sub-7/rex.jpg".into(),
        subscriber_id: None,
    };
    let id = client.start_orchestration_typed(PET_IDENTIFICATION, &input).await.unwrap();
    let status = client.wait_for_orchestration(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.status, OrchestrationStatus::Failed);
    let fault = status.fault().unwrap();
    assert_eq!(fault.kind, FaultKind::ActivityFailed);
    assert_eq!(fault.activity.as_deref(), Some(activities::LOOKUP_BREED_INFO));

    assert!(services.deliveries.lock().unwrap().is_empty());
    assert_eq!(services.lookups.load(Ordering::SeqCst), 2);
    let hist = store.read_all(&id).await.unwrap();
    assert_eq!(common::count_scheduled(&hist, activities::LOOKUP_BREED_INFO), 1);
    assert_eq!(common::count_scheduled(&hist, activities::DELIVER), 0);
    rt.shutdown().await;
}

#[tokio::test]
async fn textual_lookup_results_stay_strings() {
    let services = Arc::new(FakeServices {
        breed_info: Some(Value::String("123".into())),
        ..FakeServices::default()
    });
    let (rt, _store) = start(services.clone()).await;
    let client = rt.client();

    let input = PetIdentificationInput {
        image_reference: "sub-3/fido.jpg".into(),
        subscriber_id: None,
    };
    let id = client.start_orchestration_typed(PET_IDENTIFICATION, &input).await.unwrap();
    let status = client.wait_for_orchestration(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.status, OrchestrationStatus::Completed, "{status:?}");

    let outcome: PetIdentificationOutcome = serde_json::from_str(status.output.as_deref().unwrap()).unwrap();
    assert_eq!(outcome.canonical.breed_information, Value::String("123".into()));
    let (_, request) = services.deliveries.lock().unwrap()[0].clone();
    let delivered: Value = serde_json::from_str(&request.message).unwrap();
    assert_eq!(delivered["breedInformation"], json!("123"));
    rt.shutdown().await;
}

#[tokio::test]
async fn form_upload_skips_subscriber_resolution() {
    let services = Arc::new(FakeServices::default());
    let (rt, store) = start(services.clone()).await;
    let client = rt.client();

    let input = PetIdentificationInput {
        image_reference: "uploads/rex.jpg".into(),
        subscriber_id: Some("form-user".into()),
    };
    let id = client
        .start_orchestration_typed(PET_IDENTIFICATION_FOR_SUBSCRIBER, &input)
        .await
        .unwrap();
    let status = client.wait_for_orchestration(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.status, OrchestrationStatus::Completed, "{status:?}");

    let outcome: PetIdentificationOutcome = serde_json::from_str(status.output.as_deref().unwrap()).unwrap();
    assert_eq!(outcome.subscriber_id, "form-user");
    let hist = store.read_all(&id).await.unwrap();
    assert_eq!(common::count_scheduled(&hist, activities::RESOLVE_SUBSCRIBER), 0);
    assert_eq!(services.deliveries.lock().unwrap()[0].1.subscriber_id, "form-user");
    rt.shutdown().await;
}

#[tokio::test]
async fn form_upload_without_subscriber_is_invalid_state() {
    let (rt, store) = start(Arc::new(FakeServices::default())).await;
    let client = rt.client();
    let id = client
        .start_orchestration(PET_IDENTIFICATION_FOR_SUBSCRIBER, r#"{"imageReference":"a.jpg"}"#)
        .await
        .unwrap();
    let status = client.wait_for_orchestration(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.status, OrchestrationStatus::Failed);
    assert_eq!(status.fault().unwrap().kind, FaultKind::InvalidState);
    let hist = store.read_all(&id).await.unwrap();
    assert_eq!(common::count_scheduled(&hist, activities::CLASSIFY_IMAGE), 0);
    rt.shutdown().await;
}

#[tokio::test]
async fn busy_classifier_is_retried_transparently() {
    let services = Arc::new(FakeServices {
        flaky_classifier_failures: AtomicU32::new(2),
        ..FakeServices::default()
    });
    let (rt, store) = start(services.clone()).await;
    let client = rt.client();
    let input = PetIdentificationInput {
        image_reference: "sub-1/tom.png".into(),
        subscriber_id: None,
    };
    let id = client.start_orchestration_typed(PET_IDENTIFICATION, &input).await.unwrap();
    let status = client.wait_for_orchestration(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.status, OrchestrationStatus::Completed, "{status:?}");
    let hist = store.read_all(&id).await.unwrap();
    assert_eq!(common::count_scheduled(&hist, activities::CLASSIFY_IMAGE), 3);
    assert_eq!(common::count_outcomes(&hist, 0), 3);
    rt.shutdown().await;
}

#[tokio::test]
async fn terminate_stops_an_instance_waiting_on_lookups() {
    struct Stuck;

    #[async_trait]
    impl PetIdentificationServices for Stuck {
        async fn classify_image(&self, _: &ActivityContext, _: &str) -> Result<Vec<Prediction>, ActivityFailure> {
            Ok(vec![Prediction {
                label: "pug".into(),
                confidence: 1.0,
            }])
        }
        async fn resolve_subscriber(&self, _: &ActivityContext, _: &str) -> Result<String, ActivityFailure> {
            Ok("s".into())
        }
        async fn lookup_breed_info(&self, _: &ActivityContext, _: &str) -> Result<Value, ActivityFailure> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        }
        async fn lookup_adoption_centres(&self, _: &ActivityContext, _: &str) -> Result<Value, ActivityFailure> {
            Ok(Value::Null)
        }
        async fn deliver(&self, _: &ActivityContext, _: &DeliveryRequest) -> Result<String, ActivityFailure> {
            Ok("ack".into())
        }
    }

    let activity_registry =
        pet_identification::register_activities(ActivityRegistry::builder(), Arc::new(Stuck)).build();
    let orchestrations = pet_identification::register_orchestrations(OrchestrationRegistry::builder()).build();
    let store = common::in_memory_store();
    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(activity_registry),
        orchestrations,
        common::fast_options(),
    )
        .await
        .unwrap();
    let client = rt.client();
    let input = PetIdentificationInput {
        image_reference: "x".into(),
        subscriber_id: None,
    };
    let id = client.start_orchestration_typed(PET_IDENTIFICATION, &input).await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            &id,
            |h| common::count_scheduled(h, activities::LOOKUP_BREED_INFO) == 1,
            2_000
        )
        .await
    );
    client.terminate(&id, "operator cancelled").await.unwrap();
    let status = client.wait_for_orchestration(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.status, OrchestrationStatus::Terminated);
    assert_eq!(status.output.as_deref(), Some("operator cancelled"));
    rt.shutdown().await;
}
