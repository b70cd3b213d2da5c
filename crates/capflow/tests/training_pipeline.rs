// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The learning loop end to end, in process: traces feed a replay batch,
//! the trainer produces new params and TD errors, the serving model
//! hot-loads the params, and the replay buffer re-prioritizes.

use std::sync::Arc;

use capflow::config::{CapflowConfig, TrainingConfig};
use capflow::constants::EMBEDDING_DIM;
use capflow::replay::TraceStore;
use capflow::shgat::{ShgatModel, ShgatParams, TrainExample, Trainer, TrainingCandidate};
use capflow::worker::{
    TrainRequest, TrainResponse, TrainRunner, TrainingCoordinator, TrainingLock, TrainingMode,
};
use capflow::TrainingState;
use capflow::trace::ExecutionTrace;
use uuid::Uuid;

fn unit(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; EMBEDDING_DIM];
    v[axis] = 1.0;
    v
}

fn small_config() -> CapflowConfig {
    let mut config = CapflowConfig::default();
    config.shgat.num_heads = 4;
    config.shgat.hidden_dim = 32;
    config.shgat.mlp_hidden_dim = 16;
    config.shgat.num_layers = 1;
    config.shgat.dropout = 0.0;
    config
}

fn candidate_pool() -> Vec<TrainingCandidate> {
    let mut pool = vec![TrainingCandidate {
        id: "cap-fetch".into(),
        embedding: unit(0),
        tools: vec!["net:get".into(), "json:parse".into()],
        success_rate: 0.9,
        is_capability: true,
    }];
    for (i, id) in ["net:get", "json:parse", "fs:read", "fs:write"].iter().enumerate() {
        pool.push(TrainingCandidate {
            id: (*id).to_string(),
            embedding: unit(i + 1),
            tools: Vec::new(),
            success_rate: 0.5,
            is_capability: false,
        });
    }
    pool
}

#[tokio::test]
async fn replay_batch_trains_and_reprioritizes() {
    let config = small_config();
    let store = Arc::new(TraceStore::new(1000, 0.6, 0.4, 5));
    for i in 0..16 {
        let mut trace = ExecutionTrace::new("fetch users", unit(0), i % 4 != 0);
        trace.intent_embedding = unit(0);
        store.append(trace);
    }

    // Sample a PER batch and turn it into training examples.
    let batch = store.sample_batch(8);
    assert_eq!(batch.len(), 8);
    let (ids, examples): (Vec<Uuid>, Vec<TrainExample>) = batch
        .iter()
        .map(|sampled| {
            (
                sampled.trace.id,
                TrainExample {
                    trace_id: Some(sampled.trace.id),
                    intent_embedding: sampled.trace.intent_embedding.clone(),
                    context_tools: Vec::new(),
                    candidate_id: "cap-fetch".into(),
                    outcome: if sampled.trace.success { 1.0 } else { 0.0 },
                    negative_ids: Vec::new(),
                    weight: sampled.weight,
                },
            )
        })
        .unzip();

    let model = ShgatModel::new(&config, 0).unwrap();
    let before = model.params();

    let mut trainer = Trainer::new((*before).clone(), TrainingConfig::default());
    let report = trainer.train(&candidate_pool(), &examples, 3, 4);
    assert_eq!(report.td_errors.len(), examples.len());
    assert!(report.final_loss.is_finite());

    // Hot-load the trained params; the serving pointer swaps atomically.
    model
        .install_params(trainer.into_params(), TrainingState::Live)
        .unwrap();
    assert_eq!(model.state(), TrainingState::Live);
    assert!(!Arc::ptr_eq(&before, &model.params()));

    // Priorities become |td| + epsilon.
    store.update_priorities(&ids, &report.td_errors);
    for (id, td) in ids.iter().zip(report.td_errors.iter()) {
        let stored = store.get(id).unwrap().priority;
        assert!((stored - (td.abs() + 1e-3).clamp(0.0, 1.0)).abs() < 1e-9);
    }
}

#[tokio::test]
async fn params_round_trip_preserves_model() {
    let config = small_config();
    let model = ShgatModel::new(&config, 1).unwrap();
    let blob = model.export_params_blob().unwrap();
    let reimported = capflow::ShgatParams::import(&blob).unwrap();
    assert_eq!(&*model.params(), &reimported);
}

/// Runs the training request in process, exactly as the worker binary
/// would, so the coordinator path is testable without spawning anything.
struct InProcessRunner;

#[async_trait::async_trait]
impl TrainRunner for InProcessRunner {
    async fn run(&self, request: TrainRequest) -> capflow::Result<TrainResponse> {
        let params = match &request.existing_params {
            Some(blob) => ShgatParams::import(blob)?,
            None => unreachable!("coordinator always ships params"),
        };
        let mut trainer = Trainer::new(params, TrainingConfig::default());
        let report = trainer.train(
            &request.candidates,
            &request.examples,
            request.epochs,
            request.batch_size,
        );
        Ok(TrainResponse {
            success: true,
            final_loss: report.final_loss,
            final_accuracy: report.final_accuracy,
            td_errors: report.td_errors,
            saved_to_db: false,
            params_blob: Some(trainer.into_params().export()?),
            message: None,
        })
    }
}

#[tokio::test]
async fn coordinator_drives_cold_to_batch_to_live() {
    let config = small_config();
    let traces = Arc::new(TraceStore::new(1000, 0.6, 0.4, 9));
    let model = Arc::new(ShgatModel::new(&config, 0).unwrap());
    let lock = Arc::new(TrainingLock::new());
    let coordinator = TrainingCoordinator::new(
        Arc::new(InProcessRunner),
        Arc::clone(&model),
        Arc::clone(&traces),
        lock,
        TrainingConfig {
            min_traces_for_training: 10,
            epochs: 2,
            batch_size: 4,
            ..Default::default()
        },
        None,
        "user-1",
    );

    assert!(!coordinator.ready_to_train());
    let cap_id = Uuid::parse_str("6f9619ff-8b86-d011-b42d-00c04fc964ff").unwrap();
    for i in 0..12 {
        let mut trace = ExecutionTrace::new("fetch users", unit(0), i % 3 != 0)
            .with_capability(cap_id);
        trace.intent_embedding = unit(0);
        traces.append(trace);
    }
    assert!(coordinator.ready_to_train());

    let mut pool = candidate_pool();
    pool[0].id = cap_id.to_string();
    let before = model.params();
    let batch = coordinator
        .train_once(pool.clone(), TrainingMode::Batch)
        .await
        .unwrap();
    assert!(batch.success);
    assert_eq!(model.state(), TrainingState::Batch);
    assert!(!Arc::ptr_eq(&before, &model.params()));

    // Priorities moved off the cold-start value for trained traces.
    let moved = traces
        .all()
        .iter()
        .filter(|t| (t.priority - 0.5).abs() > 1e-9)
        .count();
    assert!(moved > 0, "at least one trace re-prioritized");

    let live = coordinator
        .train_once(pool, TrainingMode::Live)
        .await
        .unwrap();
    assert!(live.success);
    assert_eq!(model.state(), TrainingState::Live);
}

#[tokio::test]
async fn batch_then_live_training_respects_lock() {
    let lock = TrainingLock::new();
    let batch_guard = lock.try_acquire(TrainingMode::Batch).unwrap();
    // A live session cannot start while batch training runs.
    assert!(lock.try_acquire(TrainingMode::Live).is_err());
    drop(batch_guard);
    let live_guard = lock.try_acquire(TrainingMode::Live).unwrap();
    assert_eq!(lock.current(), Some(TrainingMode::Live));
    drop(live_guard);
    assert_eq!(lock.current(), None);
}

#[tokio::test]
async fn cold_model_waits_for_min_traces() {
    let config = small_config();
    let store = TraceStore::new(1000, 0.6, 0.4, 5);
    let model = ShgatModel::new(&config, 0).unwrap();
    assert_eq!(model.state(), TrainingState::Cold);

    for _ in 0..config.training.min_traces_for_training - 1 {
        store.append(ExecutionTrace::new("x", unit(0), true));
    }
    assert!(store.len() < config.training.min_traces_for_training);
    // Driver logic: below the threshold the state machine stays cold.
    if store.len() >= config.training.min_traces_for_training {
        model.set_state(TrainingState::Batch);
    }
    assert_eq!(model.state(), TrainingState::Cold);

    store.append(ExecutionTrace::new("x", unit(0), true));
    if store.len() >= config.training.min_traces_for_training {
        model.set_state(TrainingState::Batch);
    }
    assert_eq!(model.state(), TrainingState::Batch);
}
