// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Full pipe-protocol round trip against the real worker binary: spawn,
//! write one length-prefixed request, read one status frame.

use std::time::Duration;

use capflow::constants::EMBEDDING_DIM;
use capflow::shgat::{ShgatParams, TrainExample, TrainingCandidate};
use capflow::worker::{TrainRequest, WorkerClient};

fn unit(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; EMBEDDING_DIM];
    v[axis] = 1.0;
    v
}

fn small_params_blob() -> String {
    let config = capflow::config::ShgatConfig {
        num_heads: 4,
        hidden_dim: 32,
        mlp_hidden_dim: 16,
        num_layers: 1,
        dropout: 0.0,
        ..Default::default()
    };
    ShgatParams::init(&config, 0).unwrap().export().unwrap()
}

fn request(examples: Vec<TrainExample>) -> TrainRequest {
    let mut candidates = vec![TrainingCandidate {
        id: "cap-fetch".into(),
        embedding: unit(0),
        tools: vec!["net:get".into()],
        success_rate: 0.9,
        is_capability: true,
    }];
    for (i, id) in ["net:get", "fs:read", "fs:write"].iter().enumerate() {
        candidates.push(TrainingCandidate {
            id: (*id).to_string(),
            embedding: unit(i + 1),
            tools: Vec::new(),
            success_rate: 0.5,
            is_capability: false,
        });
    }
    TrainRequest {
        candidates,
        examples,
        epochs: 2,
        batch_size: 4,
        existing_params: Some(small_params_blob()),
        db_url: None,
        user_id: "test-user".into(),
    }
}

#[tokio::test]
async fn worker_trains_and_returns_params_blob() {
    let client = WorkerClient::new(
        env!("CARGO_BIN_EXE_capflow-trainer"),
        Duration::from_secs(120),
    );
    let examples: Vec<TrainExample> = (0..6)
        .map(|i| TrainExample {
            trace_id: None,
            intent_embedding: unit(0),
            context_tools: vec!["net:get".into()],
            candidate_id: "cap-fetch".into(),
            outcome: if i % 3 == 0 { 0.0 } else { 1.0 },
            negative_ids: Vec::new(),
            weight: 1.0,
        })
        .collect();

    let response = client.train(&request(examples)).await.unwrap();
    assert!(response.success, "worker failed: {:?}", response.message);
    assert_eq!(response.td_errors.len(), 6);
    assert!(response.final_loss.is_finite());
    assert!(!response.saved_to_db);
    // Without storage the params ride back in the frame, and re-import.
    let blob = response.params_blob.expect("params blob in frame");
    ShgatParams::import(&blob).unwrap();
}

#[tokio::test]
async fn worker_empty_example_set_is_noop_success() {
    let client = WorkerClient::new(
        env!("CARGO_BIN_EXE_capflow-trainer"),
        Duration::from_secs(60),
    );
    let response = client.train(&request(Vec::new())).await.unwrap();
    assert!(response.success);
    assert_eq!(response.final_loss, 0.0);
    assert_eq!(response.final_accuracy, 0.0);
    assert!(response.td_errors.is_empty());
}
