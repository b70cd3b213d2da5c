// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! CapFlow training worker.
//!
//! A pure pipe process: one length-prefixed JSON request on stdin, one
//! length-prefixed status frame on stdout. Logs go to stderr so stdout
//! stays a clean protocol channel. Trained parameters are persisted to
//! storage (keyed by user id) when a connection string is supplied;
//! otherwise the blob rides back in the status frame.
//!
//! The worker always answers: every failure mode short of a crash still
//! produces a `success=false` frame so the parent never hangs on EOF.

use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use capflow::config::{ShgatConfig, TrainingConfig};
use capflow::shgat::{ShgatParams, Trainer};
use capflow::storage::Storage;
use capflow::worker::{read_frame, write_frame, TrainRequest, TrainResponse};
use capflow_postgres::PostgresStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let response = match read_request(&mut stdin).await {
        Ok(request) => run(request).await.unwrap_or_else(|e| {
            error!(error = %e, "training run failed");
            TrainResponse::failure(e.to_string())
        }),
        Err(e) => {
            error!(error = %e, "failed to read training request");
            TrainResponse::failure(format!("bad request frame: {e}"))
        }
    };

    let payload = serde_json::to_vec(&response).context("encode status frame")?;
    write_frame(&mut stdout, &payload)
        .await
        .context("write status frame")?;
    Ok(())
}

async fn read_request(stdin: &mut tokio::io::Stdin) -> anyhow::Result<TrainRequest> {
    let frame = read_frame(stdin).await.context("read request frame")?;
    let request: TrainRequest = serde_json::from_slice(&frame).context("decode request")?;
    Ok(request)
}

async fn run(request: TrainRequest) -> anyhow::Result<TrainResponse> {
    info!(
        candidates = request.candidates.len(),
        examples = request.examples.len(),
        epochs = request.epochs,
        batch_size = request.batch_size,
        "training request received"
    );

    let params = match &request.existing_params {
        Some(blob) => ShgatParams::import(blob).context("import existing params")?,
        None => ShgatParams::init(&ShgatConfig::default(), 0).context("initialize params")?,
    };

    let mut trainer = Trainer::new(params, TrainingConfig::default());
    let report = trainer.train(
        &request.candidates,
        &request.examples,
        request.epochs,
        request.batch_size,
    );
    let blob = trainer.into_params().export().context("export params")?;

    // Params go to storage, not the pipe, whenever storage is reachable;
    // frames stay small.
    let mut saved_to_db = false;
    let mut params_blob = None;
    match &request.db_url {
        Some(db_url) => {
            let storage = PostgresStorage::connect(db_url)
                .await
                .context("connect to params storage")?;
            let storage: Arc<dyn Storage> = Arc::new(storage);
            storage
                .save_params(&request.user_id, &blob)
                .await
                .context("persist params")?;
            saved_to_db = true;
        }
        None => {
            params_blob = Some(blob);
        }
    }

    info!(
        loss = report.final_loss,
        accuracy = report.final_accuracy,
        saved_to_db,
        "training complete"
    );
    Ok(TrainResponse {
        success: true,
        final_loss: report.final_loss,
        final_accuracy: report.final_accuracy,
        td_errors: report.td_errors,
        saved_to_db,
        params_blob,
        message: None,
    })
}
