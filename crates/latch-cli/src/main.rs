use std::sync::Arc;

use latch_core::{
    EngineConfig, EngineGateway, HandlerResult, InMemoryEngine, RestGateway, Supervisor,
    TaskHandle, Variables, WorkerConfig,
};
use tokio::time::{Duration, sleep};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// STEP_1: 何もせず先へ進める
fn step_one(task: &TaskHandle) -> HandlerResult {
    task.complete(Variables::new().with("result", "continue"))?;
    Ok(())
}

/// STEP_2: 手動レビューへ回す業務エラー
fn step_two(task: &TaskHandle) -> HandlerResult {
    let vars = Variables::new()
        .with("errorTaskId", task.activity_id().map(str::to_string))
        .with("reason", "automatic checks were inconclusive");
    task.report_business_error("review", "needs manual review", vars)?;
    Ok(())
}

fn request_manual_review(task: &TaskHandle) -> HandlerResult {
    tracing::info!(
        task_id = %task.id(),
        error_task_id = task.variables().get_str("errorTaskId").unwrap_or("-"),
        reason = task.variables().get_str("reason").unwrap_or("-"),
        "manual review requested"
    );
    task.complete(Variables::new())?;
    Ok(())
}

/// LATCH_DEMO=in-memory のときはエンジン無しで一通り流す
async fn seed_demo(engine: &InMemoryEngine) {
    engine.publish("STEP_1", Variables::new()).await;
    engine.publish("STEP_1", Variables::new()).await;
    engine.publish("STEP_2", Variables::new()).await;
    engine
        .publish(
            "REQUEST_MANUAL_REVIEW",
            Variables::new()
                .with("errorTaskId", "Activity_STEP_2")
                .with("reason", "seeded by demo"),
        )
        .await;
}

async fn wait_until_drained(engine: &InMemoryEngine) {
    while engine.open_tasks().await > 0 {
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "latch=info,latch_core=info,latch_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let worker_config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid worker configuration");
            std::process::exit(1);
        }
    };

    let demo = std::env::var("LATCH_DEMO").is_ok_and(|v| v == "in-memory");
    let in_memory = demo.then(|| Arc::new(InMemoryEngine::new()));
    let gateway: Arc<dyn EngineGateway> = match &in_memory {
        Some(engine) => engine.clone(),
        None => {
            let engine_config = match EngineConfig::from_env() {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(error = %e, "invalid engine configuration");
                    std::process::exit(1);
                }
            };
            tracing::info!(base_url = %engine_config.base_url, "using engine REST API");
            match RestGateway::new(engine_config) {
                Ok(gateway) => Arc::new(gateway),
                Err(e) => {
                    tracing::error!(error = %e, "could not build http client");
                    std::process::exit(1);
                }
            }
        }
    };

    let supervisor = match Supervisor::new(gateway, worker_config) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "invalid worker configuration");
            std::process::exit(1);
        }
    };
    tracing::info!(worker_id = %supervisor.worker_id(), "worker starting");

    let subscribed = supervisor
        .subscribe("STEP_1", step_one)
        .and_then(|_| supervisor.subscribe("STEP_2", step_two))
        .and_then(|_| supervisor.subscribe("REQUEST_MANUAL_REVIEW", request_manual_review));
    if let Err(e) = subscribed {
        tracing::error!(error = %e, "subscription failed");
        supervisor.stop().await;
        std::process::exit(1);
    }

    match &in_memory {
        Some(engine) => {
            seed_demo(engine).await;
            tokio::select! {
                _ = wait_until_drained(engine) => tracing::info!("demo tasks finished"),
                _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
            }
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "could not listen for ctrl-c");
            }
        }
    }

    supervisor.stop().await;
    for status in supervisor.status() {
        match serde_json::to_string(&status) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "could not render status"),
        }
    }
}
