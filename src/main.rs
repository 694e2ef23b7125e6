//! autotask - scheduler daemon entry point.
//!
//! Wires the credential pool, sandbox pool, tool registry and task scheduler
//! together and runs until Ctrl-C.

use std::sync::Arc;

use autotask::{
    config::Config,
    credentials::CredentialPool,
    llm::OpenRouterClient,
    sandbox::{HttpSandboxProvider, SandboxPool},
    store::create_task_store,
    tools::{RunCode, ToolRegistry},
    TaskEventKind, TaskScheduler,
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    // Deep async chains (session -> tool -> sandbox -> provider) get a larger worker stack.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_stack_size(16 * 1024 * 1024)
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autotask=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        model = %config.default_model,
        store = ?config.store_type,
        max_concurrent = config.scheduler.max_concurrent,
        "Loaded configuration"
    );

    let credentials = Arc::new(CredentialPool::from_entries(
        &config.sandbox.api_keys,
        config.sandbox.credential_cooldown,
    ));
    if credentials.is_empty().await {
        warn!("No sandbox credentials configured; run_code calls will fail");
    }

    let provider = Arc::new(HttpSandboxProvider::new(config.sandbox.api_url.clone()));
    let sandboxes = Arc::new(SandboxPool::new(provider, credentials, &config.sandbox));
    let reaper = SandboxPool::start_reaper(sandboxes.clone(), config.sandbox.sweep_interval);

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(RunCode::new(sandboxes.clone())));
    info!(tools = tools.list_tools().len(), "Tool registry ready");

    let store = create_task_store(config.store_type, config.data_dir.clone())
        .await
        .map_err(anyhow::Error::msg)?;
    if !store.is_persistent() {
        warn!("Task store is in-memory; tasks will not survive a restart");
    }

    let model = Arc::new(OpenRouterClient::new(
        config.api_key.clone(),
        config.default_model.clone(),
    ));
    let scheduler = TaskScheduler::new(
        store,
        model,
        Arc::new(tools),
        config.scheduler.clone(),
        config.session.clone(),
    )
    .with_sandbox_pool(sandboxes.clone());

    let mut events = scheduler.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let TaskEventKind::Finished { status, .. } = &event.event {
                        info!(task_id = %event.task_id, status = %status, "Task finished");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let handle = scheduler.start();
    info!("Scheduler running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    handle.stop().await;
    reaper.stop().await;
    sandboxes.shutdown().await;
    logger.abort();

    Ok(())
}
