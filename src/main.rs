use anyhow::Context;
use chrono::Local;
use clap::Parser;
use log::{error, info};
use std::sync::Arc;
use tokio::net::TcpListener;
use whatsapp_gateway::api::{self, AppState};
use whatsapp_gateway::engine::BridgeEngineFactory;
use whatsapp_gateway::lifecycle::ExitProcess;
use whatsapp_gateway::{GatewayConfig, LifecycleManager, MessageSender, RetryPolicy, SessionTracker};

fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(run(config))
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let factory = Arc::new(BridgeEngineFactory::new(
        config.engine_url.clone(),
        config.bridge_options(),
        config.engine_request_timeout(),
    ));
    let tracker = Arc::new(SessionTracker::new(config.qr_ttl()));
    let lifecycle = LifecycleManager::new(
        factory,
        tracker,
        config.session_dir.clone(),
        Arc::new(ExitProcess),
    );
    let sender = Arc::new(MessageSender::new(lifecycle.clone(), RetryPolicy::default()));

    tokio::spawn({
        let lifecycle = lifecycle.clone();
        async move {
            if let Err(e) = lifecycle.initialize_with_retry().await {
                error!("Engine initialization failed: {e}");
            }
        }
    });

    let state = AppState {
        lifecycle: lifecycle.clone(),
        sender,
        api_key: config.api_key().map(Arc::from),
        qr_wait: config.qr_wait(),
    };
    let router = api::mount(api::build_router(state), &config.api_prefix);

    let addr = config.listen_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    api::serve(listener, router, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
    })
    .await
    .context("HTTP server exited unexpectedly")?;

    lifecycle.shutdown().await;
    Ok(())
}
