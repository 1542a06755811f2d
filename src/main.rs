//! # keyproxy 服务入口

use keyproxy::app::AppContext;
use keyproxy::logging::{LogComponent, LogStage, init_logging};
use keyproxy::{AppConfig, linfo};

#[tokio::main]
async fn main() -> keyproxy::Result<()> {
    // 配置非法时直接以非零码退出
    let config = AppConfig::from_env()?;
    init_logging(config.log_level.as_ref());

    let bind_address = config.bind_address();
    let context = AppContext::build(config).await?;
    context.start_background().await;

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Main,
        "server_listening",
        "keyproxy listening",
        address = %bind_address,
        is_slave = context.config.is_slave
    );

    axum::serve(listener, context.router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    context.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::Main,
            "signal_error",
            "Failed to listen for shutdown signal",
            error = %err
        );
    }
}
