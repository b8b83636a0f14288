use crate::backend::bigquery::BigQueryConnector;
use crate::config::AppConfig;
use crate::error::BridgeError;
use crate::handlers::AppState;
use crate::router;
use crate::session::Session;

/// Bind the listener and serve until Ctrl+C / SIGTERM.
pub async fn run(config: AppConfig) -> Result<(), BridgeError> {
    let connector = BigQueryConnector::new(
        config.endpoint.clone(),
        config.token_uri.clone(),
        config.query_timeout_secs,
    );
    let session = Session::new(connector).with_show_secrets(config.show_secrets);
    let app = router::app_router(AppState::new(session), &config.router_settings());

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        "bqbridge listening on http://{} (static files from {})",
        listener.local_addr()?,
        config.static_dir.display()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
