//! Wires the upload service, catalog notifications and the WebSocket server.

use std::sync::Arc;

use chunkdrop_server::{CatalogEvent, ServerConfig, UploadServer, UploadService};

use crate::config::Config;

/// Runs the server until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let (service, mut catalog_events) = UploadService::open_data_dir(&config.data_dir).await?;

    let server_config = ServerConfig {
        host: config.host,
        port: config.port,
    };
    let server = UploadServer::bind(server_config, Arc::new(service)).await?;
    tracing::info!(addr = %server.local_addr(), "WebSocket server bound");

    let server_run = Arc::clone(&server);
    let serve = tokio::spawn(async move {
        if let Err(e) = server_run.run().await {
            tracing::error!("server error: {e}");
        }
    });

    // Downstream processing hook: registered archives are logged.
    let notify = tokio::spawn(async move {
        while let Some(event) = catalog_events.recv().await {
            match event {
                CatalogEvent::Registered {
                    archive_id,
                    upload_id,
                    metadata,
                    path,
                } => tracing::info!(
                    archive_id = %archive_id,
                    upload_id = %upload_id,
                    title = %metadata.title,
                    path = %path.display(),
                    "archive ready"
                ),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");

    server.shutdown();
    serve.await?;
    notify.abort();
    Ok(())
}
