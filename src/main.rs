use std::sync::Arc;

use mailweave::{
    AcknowledgmentResponder, AppConfig, ImapSmtpTransport, IngestPipeline, Poller, ReplyService,
    ThreadStore,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SIGNATURE: &str = "Best regards,\nmailweave";

#[tokio::main]
async fn main() {
    // Debug builds default to debug logs for this crate; RUST_LOG overrides.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("mailweave=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> mailweave::Result<()> {
    info!("Starting mailweave ...");

    let config = AppConfig::load()?;
    info!(
        "Watching {} on {} as {} every {}s",
        config.imap.mailbox, config.imap.host, config.system_address, config.check_interval_seconds
    );

    let store = Arc::new(ThreadStore::open(&config.db_path)?);
    let transport = Arc::new(ImapSmtpTransport::new(&config)?);

    let mut pipeline = IngestPipeline::new(
        store.clone(),
        transport.clone(),
        config.system_address.clone(),
    );

    if config.auto_reply {
        let replies = Arc::new(ReplyService::new(
            store.clone(),
            transport.clone(),
            config.system_address.clone(),
        ));
        pipeline.register_callback(Arc::new(AcknowledgmentResponder::new(replies, SIGNATURE)));
        info!("Acknowledgment replies enabled");
    }

    let poller = Poller::new(Arc::new(pipeline), config.check_interval());
    poller.start().await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");

    poller.stop().await;
    transport.shutdown().await;
    drop(poller);

    match Arc::try_unwrap(store) {
        Ok(store) => store.close(),
        Err(_) => info!("Store still referenced, leaving connections to drop"),
    }

    info!("mailweave stopped");
    Ok(())
}
