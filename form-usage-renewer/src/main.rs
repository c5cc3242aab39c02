use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use form_usage_renewer::{
    api,
    token::{StaticToken, TokenProvider},
    Callbacks, CollectorClient, CollectorResponse, MemoryStore, RecordError, RenewalStats, Renewer,
    RenewerConfig,
};

#[derive(Clone, Debug, Parser)]
pub struct Cli {
    /// JSON renewer config, defaults apply when omitted
    #[clap(long, short)]
    config: Option<PathBuf>,
    /// JSON file holding the carry-over records
    #[clap(long, short, default_value_os_t=PathBuf::from("/var/lib/formation/carry-over.json"))]
    records: PathBuf,
    /// Port of the statistics endpoint
    #[clap(long, short, default_value="3010")]
    port: u16,
    /// Run a single renewal pass and exit
    #[clap(long)]
    once: bool,
    #[clap(long, default_value="info")]
    log_level: log::Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let parser = Cli::parse();
    simple_logger::init_with_level(parser.log_level)?;

    let config = match &parser.config {
        Some(path) => RenewerConfig::from_file(path)?,
        None => RenewerConfig::default(),
    };

    let token: Arc<dyn TokenProvider> = match (&config.token, config.secured) {
        (Some(token), _) => Arc::new(StaticToken(token.clone())),
        (None, true) => return Err("A token is required when the collector is secured".into()),
        (None, false) => Arc::new(StaticToken(String::new())),
    };

    let store = Arc::new(MemoryStore::open(&parser.records).await?);
    let client = Arc::new(CollectorClient::from_settings(&config.collector_url, &config.client)?);
    let renewer = Renewer::new(config, store, client);

    if parser.once {
        let stats = renewer
            .renew_usage(
                token.as_ref(),
                Callbacks::new(
                    |stats: &RenewalStats| log::info!("Renewed {} resources", stats.success.all),
                    |error: &RecordError, response: Option<&CollectorResponse>| {
                        log::error!("{error} (status {:?})", response.map(|r| r.status))
                    },
                ),
            )
            .await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    renewer.start_renewer(token);

    let server = renewer.clone();
    tokio::spawn(async move {
        if let Err(e) = api::serve(server, parser.port).await {
            log::error!("Statistics endpoint stopped: {e}");
        }
    });

    tokio::signal::ctrl_c().await?;
    renewer.stop_renewer();

    Ok(())
}
