use anyhow::{anyhow, Result};
use dcvtrace::attribution::feeds::{
    self, FeedClient,
};
use dcvtrace::attribution::Attribution;
use dcvtrace::cert::SelfSignedIdentity;
use dcvtrace::store::DynStore;
use dcvtrace::{api, dns, smtp, web, Config, InMemoryStore, SharedConfig};
use is_terminal::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    let mut first_args = std::env::args().take(2);
    let (program_name, config_file) = (
        first_args.next().unwrap_or("dcvtrace".to_string()),
        first_args.next(),
    );

    let config = config_init(&program_name, config_file)?;
    let store: DynStore = Arc::new(tokio::sync::RwLock::new(InMemoryStore::default()));
    let identity = Arc::new(SelfSignedIdentity::new());
    let attribution = Arc::new(Attribution::new());

    if std::io::stdout().is_terminal() {
        println!("{}", dcvtrace::banner::BANNER);
    }

    tracing::info!("DNS listening on UDP {}", &config.dns_udp_bind_addr);
    tracing::info!("DNS listening on TCP {}", &config.dns_tcp_bind_addr);
    let dns_server = dns::new(config.clone(), store.clone()).await?;
    tokio::spawn(async move {
        // A dead listener is fatal to itself only; the rest keep serving.
        if let Err(err) = dns_server.block_until_done().await {
            tracing::error!("DNS server terminated: {err}");
        }
    });

    let dashboard = api::router(api::AppState {
        config: config.clone(),
        store: store.clone(),
        attribution: attribution.clone(),
    });
    let router = web::router(web::AppState {
        config: config.clone(),
        store: store.clone(),
        dashboard,
    });

    tracing::info!("HTTP listening on {}", &config.http_bind_addr);
    let http_listener = TcpListener::bind(config.http_bind_addr).await?;
    tokio::spawn(web::serve_http(http_listener, router.clone()));

    tracing::info!("HTTPS listening on {}", &config.https_bind_addr);
    let https_listener = TcpListener::bind(config.https_bind_addr).await?;
    let resolver = web::CaptureCertResolver::new(&config, identity.clone())?;
    let acceptor = TlsAcceptor::from(Arc::new(web::https_server_config(resolver)));
    tokio::spawn(web::serve_https(https_listener, acceptor, router));

    tracing::info!("SMTP listening on {}", &config.smtp_bind_addr);
    let smtp_listener = TcpListener::bind(config.smtp_bind_addr).await?;
    tokio::spawn(smtp::serve(
        smtp_listener,
        config.clone(),
        store.clone(),
        identity,
    ));

    let feed_client = Arc::new(FeedClient::new(config.clone())?);
    tokio::spawn(feeds::refresh_prefixes_periodically(
        feed_client.clone(),
        attribution.clone(),
    ));
    tokio::spawn(feeds::refresh_as_names_periodically(
        feed_client.clone(),
        attribution.clone(),
    ));
    tokio::spawn(feeds::refresh_resolver_ranges_periodically(
        feed_client,
        attribution,
    ));

    tokio::spawn(stop_stale_tests_periodically(config, store));

    signal::ctrl_c().await?;
    tracing::info!("goodbye");
    Ok(())
}

fn tracing_init() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dcvtrace=info".into()),
        )
        .init();
}

fn config_init(program_name: &str, config_file: Option<String>) -> Result<SharedConfig> {
    match config_file {
        None => Err(anyhow!("usage: {program_name} /path/to/config.json")),
        Some(config_file) => {
            let config = Config::try_from_file(&config_file)?;
            tracing::debug!("loaded config from {config_file}");
            Ok(Arc::new(config))
        }
    }
}

/// Tests the operator forgot about are stopped after `test_max_age`, so
/// their endpoints stop accumulating evidence.
async fn stop_stale_tests_periodically(config: SharedConfig, store: DynStore) {
    let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        ticker.tick().await;
        let cutoff = OffsetDateTime::now_utc() - config.test_max_age;
        match store.write().await.stop_stale_tests(cutoff).await {
            Ok(0) => {}
            Ok(stopped) => tracing::info!("stopped {stopped} stale tests"),
            Err(err) => tracing::error!("error stopping stale tests: {err}"),
        }
    }
}
