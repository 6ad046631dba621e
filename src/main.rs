#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Gossip babbler entrypoint (systemd-friendly): brings up the mutual-TLS
//! gossip listener, then the supervisor, and runs until signalled.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use gossip_babbler::gossip::babblemouth::Babblemouth;
use gossip_babbler::gossip::contact::{common_name_from_cert, ContactSigner};
use gossip_babbler::gossip::tls::TlsMaterial;
use gossip_babbler::config::GossipConfig;
use gossip_babbler::monitoring::metrics::Metrics;
use gossip_babbler::monitoring::server;
use gossip_babbler::store::{Store, RESULTS_DB, WATCHLIST_DB};
use gossip_babbler::supervisor::probe::ProbeRegistry;
use gossip_babbler::supervisor::queue::Supervisor;
use gossip_babbler::supervisor::{run_supervisor_loop, WatchlistChangeHandler};

fn env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init();

    let config_path = env("GOSSIP_CONFIG", "./config.toml");
    let config = match GossipConfig::load_toml(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = ?e, path = %config_path, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let store_path = env("STORE_PATH", "./data");
    let store = match Store::open(&store_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = ?e, "failed to open store");
            std::process::exit(1);
        }
    };

    let tls = match TlsMaterial::load(
        &config.certificates.certificate,
        &config.certificates.key,
        &config.certificates.ca,
    ) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!(error = ?e, "failed to load TLS material");
            std::process::exit(1);
        }
    };

    let my_cert_der = tls.certs[0].as_ref().to_vec();
    let id = match common_name_from_cert(&my_cert_der) {
        Ok(id) => id,
        Err(e) => {
            error!(error = ?e, "failed to read Common Name from own certificate");
            std::process::exit(1);
        }
    };

    let signer = match ContactSigner::load(std::path::Path::new(&config.certificates.key)) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = ?e, "failed to load RSA signing key");
            std::process::exit(1);
        }
    };

    let metrics = match Metrics::new() {
        Ok(m) => Arc::new(m),
        Err(e) => {
            error!(error = ?e, "failed to initialize metrics");
            std::process::exit(1);
        }
    };

    let metrics_addr: SocketAddr = env("METRICS_ADDR", "0.0.0.0:9100")
        .parse()
        .expect("METRICS_ADDR must be a valid socket address");
    {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(metrics_addr, metrics).await {
                error!(error = %e, "monitoring surface stopped");
            }
        });
    }

    let cert_dir = PathBuf::from(env("KNOWN_CERT_DIR", "./data/known_certs"));

    let babblemouth = Babblemouth::new(
        id.clone(),
        config.clone(),
        store.clone(),
        tls,
        signer,
        my_cert_der,
        cert_dir,
        metrics.clone(),
    );
    babblemouth.register_default_handlers();

    info!(%id, host = ?config.host, port = ?config.port, "gossip babbler starting");
    if let Err(e) = babblemouth.start_gossip().await {
        error!(error = ?e, "failed to start gossip subsystem");
        std::process::exit(1);
    }

    // Mirrors the original bootstrap sequence: let the gossip listener settle
    // before bringing up the supervisor.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let probes = Arc::new(ProbeRegistry::with_defaults());
    let supervisor = Supervisor::new(probes);

    let watchlist = match store.database(WATCHLIST_DB) {
        Ok(db) => db,
        Err(e) => {
            error!(error = ?e, "failed to open watch-list database");
            std::process::exit(1);
        }
    };
    let results = match store.database(RESULTS_DB) {
        Ok(db) => db,
        Err(e) => {
            error!(error = ?e, "failed to open results database");
            std::process::exit(1);
        }
    };

    let watch_handler = Arc::new(WatchlistChangeHandler::new(supervisor.clone(), watchlist.clone()));
    watch_handler.reconcile_document("self");
    let _watch_shutdown = watchlist.watch(watch_handler, None);

    let shutdown = Arc::new(AtomicBool::new(false));
    let loop_shutdown = shutdown.clone();
    let supervisor_task = tokio::spawn(run_supervisor_loop(supervisor, results, loop_shutdown));

    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    shutdown.store(true, Ordering::Relaxed);
    babblemouth.shutdown();
    let _ = supervisor_task.await;
}
