#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Seeds the store's `self` documents for a local/dev run: the membership
//! configuration and a sample watched service, matching the shapes in §6.1.

use std::collections::BTreeMap;

use tracing::info;

use gossip_babbler::config::{CertificatePaths, GossipConfig, ServiceEntry, ServiceListDocument};
use gossip_babbler::store::{Store, MEMBERSHIP_DB, WATCHLIST_DB};

fn env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt().with_target(false).compact().try_init();

    let store_path = env("STORE_PATH", "./data");
    let store = Store::open(&store_path).expect("failed to open store");

    let config = GossipConfig {
        host: vec!["localhost".to_string()],
        port: vec![50000],
        maxconv: 25,
        debug: 0,
        verbose: 1,
        version: 1,
        certificates: CertificatePaths {
            key: "certificates/localserv.pem".to_string(),
            certificate: "certificates/localservcert.pem".to_string(),
            ca: "certificates/astaro-ca.pem".to_string(),
        },
    };
    let configdb = store.database(MEMBERSHIP_DB).expect("failed to open membership db");
    let doc = serde_json::to_value(&config).expect("GossipConfig always serializes");
    configdb.write("self", &doc).await.expect("failed to write self config");
    info!("wrote membership self document");

    let mut services = BTreeMap::new();
    services.insert(
        "sample_service".to_string(),
        ServiceEntry { proto: "HTTP".to_string(), ipv4: "www.google.at".to_string(), port: 80, timeout: 600 },
    );
    let service_doc = ServiceListDocument { services };

    let servdb = store.database(WATCHLIST_DB).expect("failed to open watch-list db");
    let doc = serde_json::to_value(&service_doc).expect("ServiceListDocument always serializes");
    servdb.write("self", &doc).await.expect("failed to write self service list");
    info!("wrote watch-list self document");

    info!("database configuration successfully completed");
}
