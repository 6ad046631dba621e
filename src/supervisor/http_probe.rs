// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reference HTTP probe (§4.F): `GET http://<host>:<port>/`, compared against
//! the descriptor's expected status code.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::supervisor::probe::Probe;
use crate::supervisor::queue::{LastStatus, ServiceDescriptor, Supervisor};

/// Performs an HTTP GET and compares the response status to `pattern`.
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    /// Build a probe with a fresh `reqwest::Client` (per-check timeouts are set
    /// on the request itself, since each descriptor carries its own timeout).
    pub fn new() -> Self {
        Self { client: Client::new() }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn respond_once(listener: TcpListener, status_line: &'static str) {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = sock.read(&mut buf).await;
        let body = format!("{status_line}\r\ncontent-length: 0\r\n\r\n");
        let _ = sock.write_all(body.as_bytes()).await;
    }

    #[tokio::test]
    async fn matching_status_reports_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(respond_once(listener, "HTTP/1.1 200 OK"));

        let supervisor = Supervisor::new(Arc::new(crate::supervisor::probe::ProbeRegistry::with_defaults()));
        supervisor.queueservice("g/a", "HTTP", &addr.ip().to_string(), addr.port(), 5, 200, 60);
        let descriptor = ServiceDescriptor {
            uid: "g/a".into(),
            protocol: "HTTP".into(),
            host: addr.ip().to_string(),
            port: addr.port(),
            timeout: 5,
            pattern: 200,
            interval: 60,
            lastschedule: 0,
            laststatus: LastStatus::Unknown,
            fresh: true,
        };

        HttpProbe::new().police(descriptor, supervisor.clone());
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let results = supervisor.getresults();
        let entry = results["results"][0].as_array().unwrap();
        assert_eq!(entry[2], 1); // LastStatus::Ok encodes to 1
    }

    #[tokio::test]
    async fn mismatched_status_reports_fail() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(respond_once(listener, "HTTP/1.1 503 Service Unavailable"));

        let supervisor = Supervisor::new(Arc::new(crate::supervisor::probe::ProbeRegistry::with_defaults()));
        supervisor.queueservice("g/b", "HTTP", &addr.ip().to_string(), addr.port(), 5, 200, 60);
        let descriptor = ServiceDescriptor {
            uid: "g/b".into(),
            protocol: "HTTP".into(),
            host: addr.ip().to_string(),
            port: addr.port(),
            timeout: 5,
            pattern: 200,
            interval: 60,
            lastschedule: 0,
            laststatus: LastStatus::Unknown,
            fresh: true,
        };

        HttpProbe::new().police(descriptor, supervisor.clone());
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let results = supervisor.getresults();
        let entry = results["results"][0].as_array().unwrap();
        assert_eq!(entry[2], 0); // LastStatus::Fail encodes to 0
    }
}

impl Probe for HttpProbe {
    fn police(&self, descriptor: ServiceDescriptor, supervisor: Arc<Supervisor>) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let url = format!("http://{}:{}/", descriptor.host, descriptor.port);
            let result = client
                .get(&url)
                .timeout(Duration::from_secs(descriptor.timeout))
                .send()
                .await;

            let status = match result {
                Ok(resp) if resp.status().as_u16() == descriptor.pattern => LastStatus::Ok,
                Ok(resp) => {
                    debug!(url = %url, status = resp.status().as_u16(), expected = descriptor.pattern, "probe status mismatch");
                    LastStatus::Fail
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "probe request failed");
                    LastStatus::Fail
                }
            };
            supervisor.set_laststatus(&descriptor.uid, status);
        });
    }
}
