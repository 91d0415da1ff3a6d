//! Caddy admin API adapter

use super::{GatewayError, RouteGateway};
use crate::config::GatewayConfig;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the HTTP server we own inside the Caddy config
const SERVER_NAME: &str = "conduit";

/// Where requests for the bare hostname are sent
const HOMEPAGE: &str = "https://github.com/scherepi/conduit";

/// Caddy reverse proxy configured over its admin API
pub struct CaddyGateway {
    client: reqwest::Client,
    admin_url: String,
    cert_file: String,
    key_file: String,
}

impl CaddyGateway {
    /// Create a gateway for the admin API described by `config`
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            admin_url: config.admin_url.trim_end_matches('/').to_string(),
            cert_file: config.cert_file.clone(),
            key_file: config.key_file.clone(),
        })
    }

    fn routes_url(&self) -> String {
        format!(
            "{}/config/apps/http/servers/{}/routes",
            self.admin_url, SERVER_NAME
        )
    }

    fn base_config(&self, hostname: &str) -> Value {
        json!({
            "apps": {
                "http": {
                    "servers": {
                        SERVER_NAME: {
                            "listen": [":80", ":443"],
                            "routes": [{
                                "match": [{ "host": [hostname] }],
                                "handle": [{
                                    "handler": "static_response",
                                    "headers": { "Location": [HOMEPAGE] },
                                    "status_code": 302
                                }]
                            }]
                        }
                    }
                },
                "tls": {
                    "certificates": {
                        "load_files": [{
                            "certificate": self.cert_file,
                            "key": self.key_file,
                            "tags": ["global_cert"]
                        }]
                    },
                    "automation": {
                        "policies": [{
                            "subjects": [hostname, format!("*.{}", hostname)],
                            "issuers": [{ "module": "internal" }]
                        }]
                    }
                }
            }
        })
    }
}

/// Route that proxies `subdomain.hostname` to a local tunnel port
fn proxy_route(hostname: &str, subdomain: &str, port: u16) -> Value {
    json!({
        "match": [{ "host": [format!("{}.{}", subdomain, hostname)] }],
        "handle": [{
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": format!("localhost:{}", port) }]
        }]
    })
}

/// Index of the route matching `host`, if any
fn find_route(routes: &[Value], host: &str) -> Option<usize> {
    routes.iter().position(|route| {
        route["match"]
            .as_array()
            .map(|matchers| {
                matchers.iter().any(|m| {
                    m["host"]
                        .as_array()
                        .is_some_and(|hosts| hosts.iter().any(|h| h.as_str() == Some(host)))
                })
            })
            .unwrap_or(false)
    })
}

#[async_trait]
impl RouteGateway for CaddyGateway {
    async fn bootstrap(&self, hostname: &str) -> Result<(), GatewayError> {
        self.client
            .post(format!("{}/config/", self.admin_url))
            .json(&self.base_config(hostname))
            .send()
            .await?
            .error_for_status()?;

        info!("Initialized Caddy configuration for {}", hostname);
        Ok(())
    }

    async fn add_route(
        &self,
        hostname: &str,
        subdomain: &str,
        port: u16,
    ) -> Result<(), GatewayError> {
        // PUT on an index inserts before the existing route at that position
        self.client
            .put(format!("{}/0", self.routes_url()))
            .json(&proxy_route(hostname, subdomain, port))
            .send()
            .await?
            .error_for_status()?;

        info!("Added reverse proxy for {} on port {}", subdomain, port);
        Ok(())
    }

    async fn remove_route(&self, hostname: &str, subdomain: &str) -> Result<(), GatewayError> {
        let routes: Value = self
            .client
            .get(self.routes_url())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let routes = routes
            .as_array()
            .ok_or_else(|| GatewayError::InvalidResponse("routes is not an array".to_string()))?;

        let host = format!("{}.{}", subdomain, hostname);
        let Some(index) = find_route(routes, &host) else {
            warn!("No reverse proxy found for {}", subdomain);
            return Ok(());
        };

        debug!("Removing route {} for {}", index, host);
        self.client
            .delete(format!("{}/{}", self.routes_url(), index))
            .send()
            .await?
            .error_for_status()?;

        info!("Removed reverse proxy for {}", subdomain);
        Ok(())
    }
}
