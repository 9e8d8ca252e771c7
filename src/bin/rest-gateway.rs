//! Standalone REST gateway.
//!
//! Configuration comes from the environment:
//!
//! * `GATEWAY_DESCRIPTOR_SET` - path to an encoded `FileDescriptorSet`
//! * `GATEWAY_ENDPOINTS` - JSON array of endpoint records (`http` rule layout)
//! * `GATEWAY_UPSTREAM` - gRPC server every bound service is forwarded to
//! * `GATEWAY_LISTEN` - listen address, `0.0.0.0:8080` by default

use std::collections::BTreeSet;
use std::env;

use anyhow::{Context, Result};
use grpc_rest_gateway::{EndpointSpec, Gateway, GrpcClient};
use tracing::info;

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let descriptors = env::var("GATEWAY_DESCRIPTOR_SET").context("GATEWAY_DESCRIPTOR_SET is not set")?;
    let endpoints = env::var("GATEWAY_ENDPOINTS").context("GATEWAY_ENDPOINTS is not set")?;
    let upstream = env::var("GATEWAY_UPSTREAM").context("GATEWAY_UPSTREAM is not set")?;
    let listen = env::var("GATEWAY_LISTEN").unwrap_or_else(|_| DEFAULT_LISTEN.to_string());

    let endpoints: Vec<EndpointSpec> =
        serde_json::from_str(&endpoints).context("GATEWAY_ENDPOINTS is not a valid endpoint list")?;

    let insecure = !upstream.starts_with("https://");
    let services: BTreeSet<String> = endpoints
        .iter()
        .filter_map(|endpoint| {
            let selector = endpoint.selector.trim_start_matches('.');
            selector.rsplit_once('.').map(|(service, _)| service.to_string())
        })
        .collect();

    let mut builder = Gateway::builder()
        .with_descriptor_set_file(&descriptors)
        .with_context(|| format!("reading descriptor set {descriptors}"))?
        .add_endpoints(endpoints);

    for service in services {
        info!(service = %service, upstream = %upstream, "forwarding service");
        let client = GrpcClient::connect_lazy(upstream.clone(), insecure)?;
        builder = builder.add_grpc_client(service, client);
    }

    builder.serve(listen).await?;
    Ok(())
}
