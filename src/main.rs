//! NautilusLB - Kubernetes-native Layer-4 load balancer.
//!
//! This is the composition root: it loads configuration, builds the cluster
//! client, starts one proxy per listener configuration plus the shared
//! discoverer, and supervises shutdown.

use clap::Parser;
use nautiluslb::cluster::ApiClient;
use nautiluslb::config::{extract_port, load_config};
use nautiluslb::discovery::Discoverer;
use nautiluslb::proxy::Proxy;
use nautiluslb::shutdown::{shutdown_signal, ShutdownController, DRAIN_TIMEOUT};
use std::sync::Arc;

const BANNER: &str = r#"
 _   _             _   _ _           _     ____
| \ | | __ _ _   _| |_(_) |_   _ ___| |   | __ )
|  \| |/ _' | | | | __| | | | | / __| |   |  _ \
| |\  | (_| | |_| | |_| | | |_| \__ \ |___| |_) |
|_| \_|\__,_|\__,_|\__|_|_|\__,_|___/_____|____/
"#;

#[derive(Parser)]
#[command(
    name = "nautiluslb",
    version,
    about = "NautilusLB - Kubernetes-native Load Balancer",
    after_help = "Configuration:\n  \
        The application reads configuration from config.yaml in the current directory.\n  \
        It automatically discovers Kubernetes services with the annotation:\n  \
        nautiluslb.cloudresty.io/enabled=true\n\n\
        For more information, visit: https://github.com/cloudresty/nautiluslb"
)]
struct Cli {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _cli = Cli::parse();

    println!("{}", BANNER);
    println!("https://github.com/cloudresty/nautiluslb");
    println!();

    let log_level = if std::env::var("DEBUG").is_ok() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    // Fatal at startup: a malformed configuration or an unreachable
    // credential source exits non-zero.
    let config = load_config("config.yaml")?;

    let client = Arc::new(ApiClient::connect(&config.settings.kubeconfig_path)?);
    tracing::info!("initialized cluster client using context: {}", client.context());

    let controller = ShutdownController::new();

    let mut proxies = Vec::new();
    for listener_config in config.configurations {
        let name = listener_config.name.clone();
        let port = extract_port(&listener_config.listener_address).to_string();

        let proxy = Arc::new(Proxy::new(listener_config, controller.clone()));
        proxies.push(proxy.clone());

        // A bind failure takes down this proxy only; the others keep going.
        tokio::spawn(async move {
            if let Err(e) = proxy.clone().run().await {
                tracing::error!("load balancer '{}' failed: {:#}", proxy.name(), e);
            }
        });

        tracing::info!("started load balancer: {} > {}", name, port);
    }

    let discoverer = Discoverer::new(client, proxies, controller.clone());
    tokio::spawn(discoverer.run());

    shutdown_signal(controller.clone()).await;

    // The signal closed the accept loops, which in turn stop their probes.
    // Give the probes a bounded window to drain.
    controller.wait_for_drain(DRAIN_TIMEOUT).await;
    tracing::info!("shutdown complete");

    Ok(())
}
