//! Line-based chat over polyfilled data channels
//!
//! # Usage
//!
//! ```bash
//! # Wait for channels opened by others
//! cargo run --bin dcpf-chat --features cli -- --local-id alice
//!
//! # Open a channel to alice and type lines into it
//! cargo run --bin dcpf-chat --features cli -- \
//!   --local-id bob \
//!   --remote-id alice \
//!   --label chat \
//!   --rendezvous-url ws://localhost:8080
//! ```

use anyhow::Context;
use clap::Parser;
use datachannel_polyfill::{
    DataChannel, DataChannelInit, DetachedNegotiator, Frame, PeerIdentity, Polyfill,
    PolyfillConfig, SignalingState,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Data channel polyfill chat client
///
/// Lines read from stdin go to every open channel; messages from any channel
/// are printed to stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Rendezvous service WebSocket URL
    #[arg(long, default_value = "ws://localhost:8080", env = "DCPF_RENDEZVOUS_URL")]
    rendezvous_url: String,

    /// Local peer identity
    #[arg(long, env = "DCPF_LOCAL_ID")]
    local_id: String,

    /// Remote peer identity; opens a channel to it when set
    #[arg(long, env = "DCPF_REMOTE_ID")]
    remote_id: Option<String>,

    /// Label of the outbound channel
    #[arg(long, default_value = "chat", env = "DCPF_LABEL")]
    label: String,

    /// Request an unreliable channel
    #[arg(long, default_value_t = false, env = "DCPF_UNRELIABLE")]
    unreliable: bool,

    /// Address prefix used by the rendezvous service
    #[arg(long, default_value = "pc.", env = "DCPF_ADDRESS_PREFIX")]
    address_prefix: String,

    /// Log as JSON lines
    #[arg(long, default_value_t = false, env = "DCPF_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = PolyfillConfig {
        rendezvous_url: args.rendezvous_url.clone(),
        address_prefix: args.address_prefix.clone(),
        ..Default::default()
    };
    let polyfill = Polyfill::new(config).context("invalid configuration")?;
    let pc = polyfill.peer_connection(Arc::new(DetachedNegotiator));

    pc.on_error(|e| warn!("Signaling error: {}", e));
    pc.on_datachannel(|channel| {
        info!("Inbound channel '{}'", channel.label());
        watch_channel(&channel);
    });

    pc.bind_local_identity(PeerIdentity::new(args.local_id.clone()))?;
    let state = pc.wait_for_signaling(SignalingState::Registered).await;
    if state != SignalingState::Registered {
        anyhow::bail!("could not register with {}", args.rendezvous_url);
    }
    info!("Registered as {}", pc.local_address().unwrap_or_default());

    if let Some(remote_id) = &args.remote_id {
        pc.bind_remote_identity(PeerIdentity::new(remote_id.clone()));
        let channel = pc.create_data_channel(
            &args.label,
            DataChannelInit::reliable(!args.unreliable),
        )?;
        let label = channel.label().to_string();
        channel.on_open(move || info!("Channel '{}' open", label));
        watch_channel(&channel);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let open: Vec<DataChannel> =
                    pc.channels().into_iter().filter(|c| c.is_open()).collect();
                if open.is_empty() {
                    warn!("No open channel; dropped line");
                }
                for channel in open {
                    if let Err(e) = channel.send_text(line.clone()).await {
                        warn!("Send on '{}' failed: {}", channel.label(), e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    pc.close().await;
    Ok(())
}

fn watch_channel(channel: &DataChannel) {
    let label = channel.label().to_string();
    channel.on_message(move |frame| match frame {
        Frame::Text(text) => println!("[{}] {}", label, text),
        Frame::Binary(data) => println!("[{}] <{} bytes>", label, data.len()),
    });

    let label = channel.label().to_string();
    channel.on_close(move || info!("Channel '{}' closed", label));

    let label = channel.label().to_string();
    channel.on_error(move |e| warn!("Channel '{}' error: {}", label, e));
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
