/// Keyword node service binary
///
/// Runs the keyword-spotting pipeline on a microphone (or a replayed WAV
/// file) and streams detections to the hub found through discovery.

use anyhow::{bail, Context};
use keyword_node::{
    link_params, DiscoveryListener, HubLink, KeywordNode, Microphone, NodeConfig, NullClassifier,
    SwitchResponder, WavMicrophone,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("keyword_node=info".parse()?))
        .init();

    info!("Starting keyword node service");

    let mut config = NodeConfig::load().context("Failed to load configuration")?;
    let mic = open_microphone(&mut config)?;

    // Hub link and discovery
    let (link, handle) = HubLink::new(config.hub.clone(), link_params(&config));
    let discovery = DiscoveryListener::bind(&config.hub)
        .await
        .context("Failed to bind discovery socket")?;
    let discovery_task = tokio::spawn(discovery.run(handle.conn_tx.clone()));
    let link_task = tokio::spawn(link.run());

    warn!("No classifier model bundled, every window scores as null");
    let classifier = NullClassifier::new(&config.model);
    let responder = SwitchResponder::new(&config.model);

    let mut node = KeywordNode::new(config, Box::new(classifier), Box::new(responder))
        .context("Failed to initialize keyword node")?
        .with_events(handle.audio_tx.clone())
        .with_callback(Box::new(|category, power| {
            info!("Command '{}' heard (power {:.1})", category, power);
        }));

    node.start(mic).context("Failed to start keyword node")?;
    info!("Keyword node running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    // Dropping every audio sender ends the link loop
    node.stop();
    drop(node);
    drop(handle);

    discovery_task.abort();
    match link_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Hub link failed: {}", e),
        Err(e) => error!("Hub link task panicked: {}", e),
    }

    info!("Keyword node service stopped");
    Ok(())
}

/// Replay `replay_wav` when set, otherwise open the default input device
fn open_microphone(config: &mut NodeConfig) -> anyhow::Result<Box<dyn Microphone>> {
    if let Some(path) = config.replay_wav.clone() {
        let wav = WavMicrophone::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        if wav.sample_rate() != config.model.sample_rate {
            bail!(
                "{} is {} Hz, model expects {} Hz",
                path.display(),
                wav.sample_rate(),
                config.model.sample_rate
            );
        }

        config.capture.channels = wav.channels();
        config.capture.channel_select = config.capture.channel_select.min(wav.channels().saturating_sub(1));
        return Ok(Box::new(wav));
    }

    open_device(config)
}

#[cfg(feature = "mic")]
fn open_device(config: &mut NodeConfig) -> anyhow::Result<Box<dyn Microphone>> {
    let mic = keyword_node::CpalMicrophone::open(&config.capture).context("Failed to open microphone")?;
    Ok(Box::new(mic))
}

#[cfg(not(feature = "mic"))]
fn open_device(_config: &mut NodeConfig) -> anyhow::Result<Box<dyn Microphone>> {
    bail!(
        "No audio input: set {} to a WAV file or build with --features mic",
        keyword_node::config::WAV_ENV
    )
}
