/// Loopback transfer between two in-process endpoints
///
/// Both endpoints run their own multiplexer over a `MemoryTransport` pair, so
/// every frame crosses the XML codec exactly as it would on a live session.

use anyhow::{bail, Context, Result};
use ibb_core::{
    Carrier, IbbConfig, IbbPayload, Jid, MemoryTransport, Multiplexer, MultiplexerStats,
};
use serde::Serialize;
use std::time::Instant;
use tracing::info;

pub const SENDER_ADDR: &str = "alice@example.net/a";
pub const RECEIVER_ADDR: &str = "bob@example.net/b";

/// How the sender opens its stream
#[derive(Debug, Clone, Copy)]
pub struct LoopbackOptions {
    pub carrier: Carrier,
    /// 0 selects the configured default
    pub block_size: u16,
}

impl LoopbackOptions {
    pub fn from_config(config: &IbbConfig) -> Self {
        Self {
            carrier: config.default_carrier,
            block_size: 0,
        }
    }
}

/// Outcome of one loopback transfer
#[derive(Debug, Serialize)]
pub struct LoopbackReport {
    pub sid: String,
    pub carrier: Carrier,
    pub block_size: u16,
    pub bytes: usize,
    pub frames: usize,
    pub elapsed_ms: u128,
    /// Sender side, taken before close
    pub sender: MultiplexerStats,
    /// Receiver side, taken before close
    pub receiver: MultiplexerStats,
}

/// Push `input` from the sender to the receiver and check it arrives intact
pub async fn run_loopback(
    config: &IbbConfig,
    options: LoopbackOptions,
    input: Vec<u8>,
) -> Result<LoopbackReport> {
    let sender_addr: Jid = SENDER_ADDR.parse()?;
    let receiver_addr: Jid = RECEIVER_ADDR.parse()?;

    let (sender_transport, receiver_transport) =
        MemoryTransport::pair(sender_addr, receiver_addr.clone());
    let sender = Multiplexer::new(sender_transport.clone(), config.clone());
    let receiver = Multiplexer::new(receiver_transport.clone(), config.clone());
    sender.register_routes(sender_transport.router());
    receiver.register_routes(receiver_transport.router());

    let listener = receiver.listen(&receiver_addr);
    let started = Instant::now();

    let outbound = sender
        .open(&receiver_addr, options.carrier, options.block_size)
        .await
        .context("Failed to open stream")?;
    let inbound = listener.accept().await.context("Failed to accept stream")?;
    info!(
        "Stream {} open ({}, block size {})",
        outbound.sid(),
        outbound.carrier(),
        outbound.block_size()
    );

    let writer = {
        let outbound = outbound.clone();
        let input = input.clone();
        tokio::spawn(async move { outbound.write(&input).await })
    };

    let mut received = vec![0u8; input.len()];
    inbound
        .read_exact(&mut received)
        .await
        .context("Failed to read stream")?;
    writer
        .await
        .context("Writer task failed")?
        .context("Failed to write stream")?;

    let sender_stats = sender.stats();
    let receiver_stats = receiver.stats();

    outbound.close().await.context("Failed to close stream")?;
    let mut tail = [0u8; 1];
    if inbound.read(&mut tail).await? != 0 {
        bail!("Receiver saw bytes past the end of the input");
    }
    if received != input {
        bail!("Received bytes differ from the input");
    }

    let frames = sender_transport
        .sent()
        .iter()
        .filter(|sent| matches!(IbbPayload::from_xml(&sent.xml), Ok(IbbPayload::Data(_))))
        .count();

    Ok(LoopbackReport {
        sid: outbound.sid().to_string(),
        carrier: outbound.carrier(),
        block_size: outbound.block_size(),
        bytes: input.len(),
        frames,
        elapsed_ms: started.elapsed().as_millis(),
        sender: sender_stats,
        receiver: receiver_stats,
    })
}
