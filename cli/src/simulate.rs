// Loopback provisioning simulation
//
// Runs a provisioner and a device session back to back over an in-memory
// link and pushes random provisioning PDUs through the full bearer stack.

use anyhow::{Context, Result};
use colored::*;
use meshbearer_core::bearer::gatt::payload_for_mtu;
use meshbearer_core::{
    AdvertisingBearer, Bearer, BearerConfig, BearerEvent, BearerSession, CloseReason, GattBearer,
    LinkControl, LogicalPdu, LoopbackLink, PduFramer, ProvisioningBearer,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BearerArg {
    Gatt,
    Adv,
}

impl BearerArg {
    pub fn from_setting(value: &str) -> Option<Self> {
        match value {
            "gatt" => Some(BearerArg::Gatt),
            "adv" => Some(BearerArg::Adv),
            _ => None,
        }
    }
}

pub struct SimulateOptions {
    pub bearer: BearerArg,
    pub mtu: u16,
    pub pdu_len: usize,
    pub count: usize,
    pub config: BearerConfig,
}

type Session<B> = BearerSession<ProvisioningBearer<B>>;

pub async fn run(options: SimulateOptions) -> Result<()> {
    let payload = payload_for_mtu(options.mtu);
    let (provisioner_link, device_link) = LoopbackLink::pair(payload);
    let wire = provisioner_link.clone();

    println!("{}", "Loopback provisioning simulation".bold());
    println!("  Bearer:    {:?}", options.bearer);
    println!("  MTU:       {} ({} byte link payload)", options.mtu, payload);
    println!("  PDUs:      {} x {} bytes", options.count, options.pdu_len);
    println!();

    tracing::info!(
        "Simulating {:?} provisioning: mtu {}, {} x {} byte PDUs",
        options.bearer,
        options.mtu,
        options.count,
        options.pdu_len
    );

    let summary = match options.bearer {
        BearerArg::Gatt => {
            let provisioner = GattBearer::new(Arc::new(provisioner_link), options.config.clone())
                .context("Invalid bearer settings")?;
            let device = GattBearer::new(Arc::new(device_link), options.config.clone())
                .context("Invalid bearer settings")?;
            exchange(provisioner, device, &options).await?
        }
        BearerArg::Adv => {
            let provisioner =
                AdvertisingBearer::new(Arc::new(provisioner_link), options.config.clone())
                    .context("Invalid bearer settings")?;
            let device = AdvertisingBearer::new(Arc::new(device_link), options.config.clone())
                .context("Invalid bearer settings")?;
            exchange(provisioner, device, &options).await?
        }
    };

    println!();
    println!("{}", "Summary".bold());
    println!("  PDUs delivered:  {}", summary);
    println!("  Frames written:  {}", wire.frames_written());
    Ok(())
}

async fn exchange<B: Bearer + 'static>(
    provisioner: B,
    device: B,
    options: &SimulateOptions,
) -> Result<usize> {
    let provisioner: Session<B> =
        BearerSession::new(ProvisioningBearer::new(provisioner), &options.config)?;
    let device: Session<B> = BearerSession::new(ProvisioningBearer::new(device), &options.config)?;

    let mut device_rx = device.subscribe().await;
    let mut provisioner_rx = provisioner.subscribe().await;
    device.open().await.context("Device failed to open")?;
    provisioner.open().await.context("Provisioner failed to open")?;
    println!(
        "  {} {} open, frame size {}",
        "✓".green(),
        provisioner.bearer().kind(),
        provisioner.bearer().max_frame_size()
    );

    let device_uuid = Uuid::new_v4();
    provisioner
        .bearer()
        .send_link_control(LinkControl::Open(device_uuid))
        .await
        .context("Link open failed")?;
    next_pdu("device", &mut device_rx).await?;
    device
        .send(&LinkControl::Ack.to_pdu())
        .await
        .context("Link ack failed")?;
    next_pdu("provisioner", &mut provisioner_rx).await?;
    println!("  {} Link established with {}", "✓".green(), device_uuid.to_string().bright_cyan());

    let frame_size = provisioner.bearer().max_frame_size();
    let mut delivered = 0;
    for index in 0..options.count {
        let pdu = LogicalPdu::provisioning(random_bytes(options.pdu_len));

        if let Err(e) = provisioner.send(&pdu).await {
            tracing::warn!("PDU {} refused by provisioner bearer: {}", index + 1, e);
            println!("  {} PDU {} refused: {}", "✗".red(), index + 1, e);
            continue;
        }
        let received = next_pdu("device", &mut device_rx).await?;
        if received != pdu {
            anyhow::bail!("PDU {} corrupted in transit", index + 1);
        }
        delivered += 1;
        println!(
            "  {} PDU {}: {} bytes in {} frame(s)",
            "✓".green(),
            index + 1,
            pdu.len(),
            PduFramer::frame_count(pdu.len(), frame_size)
        );
    }

    provisioner
        .bearer()
        .send_link_control(LinkControl::Close(CloseReason::Success))
        .await
        .context("Link close failed")?;
    next_pdu("device", &mut device_rx).await?;

    tracing::debug!("Closing simulated sessions ({} PDUs delivered)", delivered);
    provisioner.close().await;
    drain("provisioner", &mut provisioner_rx);
    wait_closed("device", &mut device_rx).await?;
    device.close().await;

    Ok(delivered)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

fn print_event(role: &str, event: &BearerEvent) {
    match event {
        BearerEvent::StateChanged { state, cause: None } => {
            println!("  {} {:<11} {}", "·".dimmed(), role, state);
        }
        BearerEvent::StateChanged {
            state,
            cause: Some(cause),
        } => {
            println!("  {} {:<11} {} ({})", "·".dimmed(), role, state, cause.to_string().yellow());
        }
        BearerEvent::PduReceived(pdu) => {
            println!(
                "  {} {:<11} received {} PDU {}",
                "·".dimmed(),
                role,
                pdu.pdu_type(),
                hex::encode(pdu.as_bytes()).dimmed()
            );
        }
        BearerEvent::ExchangeFailed(e) => {
            println!("  {} {:<11} exchange failed: {}", "✗".red(), role, e);
        }
    }
}

async fn next_event(rx: &mut mpsc::Receiver<BearerEvent>) -> Result<BearerEvent> {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .context("Timed out waiting for bearer event")?
        .context("Session listener closed")
}

async fn next_pdu(role: &str, rx: &mut mpsc::Receiver<BearerEvent>) -> Result<LogicalPdu> {
    loop {
        let event = next_event(rx).await?;
        print_event(role, &event);
        if let BearerEvent::PduReceived(pdu) = event {
            return Ok(pdu);
        }
    }
}

async fn wait_closed(role: &str, rx: &mut mpsc::Receiver<BearerEvent>) -> Result<()> {
    loop {
        let event = next_event(rx).await?;
        print_event(role, &event);
        if let BearerEvent::StateChanged {
            state: meshbearer_core::BearerState::Closed,
            ..
        } = event
        {
            return Ok(());
        }
    }
}

fn drain(role: &str, rx: &mut mpsc::Receiver<BearerEvent>) {
    while let Ok(event) = rx.try_recv() {
        print_event(role, &event);
    }
}
