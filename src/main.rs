//! Hexframe - a packet capture decoder
//!
//! This is the main entry point for the hexframe application.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn, Level};

use hexframe::capture::{self, Frame, FrameSource};
use hexframe::config::HexframeConfig;
use hexframe::core::engine::{drain_frames, DecodeEngine, FrameSummary};
use hexframe::protocols::ProtocolRegistry;
use hexframe::utils::metrics::{DecodeMetrics, MetricTimer};
use hexframe::utils::{format_bytes, logger};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Decodes captured network traffic into protocol header listings"
)]
struct Args {
    /// Path to the configuration file
    #[clap(short, long, default_value = "config/hexframe.toml")]
    config: String,

    /// Interface to capture frames from
    #[clap(short, long)]
    interface: Option<String>,

    /// PCAP file to read frames from
    #[clap(short, long)]
    pcap: Option<String>,

    /// BPF filter expression
    #[clap(short, long)]
    filter: Option<String>,

    /// Verbose output
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = Args::parse();

    let default_level: Level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    // Load configuration
    let mut config: HexframeConfig = if Path::new(&args.config).exists() {
        match HexframeConfig::from_file(&args.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load configuration: {}", e);
                HexframeConfig::default()
            }
        }
    } else {
        HexframeConfig::default()
    };

    // Override configuration with command line arguments
    if let Some(interface) = args.interface {
        config.capture.interface = Some(interface);
    }
    if let Some(pcap) = args.pcap {
        config.capture.pcap_file = Some(pcap);
    }
    if let Some(filter) = args.filter {
        config.capture.bpf_filter = Some(filter);
    }

    let log_level: Level = config
        .logging
        .log_level
        .parse::<Level>()
        .unwrap_or(default_level);
    logger::init_logging(log_level, config.logging.log_file.as_deref());

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        anyhow::bail!("invalid configuration");
    }

    info!("Starting hexframe");

    let registry: Arc<ProtocolRegistry> = Arc::new(ProtocolRegistry::builtin());
    let engine: Arc<DecodeEngine> = Arc::new(DecodeEngine::new(
        Arc::clone(&registry),
        &config.decode,
    ));
    let metrics: Arc<DecodeMetrics> = Arc::new(DecodeMetrics::new());

    // Open the frame source
    let mut source: Box<dyn FrameSource> = if let Some(file) = &config.capture.pcap_file {
        capture::create_file_source(file)?
    } else if let Some(interface) = &config.capture.interface {
        capture::create_interface_source(interface, config.capture.promiscuous)?
    } else {
        anyhow::bail!("no capture source configured");
    };
    if let Some(filter) = &config.capture.bpf_filter {
        source.set_filter(filter)?;
    }

    // Ctrl+C clears the running flag; the decode loop observes it between
    // frames
    let running: Arc<AtomicBool> = Arc::new(AtomicBool::new(true));
    {
        let running: Arc<AtomicBool> = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })
        .expect("Error setting Ctrl-C handler");
    }

    let (sender, receiver): (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) = mpsc::channel();
    source.start_capture(sender)?;

    let worker: tokio::task::JoinHandle<()> = {
        let engine: Arc<DecodeEngine> = Arc::clone(&engine);
        let metrics: Arc<DecodeMetrics> = Arc::clone(&metrics);
        let registry: Arc<ProtocolRegistry> = Arc::clone(&registry);
        let running: Arc<AtomicBool> = Arc::clone(&running);

        tokio::task::spawn_blocking(move || {
            drain_frames(&running, &receiver, Duration::from_millis(200), |frame: Frame| {
                let mut timer: MetricTimer =
                    MetricTimer::new(Arc::clone(&metrics), frame.view.size());
                match engine.process_frame(&frame) {
                    Ok(summary) => {
                        timer.set_headers(summary.state.headers().len());
                        log_summary(&registry, &summary);
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to decode frame");
                        metrics.record_dropped_frame();
                    }
                }
            });
        })
    };

    worker.await?;
    source.stop_capture()?;

    // Final statistics
    let stats = engine.get_stats();
    metrics.update_flow_count(stats.flows_tracked as u64);
    info!(
        "Decoded {} frames ({}) into {} headers",
        stats.frames_processed,
        format_bytes(metrics.bytes_processed()),
        stats.headers_decoded
    );
    info!(
        "{} truncated frames, {} invalid checksums, {} datagrams reassembled, {} reassembly timeouts",
        stats.truncated_frames,
        stats.invalid_checksums,
        stats.datagrams_reassembled,
        stats.reassembly_timeouts
    );
    for line in metrics.format().lines() {
        info!("{}", line);
    }

    info!("hexframe stopped");
    Ok(())
}

/// Log one frame's header chain, e.g. `ETHERNET:IP4:TCP:PAYLOAD`
fn log_summary(registry: &ProtocolRegistry, summary: &FrameSummary) {
    let chain: String = summary
        .state
        .headers()
        .iter()
        .map(|h| {
            registry
                .lookup(h.protocol)
                .map(|d| d.name)
                .unwrap_or("UNKNOWN")
        })
        .collect::<Vec<&str>>()
        .join(":");
    info!(frame = summary.frame_number, "{}", chain);

    for report in &summary.checksums {
        if report.is_invalid() {
            let name: &str = registry
                .lookup(report.protocol)
                .map(|d| d.name)
                .unwrap_or("UNKNOWN");
            warn!(
                frame = summary.frame_number,
                protocol = name,
                offset = report.offset,
                "invalid checksum"
            );
        }
    }

    if let Some(reassembled) = &summary.reassembled {
        info!(
            frame = summary.frame_number,
            bytes = reassembled.view.size(),
            headers = reassembled.state.headers().len(),
            "reassembled datagram decoded"
        );
    }
}
