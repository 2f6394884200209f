#![warn(missing_docs)]

//! cfs-qos: drives a synthetic flood through the QoS controller against a
//! simulated device and reports what each volume achieved.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use claudefs_qos::{
    InFlightIo, IoProcessor, QosConfig, QosController, QosError, QosMetrics, VolumeConfig,
    VolumeId,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cfs-qos")]
#[command(about = "ClaudeFS QoS dispatcher load generator", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "/etc/claudefs/qos.toml")]
    config: PathBuf,

    #[arg(short, long, default_value = "10")]
    duration_secs: u64,

    /// Simulated device service time per request.
    #[arg(short, long, default_value = "100")]
    service_us: u64,

    /// Print exported metrics as JSON when done.
    #[arg(long, env = "CFS_QOS_JSON")]
    json: bool,
}

#[derive(Debug, Clone, Copy)]
struct BlockIo {
    offset: u64,
    len: u32,
}

struct SimulatedDevice {
    service_time: Duration,
    bytes: AtomicU64,
}

impl IoProcessor<BlockIo> for SimulatedDevice {
    fn process_io(&self, io: InFlightIo<BlockIo>) {
        thread::sleep(self.service_time);
        let request = io.request();
        self.bytes
            .fetch_add(u64::from(request.payload.len), Ordering::Relaxed);
        tracing::trace!(
            volume = %request.volume_id,
            offset = request.payload.offset,
            "simulated io complete"
        );
        let _ = io.complete();
    }
}

fn default_volumes() -> Vec<VolumeConfig> {
    vec![
        VolumeConfig {
            volume_id: 1,
            assured_iops: 1_000,
            throttle_iops: 0,
            priority: 1,
            capacity: None,
        },
        VolumeConfig {
            volume_id: 2,
            assured_iops: 1_000,
            throttle_iops: 3_000,
            priority: 5,
            capacity: None,
        },
    ]
}

/// Submits requests for `volume_id` until `deadline`, backing off while the queue is full.
fn flood(qos: &QosController<BlockIo>, volume_id: VolumeId, deadline: Instant) -> u64 {
    let mut submitted = 0u64;
    while Instant::now() < deadline {
        let io = BlockIo {
            offset: submitted * 4096,
            len: 4096,
        };
        match qos.enqueue_io(qos.new_request(volume_id, io)) {
            Ok(()) => submitted += 1,
            Err(QosError::QueueFull { .. }) => thread::sleep(Duration::from_micros(200)),
            Err(e) => {
                tracing::warn!("Load generator for {} stopped: {}", volume_id, e);
                break;
            }
        }
    }
    submitted
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("ClaudeFS QoS load generator starting...");

    let cli = Cli::parse();
    let mut config = if cli.config.exists() {
        QosConfig::from_file(&cli.config)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
        QosConfig::default()
    };
    if config.volumes.is_empty() {
        config.volumes = default_volumes();
        config.validate()?;
    }
    let volumes = config.volumes.clone();

    let device = Arc::new(SimulatedDevice {
        service_time: Duration::from_micros(cli.service_us),
        bytes: AtomicU64::new(0),
    });
    let processor: Arc<dyn IoProcessor<BlockIo>> = device.clone();
    let metrics = Arc::new(QosMetrics::new());
    let qos = Arc::new(QosController::new(config, processor, metrics.clone())?);

    for volume in &volumes {
        qos.register_volume(volume.id(), volume.params(), volume.capacity)?;
    }
    qos.run_scheduler()?;

    let duration = Duration::from_secs(cli.duration_secs);
    let deadline = Instant::now() + duration;
    let mut generators = Vec::with_capacity(volumes.len());
    for volume in &volumes {
        let qos = Arc::clone(&qos);
        let volume_id = volume.id();
        let handle = thread::Builder::new()
            .name(format!("cfs-qos-load-{}", volume_id.0))
            .spawn(move || flood(&qos, volume_id, deadline))?;
        generators.push((volume_id, handle));
    }

    let mut submitted = HashMap::new();
    for (volume_id, handle) in generators {
        let count = handle
            .join()
            .map_err(|_| anyhow::anyhow!("load generator for {} panicked", volume_id))?;
        submitted.insert(volume_id, count);
    }

    qos.quiesce_all();
    qos.stop();

    let secs = duration.as_secs_f64().max(f64::EPSILON);
    for volume in &volumes {
        let id = volume.id();
        let stats = metrics.volume(id).unwrap_or_default();
        tracing::info!(
            volume = %id,
            submitted = submitted.get(&id).copied().unwrap_or(0),
            completed = stats.completed,
            rejected = stats.rejected,
            iops = stats.completed as f64 / secs,
            assured_iops = volume.assured_iops,
            throttle_iops = volume.throttle_iops,
            avg_wait_us = stats.avg_wait_ns() / 1_000,
            "volume summary"
        );
    }
    tracing::info!(
        p99_latency_us = metrics.p99_latency_ns() / 1_000,
        bytes = device.bytes.load(Ordering::Relaxed),
        "ClaudeFS QoS load generator finished"
    );

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&metrics.export())?);
    }
    Ok(())
}
