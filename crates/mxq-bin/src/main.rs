//! Command-line entry point for mxq.
//!
//! # Usage
//!
//! Run a demonstration queue on simulated hardware:
//! ```bash
//! mxq demo --samples 2 --images 20
//! ```
//!
//! Print the configuration after file and environment layering:
//! ```bash
//! mxq --config config/beamline.toml show-config
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use mxq_core::config::Settings;
use mxq_core::events::Signal;
use mxq_core::logging;
use mxq_core::types::MotorRole;
use mxq_diffractometer::{CentringMethod, Diffractometer, DiffractometerEvent};
use mxq_driver_mock::{
    standard_motors, MockCollector, MockLims, MockMode, MockPhaseControl, MockSampleChanger,
    SampleGeometry, SimulatedSampleLoop,
};
use mxq_queue::entry::walk;
use mxq_queue::{Beamline, QueueEntry, QueueEvent, QueueManager, QueueState};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mxq")]
#[command(about = "Beamline experiment queue with diffractometer centring", long_about = None)]
struct Cli {
    /// Beamline configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount, centre and collect on simulated hardware
    Demo {
        /// Samples to queue, mounted from basket 1
        #[arg(long, default_value = "1")]
        samples: u32,

        /// Images per data collection
        #[arg(long, default_value = "10")]
        images: u32,

        /// Timed motion, phase changes and exposures
        #[arg(long)]
        realistic: bool,

        /// Seed for the simulated loop position
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config)?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::Demo {
            samples,
            images,
            realistic,
            seed,
        } => run_demo(&settings, samples, images, realistic, seed).await,
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

/// Loop placement on the goniometer, drawn from `seed`.
fn sample_geometry(settings: &Settings, seed: Option<u64>) -> SampleGeometry {
    let mut rng = match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };
    let d = &settings.diffractometer;
    SampleGeometry {
        pixels_per_mm: [d.pixels_per_mm_x, d.pixels_per_mm_y],
        beam_position: d.beam_position,
        chi_angle: d.chi_angle,
        table_offset: [rng.gen_range(-0.5..0.5), rng.gen_range(-0.5..0.5)],
        crystal_offset: [rng.gen_range(-0.1..0.1), rng.gen_range(-0.1..0.1)],
    }
}

async fn run_demo(
    settings: &Settings,
    samples: u32,
    images: u32,
    realistic: bool,
    seed: Option<u64>,
) -> Result<()> {
    let mode = if realistic {
        MockMode::Realistic
    } else {
        MockMode::Instant
    };
    info!(samples, images, ?mode, "Starting demo beamline");

    let motors = standard_motors(mode);
    let geometry = sample_geometry(settings, seed);
    let loop_finder = SimulatedSampleLoop::new(
        geometry,
        motors.iter().map(|(r, m)| (*r, m.clone())).collect(),
    );
    let phase = if realistic {
        MockPhaseControl::builder()
            .transition_time(Duration::from_millis(500))
            .build()
    } else {
        MockPhaseControl::new()
    };

    let mut builder = Diffractometer::builder(settings)
        .phase_control(Arc::new(phase))
        .loop_finder(Arc::new(loop_finder));
    for (role, motor) in &motors {
        builder = builder.motor(*role, Arc::new(motor.clone()));
    }
    let diffractometer = builder.init().await?;

    let lims = Arc::new(MockLims::new());
    let beamline = Beamline {
        diffractometer: Some(diffractometer.clone()),
        lims: Some(lims.clone()),
        collector: Some(Arc::new(MockCollector::new(mode))),
        sample_changer: Some(Arc::new(MockSampleChanger::new(mode))),
        workflow: None,
    };
    let manager = QueueManager::new(beamline, settings);

    for n in 1..=samples {
        let location = format!("1:{:02}", n);
        let sample = QueueEntry::sample(format!("sample-{}", n), Some(location.as_str()));
        let group = QueueEntry::task_group(format!("group-{}", n));
        group.enqueue(QueueEntry::centring(CentringMethod::Automatic));
        group.enqueue(QueueEntry::data_collection(
            mxq_core::CollectionParameters {
                prefix: format!("sample-{}", n),
                num_images: images,
                osc_range: 0.1,
                exposure_time: 0.04,
                ..Default::default()
            },
        ));
        sample.enqueue(group);
        manager.enqueue(sample)?;
    }

    let mut queue_events = manager.subscribe();
    let mut diffractometer_events = diffractometer.subscribe();
    manager.execute(None)?;

    let state = loop {
        tokio::select! {
            event = queue_events.recv() => match event {
                Ok(QueueEvent::ExecutionFinished) | Err(RecvError::Closed) => break manager.state(),
                Ok(event) => info!(signal = event.signal_name(), ?event, "Queue"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Queue events dropped"),
            },
            Ok(event) = diffractometer_events.recv() => log_diffractometer(&event),
            _ = signal::ctrl_c() => {
                warn!("Interrupted, stopping the queue");
                manager.stop().await;
            }
        }
    };

    println!();
    for entry in walk(&manager.entries()) {
        println!("{:<24} {}", entry.name(), entry.status());
    }
    let centred = diffractometer.centring_status();
    if centred.valid {
        for role in MotorRole::CENTRING {
            if let Some(position) = centred.motors.get(&role) {
                println!("{:<24} {:.4}", role, position);
            }
        }
    }
    println!(
        "{} collection(s), {} image(s) recorded",
        lims.collections().len(),
        lims.images().len()
    );

    match state {
        QueueState::Stopped => Err(anyhow!("queue stopped before completion")),
        _ => Ok(()),
    }
}

fn log_diffractometer(event: &DiffractometerEvent) {
    match event {
        DiffractometerEvent::ProgressMessage(message) => info!("{}", message),
        DiffractometerEvent::CentringFailed { method, reason } => {
            warn!(%method, %reason, "Centring failed")
        }
        other => info!(signal = other.signal_name(), "Diffractometer"),
    }
}
