//! Standard handlers driving simulated beamline devices.

use mxq_core::capabilities::{CollectionParameters, WorkflowOutcome};
use mxq_core::config::Settings;
use mxq_core::types::{MotorRole, Phase};
use mxq_diffractometer::{CentringMethod, Diffractometer};
use mxq_driver_mock::{
    standard_motors, ErrorConfig, ErrorScenario, MockCollector, MockLims, MockMode, MockMotor,
    MockPhaseControl, MockSampleChanger, MockWorkflowRunner, SampleGeometry, SimulatedSampleLoop,
};
use mxq_queue::{Beamline, EntryRef, EntryStatus, QueueEntry, QueueManager, QueueState};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn geometry(settings: &Settings) -> SampleGeometry {
    SampleGeometry {
        pixels_per_mm: [
            settings.diffractometer.pixels_per_mm_x,
            settings.diffractometer.pixels_per_mm_y,
        ],
        beam_position: settings.diffractometer.beam_position,
        chi_angle: settings.diffractometer.chi_angle,
        table_offset: [0.8, -0.5],
        crystal_offset: [0.05, 0.03],
    }
}

struct Station {
    beamline: Beamline,
    motors: BTreeMap<MotorRole, MockMotor>,
    phase: MockPhaseControl,
    lims: Arc<MockLims>,
    collector: Arc<MockCollector>,
    changer: Arc<MockSampleChanger>,
}

async fn station(settings: &Settings, collector: MockCollector) -> Station {
    let motors = standard_motors(MockMode::Instant);
    let phase = MockPhaseControl::new();
    let finder = SimulatedSampleLoop::new(
        geometry(settings),
        motors.iter().map(|(r, m)| (*r, m.clone())).collect(),
    )
    .hidden_for(1);

    let mut builder = Diffractometer::builder(settings)
        .phase_control(Arc::new(phase.clone()))
        .loop_finder(Arc::new(finder));
    for (role, motor) in &motors {
        builder = builder.motor(*role, Arc::new(motor.clone()));
    }
    let diffractometer = builder.init().await.unwrap();

    let lims = Arc::new(MockLims::new());
    let collector = Arc::new(collector);
    let changer = Arc::new(MockSampleChanger::new(MockMode::Instant));
    let beamline = Beamline {
        diffractometer: Some(diffractometer),
        lims: Some(lims.clone()),
        collector: Some(collector.clone()),
        sample_changer: Some(changer.clone()),
        workflow: None,
    };
    Station {
        beamline,
        motors,
        phase,
        lims,
        collector,
        changer,
    }
}

fn collection(prefix: &str, num_images: u32) -> EntryRef {
    QueueEntry::data_collection(CollectionParameters {
        prefix: prefix.to_string(),
        num_images,
        osc_range: 0.1,
        exposure_time: 0.01,
        ..Default::default()
    })
}

async fn until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn finish(manager: &QueueManager) -> QueueState {
    tokio::time::timeout(Duration::from_secs(60), manager.wait_until_idle())
        .await
        .expect("queue did not finish")
}

#[tokio::test]
async fn sample_is_mounted_centred_and_collected() {
    let settings = Settings::default();
    let station = station(&settings, MockCollector::new(MockMode::Instant)).await;
    let manager = QueueManager::new(station.beamline.clone(), &settings);

    let sample = QueueEntry::sample("lysozyme-1", Some("1:01"));
    let group = QueueEntry::task_group("characterisation");
    let centring = QueueEntry::centring(CentringMethod::Automatic);
    let dc = collection("lyso", 10);
    sample.enqueue(group.clone());
    group.enqueue(centring.clone());
    group.enqueue(dc.clone());
    manager.enqueue(sample.clone()).unwrap();

    manager.execute(None).unwrap();
    assert_eq!(finish(&manager).await, QueueState::Idle);

    for entry in [&sample, &group, &centring, &dc] {
        assert_eq!(entry.status(), EntryStatus::Success, "{}", entry.name());
    }
    assert_eq!(station.changer.history(), vec!["1:01"]);
    assert_eq!(station.phase.confirmed_phase(), Phase::DataCollection);

    let run = manager.run_state();
    assert_eq!(run.loaded_sample.as_deref(), Some("lysozyme-1"));
    let centred = run.centred_position.expect("centred position");
    for (role, expected) in geometry(&settings).centred_positions() {
        assert!((centred[&role] - expected).abs() < 1e-6, "{}", role);
        assert!((station.motors[&role].current_position() - expected).abs() < 1e-6);
    }

    assert_eq!(station.collector.images_written(), 10);
    let groups = station.lims.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].experiment_type, "OSC");
    let collections = station.lims.collections();
    assert_eq!(collections.len(), 1);
    assert_eq!(collections[0].status, "Data collection successful");
    assert_eq!(Some(collections[0].group_id), run.group_id);
    assert_eq!(collections[0].centred_position.as_ref(), Some(&centred));
    let images = station.lims.images();
    assert_eq!(images.len(), 10);
    assert_eq!(images[0].image_number, 1);
    assert_eq!(images[0].collection_id, collections[0].collection_id.unwrap());
}

#[tokio::test]
async fn collector_failure_is_recorded_and_stops_the_queue() {
    let settings = Settings::default();
    let collector = MockCollector::new(MockMode::Instant).with_error_config(ErrorConfig::scenario(
        ErrorScenario::Fail {
            operation: "collect",
        },
    ));
    let station = station(&settings, collector).await;
    let manager = QueueManager::new(station.beamline.clone(), &settings);

    let group = QueueEntry::task_group("group");
    let (dc, next) = (collection("broken", 5), collection("next", 5));
    group.enqueue(dc.clone());
    group.enqueue(next.clone());
    manager.enqueue(group.clone()).unwrap();

    manager.execute(None).unwrap();
    assert_eq!(finish(&manager).await, QueueState::Stopped);

    assert_eq!(dc.status(), EntryStatus::Failed);
    assert_eq!(group.status(), EntryStatus::Failed);
    assert_eq!(next.status(), EntryStatus::NotExecuted);
    let collections = station.lims.collections();
    assert_eq!(collections.len(), 1);
    assert!(
        collections[0].status.starts_with("Data collection failed"),
        "{}",
        collections[0].status
    );
    assert!(station.lims.images().is_empty());
}

#[tokio::test]
async fn sample_without_a_changer_is_skipped() {
    let settings = Settings::default();
    let mut station = station(&settings, MockCollector::new(MockMode::Instant)).await;
    station.beamline.sample_changer = None;
    let manager = QueueManager::new(station.beamline.clone(), &settings);

    let sample = QueueEntry::sample("unreachable", Some("2:05"));
    let below = collection("below", 1);
    sample.enqueue(below.clone());
    let manual = QueueEntry::sample("on the goniometer", None);
    manager.enqueue(sample.clone()).unwrap();
    manager.enqueue(manual.clone()).unwrap();

    manager.execute(None).unwrap();
    assert_eq!(finish(&manager).await, QueueState::Idle);
    assert_eq!(sample.status(), EntryStatus::Skipped);
    assert_eq!(below.status(), EntryStatus::NotExecuted);
    assert_eq!(manual.status(), EntryStatus::Success);
    assert_eq!(
        manager.run_state().loaded_sample.as_deref(),
        Some("on the goniometer")
    );
}

#[tokio::test]
async fn centring_needs_a_diffractometer() {
    let manager = QueueManager::new(Beamline::default(), &Settings::default());
    let centring = QueueEntry::centring(CentringMethod::Manual);
    manager.enqueue(centring.clone()).unwrap();

    manager.execute(None).unwrap();
    assert_eq!(finish(&manager).await, QueueState::Stopped);
    assert_eq!(centring.status(), EntryStatus::Failed);
}

#[tokio::test]
async fn workflow_waiting_for_input_pauses_the_queue() {
    let runner = Arc::new(MockWorkflowRunner::new().with_outcome(
        "mesh_scan",
        WorkflowOutcome::NeedsUserInput("choose a position".to_string()),
    ));
    let beamline = Beamline {
        workflow: Some(runner.clone()),
        ..Default::default()
    };
    let manager = QueueManager::new(beamline, &Settings::default());
    let workflow = QueueEntry::workflow("mesh_scan", serde_json::json!({ "grid": [10, 10] }));
    let delay = QueueEntry::delay(Duration::from_millis(1));
    manager.enqueue(workflow.clone()).unwrap();
    manager.enqueue(delay.clone()).unwrap();

    manager.execute(None).unwrap();
    until(|| manager.is_paused()).await;
    assert_eq!(workflow.status(), EntryStatus::Running);
    assert_eq!(delay.status(), EntryStatus::NotExecuted);
    assert_eq!(runner.runs()[0].1["grid"][0], 10);

    manager.set_pause(false);
    assert_eq!(finish(&manager).await, QueueState::Idle);
    assert_eq!(workflow.status(), EntryStatus::Success);
    assert_eq!(delay.status(), EntryStatus::Success);
}

#[tokio::test]
async fn stopping_interrupts_a_long_collection() {
    let collector = Arc::new(MockCollector::new(MockMode::Realistic));
    let beamline = Beamline {
        collector: Some(collector.clone()),
        ..Default::default()
    };
    let manager = QueueManager::new(beamline, &Settings::default());
    let dc = QueueEntry::data_collection(CollectionParameters {
        prefix: "long".to_string(),
        num_images: 1000,
        exposure_time: 1.0,
        ..Default::default()
    });
    manager.enqueue(dc.clone()).unwrap();

    manager.execute(None).unwrap();
    until(|| !collector.collections().is_empty()).await;
    manager.stop().await;

    assert_eq!(manager.state(), QueueState::Stopped);
    assert_eq!(dc.status(), EntryStatus::Failed);
    assert!(dc.is_executed());
    assert!(collector.images_written() < 1000);
}
