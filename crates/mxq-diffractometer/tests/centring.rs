//! Centring and phase behaviour against simulated hardware.

use async_trait::async_trait;
use mxq_core::capabilities::{LoopDetection, LoopFinder, Motor, PhaseControl};
use mxq_core::config::{CentringMotorSettings, Settings};
use mxq_core::types::{MotorPositions, MotorRole, Phase, ScreenPoint};
use mxq_diffractometer::{
    CentringError, CentringMethod, Diffractometer, DiffractometerError, DiffractometerEvent,
};
use mxq_driver_mock::{
    standard_motors, MockLoopFinder, MockMode, MockMotor, MockPhaseControl, SampleGeometry,
    SimulatedSampleLoop,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

const TRANSLATIONS: [MotorRole; 4] = [
    MotorRole::PhiY,
    MotorRole::PhiZ,
    MotorRole::SampX,
    MotorRole::SampY,
];

struct Rig {
    diffractometer: Diffractometer,
    motors: BTreeMap<MotorRole, MockMotor>,
}

async fn rig_with(
    settings: &Settings,
    phase: MockPhaseControl,
    motors: BTreeMap<MotorRole, MockMotor>,
    loop_finder: Option<Arc<dyn LoopFinder>>,
) -> Rig {
    let mut builder = Diffractometer::builder(settings).phase_control(Arc::new(phase));
    for (role, motor) in &motors {
        builder = builder.motor(*role, Arc::new(motor.clone()));
    }
    if let Some(finder) = loop_finder {
        builder = builder.loop_finder(finder);
    }
    Rig {
        diffractometer: builder.init().await.unwrap(),
        motors,
    }
}

async fn rig() -> Rig {
    rig_with(
        &Settings::default(),
        MockPhaseControl::new(),
        standard_motors(MockMode::Instant),
        None,
    )
    .await
}

fn sample_geometry() -> SampleGeometry {
    let settings = Settings::default().diffractometer;
    SampleGeometry {
        pixels_per_mm: [settings.pixels_per_mm_x, settings.pixels_per_mm_y],
        beam_position: settings.beam_position,
        chi_angle: settings.chi_angle,
        table_offset: [1.1, 0.9],
        crystal_offset: [0.06, -0.04],
    }
}

fn raw_positions(motors: &BTreeMap<MotorRole, MockMotor>) -> HashMap<MotorRole, f64> {
    motors
        .iter()
        .map(|(role, motor)| (*role, motor.current_position()))
        .collect()
}

fn beam(settings: &Settings) -> ScreenPoint {
    let [x, y] = settings.diffractometer.beam_position;
    ScreenPoint::new(x, y)
}

fn assert_centred(motors: &BTreeMap<MotorRole, MockMotor>, geometry: &SampleGeometry) {
    for (role, expected) in geometry.centred_positions() {
        let actual = motors[&role].current_position();
        assert!(
            (actual - expected).abs() < 1e-6,
            "{} at {}, expected {}",
            role,
            actual,
            expected
        );
    }
}

async fn next_event<F>(
    events: &mut broadcast::Receiver<DiffractometerEvent>,
    mut matches: F,
) -> DiffractometerEvent
where
    F: FnMut(&DiffractometerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received")
}

fn is_success(event: &DiffractometerEvent) -> bool {
    matches!(event, DiffractometerEvent::CentringSuccessful { .. })
}

#[tokio::test]
async fn manual_centring_brings_the_sample_onto_the_beam() {
    let rig = rig().await;
    let geometry = sample_geometry();
    let mut events = rig.diffractometer.subscribe();

    rig.diffractometer
        .start_centring_method(CentringMethod::Manual, false)
        .await
        .unwrap();
    assert_eq!(
        rig.diffractometer.current_centring_method(),
        Some(CentringMethod::Manual)
    );

    for _ in 0..3 {
        next_event(&mut events, |e| {
            matches!(e, DiffractometerEvent::ProgressMessage(m) if m.starts_with("Click"))
        })
        .await;
        let click = geometry.project(&raw_positions(&rig.motors));
        assert!(rig.diffractometer.image_clicked(click));
    }

    let event = next_event(&mut events, is_success).await;
    assert_centred(&rig.motors, &geometry);
    assert!((rig.motors[&MotorRole::Phi].current_position() - 180.0).abs() < 1e-9);

    let status = rig.diffractometer.centring_status();
    assert!(status.valid);
    assert!(!status.accepted);
    assert_eq!(status.method, Some(CentringMethod::Manual));
    assert!(status.end_time.is_some());
    if let DiffractometerEvent::CentringSuccessful { status: emitted, .. } = event {
        assert_eq!(emitted, status);
    }
    assert_eq!(rig.diffractometer.current_centring_method(), None);
}

#[tokio::test]
async fn automatic_centring_converges_after_searching_for_the_loop() {
    let motors = standard_motors(MockMode::Instant);
    let geometry = sample_geometry();
    let finder = Arc::new(
        SimulatedSampleLoop::new(
            geometry,
            motors.iter().map(|(r, m)| (*r, m.clone())).collect(),
        )
        .hidden_for(2),
    );
    let rig = rig_with(
        &Settings::default(),
        MockPhaseControl::new(),
        motors,
        Some(finder.clone()),
    )
    .await;
    let mut events = rig.diffractometer.subscribe();

    rig.diffractometer
        .start_centring_method(CentringMethod::Automatic, true)
        .await
        .unwrap();

    assert_centred(&rig.motors, &geometry);
    assert!(rig.diffractometer.centring_status().valid);

    let mut points = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DiffractometerEvent::NewAutomaticCentringPoint(_)) {
            points += 1;
        }
    }
    // 3 cycles of 5 images
    assert_eq!(points, 15);
    assert!(finder.calls() >= 15 + 3 + 2);
}

#[tokio::test]
async fn automatic_centring_needs_a_loop_finder() {
    let rig = rig().await;
    let err = rig
        .diffractometer
        .start_centring_method(CentringMethod::Automatic, false)
        .await
        .unwrap_err();
    assert!(matches!(err, DiffractometerError::NoLoopFinder));
    assert_eq!(rig.diffractometer.current_centring_method(), None);
}

#[tokio::test]
async fn too_few_points_fail_without_moving_the_sample() {
    let point = ScreenPoint::new(600.0, 500.0);
    let finder = Arc::new(MockLoopFinder::scripted(
        vec![LoopDetection::Found(point), LoopDetection::Found(point)],
        LoopDetection::NotFound,
    ));
    let mut settings = Settings::default();
    settings.centring.num_auto_centring_cycles = 1;
    let rig = rig_with(
        &settings,
        MockPhaseControl::new(),
        standard_motors(MockMode::Instant),
        Some(finder),
    )
    .await;
    let mut events = rig.diffractometer.subscribe();

    let err = rig
        .diffractometer
        .start_centring_method(CentringMethod::Automatic, true)
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            DiffractometerError::Centring(CentringError::InsufficientData { got: 1, .. })
        ),
        "unexpected error {:?}",
        err
    );

    for role in TRANSLATIONS {
        assert_eq!(rig.motors[&role].move_count(), 0, "{} moved", role);
    }
    assert!(!rig.diffractometer.centring_status().valid);
    next_event(&mut events, |e| {
        matches!(e, DiffractometerEvent::CentringFailed { .. })
    })
    .await;
}

#[tokio::test]
async fn clicks_beyond_the_third_are_ignored() {
    let settings = Settings::default();
    let rig = rig().await;
    let mut events = rig.diffractometer.subscribe();

    rig.diffractometer
        .start_centring_method(CentringMethod::Manual, false)
        .await
        .unwrap();
    let accepted: Vec<bool> = (0..4)
        .map(|_| rig.diffractometer.image_clicked(beam(&settings)))
        .collect();
    assert_eq!(accepted, vec![true, true, true, false]);

    next_event(&mut events, is_success).await;
    assert!(!rig.diffractometer.image_clicked(beam(&settings)));
    // Beam clicks: the sample was already centred
    for role in TRANSLATIONS {
        assert!(rig.motors[&role].current_position().abs() < 1e-9);
    }
}

#[tokio::test]
async fn second_centring_is_rejected_while_one_runs() {
    let rig = rig().await;
    let mut events = rig.diffractometer.subscribe();
    rig.diffractometer
        .start_centring_method(CentringMethod::Manual, false)
        .await
        .unwrap();

    let err = rig
        .diffractometer
        .start_centring_method(CentringMethod::MoveToBeam, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DiffractometerError::CentringInProgress(CentringMethod::Manual)
    ));
    assert_eq!(
        rig.diffractometer.current_centring_method(),
        Some(CentringMethod::Manual)
    );
    next_event(&mut events, |e| {
        matches!(
            e,
            DiffractometerEvent::CentringFailed {
                method: CentringMethod::MoveToBeam,
                ..
            }
        )
    })
    .await;

    rig.diffractometer.cancel_centring_method(false);
    assert_eq!(rig.diffractometer.current_centring_method(), None);
}

#[tokio::test]
async fn cancelled_centring_applies_no_motion() {
    let rig = rig().await;
    let mut events = rig.diffractometer.subscribe();

    let diffractometer = rig.diffractometer.clone();
    let running = tokio::spawn(async move {
        diffractometer
            .start_centring_method(CentringMethod::Manual, true)
            .await
    });
    next_event(&mut events, |e| {
        matches!(e, DiffractometerEvent::CentringStarted { .. })
    })
    .await;
    assert!(rig.diffractometer.image_clicked(ScreenPoint::new(100.0, 100.0)));

    rig.diffractometer.cancel_centring_method(true);

    let result = running.await.unwrap();
    assert!(matches!(
        result,
        Err(DiffractometerError::Centring(CentringError::Aborted))
    ));
    for role in TRANSLATIONS {
        assert_eq!(rig.motors[&role].move_count(), 0, "{} moved", role);
    }
    let status = rig.diffractometer.centring_status();
    assert!(!status.valid);
    assert_eq!(rig.diffractometer.current_centring_method(), None);
    next_event(&mut events, |e| {
        matches!(e, DiffractometerEvent::CentringFailed { reason, .. } if reason == "cancelled")
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn motion_after_the_grace_period_invalidates_the_centring() {
    let settings = Settings::default();
    let rig = rig().await;
    let mut events = rig.diffractometer.subscribe();

    rig.diffractometer
        .start_centring_method(CentringMethod::MoveToBeam, false)
        .await
        .unwrap();
    assert!(rig.diffractometer.image_clicked(beam(&settings)));
    next_event(&mut events, is_success).await;
    assert!(rig.diffractometer.centring_status().valid);

    // Within the grace period
    rig.motors[&MotorRole::PhiY].move_abs(0.01).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rig.diffractometer.centring_status().valid);

    tokio::time::sleep(settings.diffractometer.invalidation_grace()).await;
    rig.motors[&MotorRole::SampX].move_abs(0.02).await.unwrap();
    next_event(&mut events, |e| matches!(e, DiffractometerEvent::CentringInvalid)).await;
    assert!(!rig.diffractometer.centring_status().valid);
}

#[tokio::test(start_paused = true)]
async fn zoom_motion_never_invalidates_the_centring() {
    let settings = Settings::default();
    let rig = rig().await;
    let mut events = rig.diffractometer.subscribe();

    rig.diffractometer
        .start_centring_method(CentringMethod::MoveToBeam, false)
        .await
        .unwrap();
    rig.diffractometer.image_clicked(beam(&settings));
    next_event(&mut events, is_success).await;

    tokio::time::sleep(settings.diffractometer.invalidation_grace() * 2).await;
    rig.motors[&MotorRole::Zoom].move_abs(3.0).await.unwrap();
    rig.motors[&MotorRole::Phi].move_abs(45.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rig.diffractometer.centring_status().valid);
}

#[tokio::test]
async fn accept_requires_a_valid_centring() {
    let settings = Settings::default();
    let rig = rig().await;
    assert!(matches!(
        rig.diffractometer.accept_centring(),
        Err(DiffractometerError::NoValidCentring)
    ));

    let mut events = rig.diffractometer.subscribe();
    rig.diffractometer
        .start_centring_method(CentringMethod::MoveToBeam, false)
        .await
        .unwrap();
    rig.diffractometer.image_clicked(beam(&settings));
    next_event(&mut events, is_success).await;

    let status = rig.diffractometer.accept_centring().unwrap();
    assert!(status.accepted);
    rig.diffractometer.reject_centring();
    assert!(!rig.diffractometer.centring_status().valid);
}

#[tokio::test(start_paused = true)]
async fn set_phase_times_out_when_the_device_never_confirms() {
    let phase = MockPhaseControl::builder().unresponsive().build();
    let rig = rig_with(
        &Settings::default(),
        phase.clone(),
        standard_motors(MockMode::Instant),
        None,
    )
    .await;

    let err = rig
        .diffractometer
        .set_phase(Phase::DataCollection, Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "unexpected error {:?}", err);
    assert_eq!(rig.diffractometer.current_phase(), Phase::Centring);
    assert_eq!(phase.requests(), vec![Phase::DataCollection]);
}

#[tokio::test(start_paused = true)]
async fn set_phase_waits_for_confirmation() {
    let phase = MockPhaseControl::builder()
        .transition_time(Duration::from_millis(500))
        .build();
    let rig = rig_with(
        &Settings::default(),
        phase,
        standard_motors(MockMode::Instant),
        None,
    )
    .await;
    let mut events = rig.diffractometer.subscribe();

    rig.diffractometer
        .set_phase(Phase::DataCollection, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(rig.diffractometer.current_phase(), Phase::DataCollection);
    next_event(&mut events, |e| {
        matches!(e, DiffractometerEvent::PhaseChanged(Phase::DataCollection))
    })
    .await;

    let err = rig
        .diffractometer
        .set_phase(Phase::Other("Hutch".into()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DiffractometerError::UnsupportedPhase(_)));
}

#[tokio::test(start_paused = true)]
async fn set_phase_without_timeout_returns_before_confirmation() {
    let phase = MockPhaseControl::builder()
        .transition_time(Duration::from_millis(500))
        .build();
    let rig = rig_with(
        &Settings::default(),
        phase.clone(),
        standard_motors(MockMode::Instant),
        None,
    )
    .await;
    let mut events = rig.diffractometer.subscribe();

    let started = tokio::time::Instant::now();
    rig.diffractometer
        .set_phase(Phase::Transfer, None)
        .await
        .unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(phase.requests(), vec![Phase::Transfer]);
    assert_eq!(rig.diffractometer.current_phase(), Phase::Centring);

    next_event(&mut events, |e| {
        matches!(e, DiffractometerEvent::PhaseChanged(Phase::Transfer))
    })
    .await;
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(rig.diffractometer.current_phase(), Phase::Transfer);
}

/// Phase controller whose notification channel is already closed.
struct SilentPhaseControl;

#[async_trait]
impl PhaseControl for SilentPhaseControl {
    fn phases(&self) -> Vec<Phase> {
        vec![Phase::Centring, Phase::DataCollection]
    }

    async fn request_phase(&self, _phase: Phase) -> anyhow::Result<()> {
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<Phase> {
        let (_sender, receiver) = watch::channel(Phase::Centring);
        receiver
    }
}

#[tokio::test]
async fn set_phase_fails_when_the_controller_stops_reporting() {
    let mut builder =
        Diffractometer::builder(&Settings::default()).phase_control(Arc::new(SilentPhaseControl));
    for (role, motor) in standard_motors(MockMode::Instant) {
        builder = builder.motor(role, Arc::new(motor));
    }
    let diffractometer = builder.init().await.unwrap();

    let err = diffractometer
        .set_phase(Phase::DataCollection, Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            DiffractometerError::PhaseNotConfirmed(Phase::DataCollection)
        ),
        "unexpected error {:?}",
        err
    );
    assert!(!err.is_timeout());
    assert_eq!(diffractometer.current_phase(), Phase::Centring);
}

#[tokio::test]
async fn screen_mapping_round_trips_at_an_angle() {
    let mut settings = Settings::default();
    settings.diffractometer.chi_angle = 12.0;
    let rig = rig_with(
        &settings,
        MockPhaseControl::new(),
        standard_motors(MockMode::Instant),
        None,
    )
    .await;
    rig.motors[&MotorRole::Phi].move_abs(35.0).await.unwrap();

    let point = ScreenPoint::new(702.0, 431.0);
    let target = rig
        .diffractometer
        .get_centred_point_from_coord(point)
        .await
        .unwrap();
    let back = rig
        .diffractometer
        .motor_positions_to_screen(&target)
        .await
        .unwrap();
    assert!((back.x - point.x).abs() < 1e-6);
    assert!((back.y - point.y).abs() < 1e-6);

    rig.diffractometer.move_to_beam(point).await.unwrap();
    let on_beam = rig
        .diffractometer
        .motor_positions_to_screen(&target)
        .await
        .unwrap();
    assert!((on_beam.x - beam(&settings).x).abs() < 1e-6);
    assert!((on_beam.y - beam(&settings).y).abs() < 1e-6);
}

#[tokio::test]
async fn motor_calibration_is_applied_to_moves() {
    let mut settings = Settings::default();
    settings.diffractometer.motors.insert(
        MotorRole::SampX,
        CentringMotorSettings {
            direction: -1.0,
            units_per_mm: 1000.0,
            reference_position: None,
        },
    );
    let rig = rig_with(
        &settings,
        MockPhaseControl::new(),
        standard_motors(MockMode::Instant),
        None,
    )
    .await;

    let target = MotorPositions::from([(MotorRole::SampX, 0.2)]);
    rig.diffractometer
        .move_to_motors_positions(target, true)
        .await
        .unwrap();
    assert!((rig.motors[&MotorRole::SampX].current_position() + 200.0).abs() < 1e-9);

    let positions = rig.diffractometer.get_positions().await.unwrap();
    assert!((positions[&MotorRole::SampX] - 0.2).abs() < 1e-12);
    assert!(rig.diffractometer.is_ready());
}

#[tokio::test]
async fn init_requires_the_centring_motors() {
    let mut motors = standard_motors(MockMode::Instant);
    motors.remove(&MotorRole::SampY);
    let mut builder = Diffractometer::builder(&Settings::default())
        .phase_control(Arc::new(MockPhaseControl::new()));
    for (role, motor) in motors {
        builder = builder.motor(role, Arc::new(motor));
    }
    assert!(matches!(
        builder.init().await,
        Err(DiffractometerError::MissingMotor(MotorRole::SampY))
    ));
}
