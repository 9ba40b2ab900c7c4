//! Beamline configuration.
//!
//! Settings are layered with Figment:
//! 1. Base Layer: defaults from `Settings::default()`
//! 2. File Layer: a TOML file (`config/beamline.toml` unless given)
//! 3. Environment Layer: variables prefixed with `MXQ_`, nested fields
//!    separated by double underscores
//!
//! ## Schema
//!
//! ```toml
//! log_level = "info"
//!
//! [diffractometer]
//! pixels_per_mm_x = 520.0
//! pixels_per_mm_y = 520.0
//! beam_position = [640.0, 512.0]
//! chi_angle = 0.0
//! invalidation_grace_ms = 1000
//! motion_timeout_ms = 30000
//! phase_timeout_ms = 40000
//!
//! [diffractometer.motors.phiz]
//! direction = -1.0
//! units_per_mm = 1000.0
//! reference_position = 0.0
//!
//! [centring]
//! manual_phi_increment = 90.0
//! num_centring_images = 5
//! centring_angle_range = 180.0
//! num_auto_centring_cycles = 3
//! loop_search_attempts = 5
//!
//! [queue]
//! event_capacity = 1024
//! ```
//!
//! Example override: `MXQ_DIFFRACTOMETER__CHI_ANGLE=1.5`.

use anyhow::{Context, Result};
use figment::{providers::Serialized, Figment, Provider};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::MotorRole;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/beamline.toml";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "MXQ_";

impl Provider for Settings {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("Library Defaults")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging verbosity: "error", "warn", "info", "debug" or "trace".
    pub log_level: String,
    /// Diffractometer geometry, calibration and timeouts.
    pub diffractometer: DiffractometerSettings,
    /// Centring procedure tuning.
    pub centring: CentringSettings,
    /// Queue engine settings.
    pub queue: QueueSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            diffractometer: DiffractometerSettings::default(),
            centring: CentringSettings::default(),
            queue: QueueSettings::default(),
        }
    }
}

/// Mounting and unit conversion of one centring motor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentringMotorSettings {
    /// +1.0 or -1.0 depending on mechanical mounting.
    pub direction: f64,
    /// Device units per millimetre (1000.0 for a motor driven in microns).
    /// Rotation axes keep 1.0 and are expressed in degrees.
    pub units_per_mm: f64,
    /// Fixed position (mm) the axis is clamped to by centring.
    pub reference_position: Option<f64>,
}

impl Default for CentringMotorSettings {
    fn default() -> Self {
        Self {
            direction: 1.0,
            units_per_mm: 1.0,
            reference_position: None,
        }
    }
}

/// Diffractometer geometry and timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffractometerSettings {
    /// Horizontal camera calibration.
    pub pixels_per_mm_x: f64,
    /// Vertical camera calibration.
    pub pixels_per_mm_y: f64,
    /// Beam position on the camera image, pixels.
    pub beam_position: [f64; 2],
    /// Instrument-geometry tilt of the rotation axis on screen, degrees.
    pub chi_angle: f64,
    /// Motor motion ignored after a successful centring before it
    /// invalidates the centred position.
    pub invalidation_grace_ms: u64,
    /// Bound on waiting for motors to settle.
    pub motion_timeout_ms: u64,
    /// Bound on waiting for a requested phase.
    pub phase_timeout_ms: u64,
    /// Per-motor centring settings; roles not listed use the defaults.
    pub motors: BTreeMap<MotorRole, CentringMotorSettings>,
}

impl Default for DiffractometerSettings {
    fn default() -> Self {
        Self {
            pixels_per_mm_x: 500.0,
            pixels_per_mm_y: 500.0,
            beam_position: [640.0, 512.0],
            chi_angle: 0.0,
            invalidation_grace_ms: 1000,
            motion_timeout_ms: 30_000,
            phase_timeout_ms: 40_000,
            motors: BTreeMap::new(),
        }
    }
}

impl DiffractometerSettings {
    /// Centring settings of `role`.
    pub fn motor(&self, role: MotorRole) -> CentringMotorSettings {
        self.motors.get(&role).copied().unwrap_or_default()
    }

    /// Grace period after a centring before motion invalidates it.
    pub fn invalidation_grace(&self) -> Duration {
        Duration::from_millis(self.invalidation_grace_ms)
    }

    /// Bound on waits for motor motion.
    pub fn motion_timeout(&self) -> Duration {
        Duration::from_millis(self.motion_timeout_ms)
    }

    /// Bound on phase-change confirmation.
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }
}

/// Centring procedure tuning. The defaults are the values most beamlines run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentringSettings {
    /// Phi rotation between manual clicks, degrees.
    pub manual_phi_increment: f64,
    /// Points collected per automatic centring cycle.
    pub num_centring_images: u32,
    /// Phi range covered by one automatic cycle, degrees.
    pub centring_angle_range: f64,
    /// Automatic centring cycles.
    pub num_auto_centring_cycles: u32,
    /// Loop-detection attempts (rotating 90 degrees between them) before
    /// automatic centring gives up.
    pub loop_search_attempts: u32,
}

impl Default for CentringSettings {
    fn default() -> Self {
        Self {
            manual_phi_increment: 90.0,
            num_centring_images: 5,
            centring_angle_range: 180.0,
            num_auto_centring_cycles: 3,
            loop_search_attempts: 5,
        }
    }
}

/// Queue engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Capacity of notification channels.
    pub event_capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Settings {
    /// Load configuration from defaults, an optional TOML file and the
    /// environment.
    ///
    /// An explicit `config_path` must exist; the default path is optional.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        use figment::providers::{Env, Format, Toml};

        let mut figment = Figment::from(Settings::default());

        match config_path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                figment = figment.merge(Toml::file(&path));
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    figment = figment.merge(Toml::file(path));
                } else {
                    tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                }
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let settings: Settings = figment
            .extract()
            .context("Failed to extract configuration from Figment")?;

        settings
            .validate()
            .context("Configuration validation failed")?;

        Ok(settings)
    }

    /// Parse settings from a TOML string layered over the defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        use figment::providers::{Format, Toml};

        let settings: Settings = Figment::from(Settings::default())
            .merge(Toml::string(toml))
            .extract()
            .context("Failed to parse configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check that values are usable.
    pub fn validate(&self) -> Result<()> {
        const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
        if !LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                LEVELS.join(", ")
            );
        }

        let d = &self.diffractometer;
        if !(d.pixels_per_mm_x > 0.0 && d.pixels_per_mm_y > 0.0) {
            anyhow::bail!(
                "Pixel calibration must be positive (got {} x {})",
                d.pixels_per_mm_x,
                d.pixels_per_mm_y
            );
        }
        if !d.chi_angle.is_finite() {
            anyhow::bail!("chi_angle must be finite");
        }
        for (name, value) in [
            ("motion_timeout_ms", d.motion_timeout_ms),
            ("phase_timeout_ms", d.phase_timeout_ms),
        ] {
            validate_timeout(name, value)?;
        }
        for (role, motor) in &d.motors {
            if motor.direction != 1.0 && motor.direction != -1.0 {
                anyhow::bail!("Motor '{}' direction must be 1 or -1", role);
            }
            if !(motor.units_per_mm > 0.0) {
                anyhow::bail!("Motor '{}' units_per_mm must be positive", role);
            }
        }

        let c = &self.centring;
        if c.num_centring_images < 2 {
            anyhow::bail!(
                "num_centring_images must be at least 2 (got {})",
                c.num_centring_images
            );
        }
        if c.num_auto_centring_cycles == 0 || c.loop_search_attempts == 0 {
            anyhow::bail!("Automatic centring needs at least one cycle and one loop search");
        }
        if !(c.centring_angle_range > 0.0) || !(c.manual_phi_increment > 0.0) {
            anyhow::bail!("Centring angles must be positive");
        }

        if self.queue.event_capacity == 0 {
            anyhow::bail!("queue.event_capacity must be positive");
        }
        Ok(())
    }
}

fn validate_timeout(name: &str, value: u64) -> Result<()> {
    let (min, max) = (10, 600_000);
    if !(min..=max).contains(&value) {
        anyhow::bail!(
            "Timeout '{}' = {}ms is out of valid range ({}ms - {}ms).",
            name,
            value,
            min,
            max
        );
    }
    Ok(())
}
