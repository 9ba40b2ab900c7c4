//! Diffractometer control for mxq.
//!
//! [`Diffractometer`] keeps track of the goniometer phase and runs sample
//! centring: manual three-click, computer automatic (loop detection over a
//! phi sweep) and move-to-beam. Centring geometry is in [`centring::math`];
//! every status change is published as a [`DiffractometerEvent`].
//!
//! ```rust,ignore
//! let mut events = diffractometer.subscribe();
//! diffractometer.start_centring_method(CentringMethod::Manual, false).await?;
//! for click in clicks {
//!     diffractometer.image_clicked(click);
//! }
//! while let Ok(event) = events.recv().await {
//!     if let DiffractometerEvent::CentringSuccessful { status, .. } = event {
//!         println!("centred at {:?}", status.motors);
//!         break;
//!     }
//! }
//! ```

pub mod centring;
pub mod diffractometer;
pub mod error;
pub mod events;
pub mod status;

pub use centring::{CentringDeltas, CentringMethod, ScreenGeometry, SinusoidFit};
pub use diffractometer::{Diffractometer, DiffractometerBuilder};
pub use error::{CentringError, DiffractometerError};
pub use events::DiffractometerEvent;
pub use status::{CentringStatus, DiffractometerState};
