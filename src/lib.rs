//! Embeddable LV2 plugin host core.
//!
//! Runs third-party LV2 plugins inside a real-time audio callback on
//! devices where the platform layer owns the driver. Three subsystems do
//! the heavy lifting: the per-callback processing loop, the lock-free
//! UI ↔ audio ↔ worker messaging plane, and the feature negotiation /
//! port wiring that makes both work for arbitrary plugins.
//!
//! The embedder wires things up roughly like this:
//!
//! ```ignore
//! let host = plugbay::Lv2Host::new();
//! let mut instance = host.open(&plugbay::OpenConfig {
//!     plugin_uri: "http://example.org/eq".into(),
//!     sample_rate: 48_000.0,
//!     frames_per_burst: 4096,
//! })?;
//! let controller = instance.take_controller().unwrap();
//! instance.start()?;
//! // move `instance` into the driver's data callback:
//! //   instance.process_interleaved(buffer, frames)
//! // keep `controller` on the UI thread:
//! //   controller.set_control(4, 0.4);
//! ```

pub mod atom;
pub mod channel;
pub mod driver;
pub mod error;
pub mod features;
pub mod host;
pub mod port;
pub mod ringbuffer;
pub mod scanner;
pub mod state;
pub mod urid;
pub mod worker;

pub use channel::{InboundMode, OutboundAtom};
pub use driver::{AudioDriver, CallbackResult};
pub use error::{HostError, Result};
pub use host::{HostState, InstanceController, Lv2Host, Lv2Instance, OpenConfig};
pub use scanner::PluginInfo;
pub use state::StateSnapshot;
pub use urid::{KnownUrids, UridMapper};
