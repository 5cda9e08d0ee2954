//! Typed notification bus for the coordination layer
//!
//! # Architecture
//!
//! 1. **Event Types** (`types.rs`): the notifications emitted by the router,
//!    orchestrator, council and synthesizer.
//!
//! 2. **Event Bus** (`bus.rs`): Tokio broadcast-based pub/sub. Subscribers
//!    are handed out explicitly; nothing listens implicitly.
//!
//! 3. **Event History** (`history.rs`): bounded ring of recent events.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Producer   │────▶│  Event Bus   │────▶│  Subscribers │
//! │  (publish)   │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────┬───────┘     └──────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐
//!                      │   History    │
//!                      │  (ring buf)  │
//!                      └──────────────┘
//! ```
//!
//! No consumer is required for correct operation: publishing with zero
//! subscribers succeeds.

pub mod bus;
pub mod history;
pub mod types;

pub use bus::{EventBus, EventBusError, EventBusResult, EventReceiver, SharedEventBus};
pub use history::{EventHistory, EventStats};
pub use types::CoordinationEvent;
