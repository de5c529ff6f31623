//! Asynchronous interrupt delivery from models to driver handlers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │   Model     │ raise(irq) through its DeviceNotifier
//! └──────┬──────┘
//!        │ (module, irq)
//!        ▼
//! ┌─────────────────────┐
//! │ AsyncDelivery       │ NotificationTable: (module, irq) <-> id
//! │  - Signal: kill(id) │
//! │  - Queued: FIFO     │
//! └──────┬──────────────┘
//!        │ id -> irq
//!        ▼
//! ┌─────────────────────┐
//! │ InterruptTable      │ runs the handler if the line is enabled
//! └─────────────────────┘
//! ```
//!
//! A raise never blocks the model and never runs the handler on the model's
//! thread: under signal delivery the handler runs on the target thread when
//! the signal lands, under queued delivery it runs on whoever calls
//! [`AsyncDelivery::flush`].
//!
//! # Usage Example
//!
//! ```rust,ignore
//! let interrupts = Arc::new(InterruptTable::new());
//! let delivery = Arc::new(AsyncDelivery::new(DeliveryMethod::Queued, interrupts.clone()));
//!
//! interrupts.register(5, Arc::new(|irq| println!("irq {irq}")))?;
//! interrupts.enable(5)?;
//! delivery.bind(34, "uart", 5)?;
//!
//! let notifier = DeviceNotifier::new("uart", delivery.clone())?;
//! notifier.raise(5)?;
//! delivery.flush();
//! ```

mod delivery;
mod notifier;
mod queue;
mod routing;

pub use delivery::{AsyncDelivery, DeliveryMethod, DeliveryStats};
pub use notifier::DeviceNotifier;
pub use queue::PendingNotification;
pub use routing::{MAX_NOTIFICATIONS, NotificationMapping, NotificationTable};
