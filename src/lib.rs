//! printfleet: slicing queue, print job lifecycle and printer command
//! dispatch for a fleet of networked 3D printers.

pub mod dispatcher;
pub mod error;
pub mod gcode_source;
pub mod lifecycle;
pub mod model;
pub mod notify;
pub mod registry;
pub mod repository;
pub mod runtime;
pub mod scheduler;
pub mod stream_tracker;
pub mod web;

pub use dispatcher::{CommandReceipt, DispatcherEvent, PrinterCommandDispatcher};
pub use error::FleetError;
pub use lifecycle::JobLifecycleManager;
pub use runtime::{FleetHost, HostPorts};
pub use scheduler::{QueueEvent, SlicingQueueScheduler};
