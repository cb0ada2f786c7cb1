// MIT License - Copyright (c) 2026 Peter Wright
// BlueBOLT CV2 client

use crate::model::DeviceModel;
use crate::status::StatusReading;

/// Events emitted by a [`DeviceMonitor`](crate::monitor::DeviceMonitor).
///
/// Users subscribe via `monitor.subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<DeviceEvent>`.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A fresh reading replaced the previous one
    StatusUpdated(StatusReading),
    /// First good poll after the device was unavailable
    Available,
    /// A poll failed with a transient error; emitted once per outage
    Unavailable { reason: String },
    /// An outlet or bank changed state between two polls
    OutletChanged { index: u8, on: bool },
    /// The card acknowledged an outlet command
    OutletCommandSent { index: u8, on: bool },
    /// The monitor stopped after a fatal error or shutdown
    Stopped { model: DeviceModel, reason: String },
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<DeviceEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<DeviceEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}
