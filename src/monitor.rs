// MIT License - Copyright (c) 2026 Peter Wright
// BlueBOLT CV2 client

use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::device::BlueBoltDevice;
use crate::error::Result;
use crate::event::{event_channel, DeviceEvent, EventReceiver, EventSender};
use crate::status::{OutletCommand, StatusReading};

#[derive(Debug, Default)]
struct MonitorState {
    reading: Option<StatusReading>,
    /// `None` until the first poll completes
    available: Option<bool>,
}

/// Polls one device on its scan interval and keeps the latest reading.
///
/// Transient failures only flip the device to unavailable; the next good
/// poll brings it back. A fatal error (rejected token) ends [`run`](Self::run).
/// Outlet commands and polls share the device's single-flight transport, so a
/// command issued mid-poll waits for the poll to finish. Refreshes are
/// serialised end to end, so state is always updated in poll order.
pub struct DeviceMonitor {
    device: BlueBoltDevice,
    /// Held from request to state update
    refresh_lock: Mutex<()>,
    state: RwLock<MonitorState>,
    event_tx: EventSender,
}

impl DeviceMonitor {
    pub fn new(device: BlueBoltDevice) -> Self {
        let (event_tx, _event_rx) = event_channel(64);
        Self {
            device,
            refresh_lock: Mutex::new(()),
            state: RwLock::new(MonitorState::default()),
            event_tx,
        }
    }

    /// Subscribe to monitor events.
    pub fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    pub fn device(&self) -> &BlueBoltDevice {
        &self.device
    }

    /// Latest reading, or `None` while the device is unavailable.
    pub async fn reading(&self) -> Option<StatusReading> {
        let state = self.state.read().await;
        if state.available == Some(true) {
            state.reading.clone()
        } else {
            None
        }
    }

    pub async fn is_available(&self) -> bool {
        self.state.read().await.available == Some(true)
    }

    /// Poll once.
    ///
    /// Returns the new reading, `None` if the poll failed transiently, or the
    /// error if it was fatal.
    pub async fn refresh(&self) -> Result<Option<StatusReading>> {
        let _guard = self.refresh_lock.lock().await;
        match self.device.fetch_status().await {
            Ok(reading) => {
                let mut state = self.state.write().await;
                let was_available = state.available;

                if let Some(previous) = state.reading.as_ref() {
                    if !previous.same_layout(&reading) {
                        warn!("Outlet layout changed between polls");
                    }
                    for (index, on) in reading.outlets() {
                        if previous.outlet(index) != Some(on) {
                            debug!(
                                "{} is now {}",
                                reading.model.switch_label(index),
                                if on { "on" } else { "off" }
                            );
                            let _ = self.event_tx.send(DeviceEvent::OutletChanged { index, on });
                        }
                    }
                }

                state.reading = Some(reading.clone());
                state.available = Some(true);
                drop(state);

                if was_available != Some(true) {
                    info!("{} is available", self.device.model());
                    let _ = self.event_tx.send(DeviceEvent::Available);
                }
                let _ = self.event_tx.send(DeviceEvent::StatusUpdated(reading.clone()));
                Ok(Some(reading))
            }
            Err(e) if e.is_transient() => {
                let mut state = self.state.write().await;
                let was_available = state.available;
                state.available = Some(false);
                drop(state);

                if was_available == Some(false) {
                    debug!("Poll failed while unavailable: {}", e);
                } else {
                    warn!("{} is unavailable: {}", self.device.model(), e);
                    let _ = self.event_tx.send(DeviceEvent::Unavailable {
                        reason: e.to_string(),
                    });
                }
                Ok(None)
            }
            Err(e) => {
                error!("Polling {} failed: {}", self.device.model(), e);
                Err(e)
            }
        }
    }

    /// Send an outlet command, then poll immediately to pick up the result.
    pub async fn set_outlet(&self, command: OutletCommand) -> Result<()> {
        self.device.set_outlet(command).await?;
        let _ = self.event_tx.send(DeviceEvent::OutletCommandSent {
            index: command.index,
            on: command.on,
        });
        self.refresh().await?;
        Ok(())
    }

    /// Poll on the configured scan interval until `shutdown` turns true or a
    /// fatal error occurs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        // interval() panics on a zero period
        let scan_interval = self.device.config().scan_interval.max(Duration::from_millis(1));
        let mut ticker = interval(scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Polling {} every {}s",
            self.device.model(),
            scan_interval.as_secs_f64()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        let _ = self.event_tx.send(DeviceEvent::Stopped {
                            model: self.device.model(),
                            reason: e.to_string(),
                        });
                        return Err(e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Monitor shutting down");
                        break;
                    }
                }
            }
        }

        let _ = self.event_tx.send(DeviceEvent::Stopped {
            model: self.device.model(),
            reason: "shutdown".to_string(),
        });
        Ok(())
    }
}
