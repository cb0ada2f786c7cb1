// MIT License - Copyright (c) 2026 Peter Wright
// BlueBOLT CV2 client

use std::collections::BTreeMap;

use crate::error::{BlueBoltError, Result};
use crate::model::{DeviceModel, SensorField};

/// One poll's worth of device state.
///
/// Holds exactly the sensor fields of its model and one entry per outlet or
/// bank. Readings are replaced wholesale each cycle, never patched.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReading {
    pub model: DeviceModel,
    sensors: BTreeMap<SensorField, f64>,
    outlets: BTreeMap<u8, bool>,
    /// UPS power condition code, when reported
    pub power_condition: Option<i64>,
}

impl StatusReading {
    pub(crate) fn new(
        model: DeviceModel,
        sensors: BTreeMap<SensorField, f64>,
        outlets: BTreeMap<u8, bool>,
        power_condition: Option<i64>,
    ) -> Self {
        Self {
            model,
            sensors,
            outlets,
            power_condition,
        }
    }

    pub fn sensor(&self, field: SensorField) -> Option<f64> {
        self.sensors.get(&field).copied()
    }

    /// Sensor values in field order.
    pub fn sensors(&self) -> impl Iterator<Item = (SensorField, f64)> + '_ {
        self.sensors.iter().map(|(f, v)| (*f, *v))
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    /// State of outlet/bank `id` (1-based).
    pub fn outlet(&self, id: u8) -> Option<bool> {
        self.outlets.get(&id).copied()
    }

    /// Outlet states in id order.
    pub fn outlets(&self) -> impl Iterator<Item = (u8, bool)> + '_ {
        self.outlets.iter().map(|(id, on)| (*id, *on))
    }

    pub fn outlet_count(&self) -> usize {
        self.outlets.len()
    }

    /// Whether `other` describes the same outlets (ignores on/off and sensors).
    pub fn same_layout(&self, other: &StatusReading) -> bool {
        self.model == other.model && self.outlets.keys().eq(other.outlets.keys())
    }
}

/// Request to switch one outlet or bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutletCommand {
    /// 1-based outlet or bank index
    pub index: u8,
    pub on: bool,
}

impl OutletCommand {
    pub fn new(index: u8, on: bool) -> Self {
        Self { index, on }
    }

    pub fn on(index: u8) -> Self {
        Self::new(index, true)
    }

    pub fn off(index: u8) -> Self {
        Self::new(index, false)
    }

    /// Check the index against the model's outlet or bank count.
    pub fn validate(&self, model: DeviceModel) -> Result<()> {
        let max = model.switch_count();
        if self.index == 0 || self.index > max {
            return Err(BlueBoltError::InvalidOutlet {
                index: self.index,
                max,
            });
        }
        Ok(())
    }
}

/// Identity of the device attached to the CV2 card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: DeviceModel,
    /// Device class reported by the card (e.g. `km4315`)
    pub class: String,
    /// Device id used to address the attached device
    pub device_id: String,
    pub firmware: Option<String>,
}

impl DeviceInfo {
    pub fn manufacturer(&self) -> &'static str {
        self.model.manufacturer()
    }
}
