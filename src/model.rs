// MIT License - Copyright (c) 2026 Peter Wright
// BlueBOLT CV2 client

use std::fmt;

use bitflags::bitflags;

use crate::error::{BlueBoltError, Result};

/// A named sensor value reported in a status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorField {
    Voltage,
    Current,
    Power,
    ApparentPower,
    PowerFactor,
    Temperature,
    VoltageOut,
    BatteryLevel,
    LoadLevel,
}

impl SensorField {
    pub const ALL: [SensorField; 9] = [
        SensorField::Voltage,
        SensorField::Current,
        SensorField::Power,
        SensorField::ApparentPower,
        SensorField::PowerFactor,
        SensorField::Temperature,
        SensorField::VoltageOut,
        SensorField::BatteryLevel,
        SensorField::LoadLevel,
    ];

    /// Element name in the status response.
    pub fn element(&self) -> &'static str {
        match self {
            Self::Voltage => "voltage",
            Self::Current => "amperage",
            Self::Power => "wattage",
            Self::ApparentPower => "pwrva",
            Self::PowerFactor => "pwrfact",
            Self::Temperature => "temperature",
            Self::VoltageOut => "voltageout",
            Self::BatteryLevel => "battlevel",
            Self::LoadLevel => "loadlevel",
        }
    }

    /// Stable snake_case key used in published state.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Voltage => "voltage",
            Self::Current => "current",
            Self::Power => "power",
            Self::ApparentPower => "apparent_power",
            Self::PowerFactor => "power_factor",
            Self::Temperature => "temperature",
            Self::VoltageOut => "voltage_out",
            Self::BatteryLevel => "battery_level",
            Self::LoadLevel => "load_level",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Self::Voltage | Self::VoltageOut => "V",
            Self::Current => "A",
            Self::Power => "W",
            Self::ApparentPower => "VA",
            Self::PowerFactor => "",
            Self::Temperature => "°C",
            Self::BatteryLevel | Self::LoadLevel => "%",
        }
    }

    fn flag(&self) -> SensorSet {
        match self {
            Self::Voltage => SensorSet::VOLTAGE,
            Self::Current => SensorSet::CURRENT,
            Self::Power => SensorSet::POWER,
            Self::ApparentPower => SensorSet::APPARENT_POWER,
            Self::PowerFactor => SensorSet::POWER_FACTOR,
            Self::Temperature => SensorSet::TEMPERATURE,
            Self::VoltageOut => SensorSet::VOLTAGE_OUT,
            Self::BatteryLevel => SensorSet::BATTERY_LEVEL,
            Self::LoadLevel => SensorSet::LOAD_LEVEL,
        }
    }
}

impl fmt::Display for SensorField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

bitflags! {
    /// Set of sensor fields a model reports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SensorSet: u16 {
        const VOLTAGE        = 1 << 0;
        const CURRENT        = 1 << 1;
        const POWER          = 1 << 2;
        const APPARENT_POWER = 1 << 3;
        const POWER_FACTOR   = 1 << 4;
        const TEMPERATURE    = 1 << 5;
        const VOLTAGE_OUT    = 1 << 6;
        const BATTERY_LEVEL  = 1 << 7;
        const LOAD_LEVEL     = 1 << 8;

        /// Rack power conditioners with individually switched outlets.
        const CONDITIONER = Self::VOLTAGE.bits()
            | Self::CURRENT.bits()
            | Self::POWER.bits()
            | Self::TEMPERATURE.bits();
        /// Battery backup units with switched banks.
        const UPS = Self::VOLTAGE.bits()
            | Self::CURRENT.bits()
            | Self::POWER.bits()
            | Self::VOLTAGE_OUT.bits()
            | Self::BATTERY_LEVEL.bits()
            | Self::LOAD_LEVEL.bits();
    }
}

impl SensorSet {
    pub fn has(&self, field: SensorField) -> bool {
        self.contains(field.flag())
    }

    /// Fields in this set, in [`SensorField::ALL`] order.
    pub fn fields(&self) -> Vec<SensorField> {
        SensorField::ALL
            .into_iter()
            .filter(|f| self.has(*f))
            .collect()
    }
}

/// What a switch entity controls on a given model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Outlet,
    OutletBank,
}

impl ControlKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Outlet => "Outlet",
            Self::OutletBank => "Outlet Bank",
        }
    }
}

/// Supported BlueBOLT-enabled devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceModel {
    M4315Pro,
    M4320Pro,
    Mb1500,
    F1500Ups,
    F1500UpsE,
}

/// Static layout for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    /// Device class reported by the CV2 in its family list
    pub class: &'static str,
    pub model: DeviceModel,
    pub name: &'static str,
    pub manufacturer: &'static str,
    pub control: ControlKind,
    pub switch_count: u8,
    pub sensors: SensorSet,
}

/// Device class → layout. One line per supported model.
pub const MODEL_TABLE: [ModelSpec; 5] = [
    ModelSpec { class: "km4315", model: DeviceModel::M4315Pro, name: "M4315-PRO", manufacturer: "Panamax", control: ControlKind::Outlet, switch_count: 8, sensors: SensorSet::CONDITIONER },
    ModelSpec { class: "km4320", model: DeviceModel::M4320Pro, name: "M4320-PRO", manufacturer: "Panamax", control: ControlKind::Outlet, switch_count: 8, sensors: SensorSet::CONDITIONER },
    ModelSpec { class: "kmb1500", model: DeviceModel::Mb1500, name: "MB1500", manufacturer: "Panamax", control: ControlKind::OutletBank, switch_count: 4, sensors: SensorSet::UPS },
    ModelSpec { class: "kf1500", model: DeviceModel::F1500Ups, name: "F1500-UPS", manufacturer: "Furman", control: ControlKind::OutletBank, switch_count: 4, sensors: SensorSet::UPS },
    ModelSpec { class: "kf1500e", model: DeviceModel::F1500UpsE, name: "F1500-UPS-E", manufacturer: "Furman", control: ControlKind::OutletBank, switch_count: 4, sensors: SensorSet::UPS },
];

/// Map a CV2 device class identifier to a model.
///
/// Unknown identifiers fail rather than falling back to a guessed layout.
pub fn detect_model(identifier: &str) -> Result<DeviceModel> {
    lookup_class(identifier)
        .map(|spec| spec.model)
        .ok_or_else(|| BlueBoltError::UnsupportedDevice {
            identifier: identifier.to_string(),
        })
}

/// Table entry for a device class, if supported.
pub fn lookup_class(identifier: &str) -> Option<&'static ModelSpec> {
    let identifier = identifier.trim();
    MODEL_TABLE
        .iter()
        .find(|spec| spec.class.eq_ignore_ascii_case(identifier))
}

impl DeviceModel {
    pub fn spec(&self) -> &'static ModelSpec {
        match self {
            Self::M4315Pro => &MODEL_TABLE[0],
            Self::M4320Pro => &MODEL_TABLE[1],
            Self::Mb1500 => &MODEL_TABLE[2],
            Self::F1500Ups => &MODEL_TABLE[3],
            Self::F1500UpsE => &MODEL_TABLE[4],
        }
    }

    pub fn name(&self) -> &'static str {
        self.spec().name
    }

    pub fn manufacturer(&self) -> &'static str {
        self.spec().manufacturer
    }

    pub fn class(&self) -> &'static str {
        self.spec().class
    }

    pub fn control(&self) -> ControlKind {
        self.spec().control
    }

    /// Number of switchable outlets or banks.
    pub fn switch_count(&self) -> u8 {
        self.spec().switch_count
    }

    pub fn sensors(&self) -> SensorSet {
        self.spec().sensors
    }

    /// Default display name for switch `id`, e.g. "Outlet 3" or "Outlet Bank 2".
    pub fn switch_label(&self, id: u8) -> String {
        format!("{} {}", self.control().label(), id)
    }

    /// Parse a model name as written in config files (`"M4315-PRO"`, `"f1500-ups-e"`).
    pub fn from_name(name: &str) -> Option<Self> {
        MODEL_TABLE
            .iter()
            .find(|spec| spec.name.eq_ignore_ascii_case(name.trim()))
            .map(|spec| spec.model)
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
