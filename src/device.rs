// MIT License - Copyright (c) 2026 Peter Wright
// BlueBOLT CV2 client

use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::constants::CV2_CLASS;
use crate::error::{BlueBoltError, DeviceErrorCode, Result};
use crate::model::DeviceModel;
use crate::protocol::{self, Command};
use crate::status::{DeviceInfo, OutletCommand, StatusReading};
use crate::transport::{TransportStats, UdpTransport};
use crate::xml::XmlElement;

/// A power conditioner reached through its CV2 network card.
///
/// # Example
///
/// ```no_run
/// use bluebolt_cv2::{BlueBoltDevice, DeviceConfig, OutletCommand};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = DeviceConfig::builder()
///         .host("192.168.0.162")
///         .mac("1065a31b2c3d")
///         .build()?;
///
///     let device = BlueBoltDevice::connect(config).await?;
///     println!("{} firmware {:?}", device.model(), device.info().firmware);
///
///     let status = device.fetch_status().await?;
///     for (id, on) in status.outlets() {
///         println!("{}: {}", device.model().switch_label(id), on);
///     }
///
///     device.set_outlet(OutletCommand::on(3)).await?;
///     Ok(())
/// }
/// ```
pub struct BlueBoltDevice {
    config: DeviceConfig,
    transport: UdpTransport,
    info: DeviceInfo,
}

impl BlueBoltDevice {
    /// Open the UDP session, discover the attached device and read its
    /// firmware version.
    ///
    /// Fails with `Auth` if the card rejects the MAC and `UnsupportedDevice`
    /// if no attached device is in the model table. The socket is released on
    /// any failure.
    pub async fn connect(config: DeviceConfig) -> Result<Self> {
        info!(
            "Connecting to BlueBOLT CV2 at {} (token {})",
            config.address(),
            config.token
        );

        let transport = UdpTransport::connect(&config).await?;

        let response = transport
            .request(&Command::SendFamily, CV2_CLASS, config.token.expose())
            .await
            .map_err(|e| map_error(&config, e))?;
        let (spec, device_id) =
            protocol::parse_family(&response).map_err(|e| map_error(&config, e))?;

        info!(
            "Discovered {} {} (class {}, id {})",
            spec.manufacturer, spec.name, spec.class, device_id
        );

        let mut device = Self {
            config,
            transport,
            info: DeviceInfo {
                model: spec.model,
                class: spec.class.to_string(),
                device_id,
                firmware: None,
            },
        };

        match device.fetch_info().await {
            Ok(info) => device.info = info,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Could not read firmware version: {}", e),
        }

        Ok(device)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn model(&self) -> DeviceModel {
        self.info.model
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Query identity and firmware version.
    pub async fn fetch_info(&self) -> Result<DeviceInfo> {
        let response = self.request(&Command::SendInfo).await?;
        let firmware = protocol::parse_info(&response).map_err(|e| self.map_error(e))?;
        if let Some(ref fw) = firmware {
            debug!("Firmware version: {}", fw);
        }
        Ok(DeviceInfo {
            firmware,
            ..self.info.clone()
        })
    }

    /// Poll sensors and outlet states.
    pub async fn fetch_status(&self) -> Result<StatusReading> {
        let response = self.request(&Command::SendStatus).await?;
        protocol::parse_status(&response, self.model()).map_err(|e| self.map_error(e))
    }

    /// Switch an outlet or bank.
    ///
    /// The index is checked against the model before anything is sent. `Ok`
    /// only means the card acknowledged the command; poll again to see the
    /// relay state. A refusal from the card is a `Device` error.
    pub async fn set_outlet(&self, command: OutletCommand) -> Result<()> {
        command.validate(self.model())?;
        info!(
            "Setting {} {}",
            self.model().switch_label(command.index),
            if command.on { "on" } else { "off" }
        );

        let wire = Command::SetOutlet {
            id: command.index,
            on: command.on,
        };
        let response = self.request(&wire).await?;
        protocol::parse_ack(&response, &wire).map_err(|e| self.map_error(e))?;
        debug!("{} acknowledged", wire.name());
        Ok(())
    }

    /// Close the session.
    pub async fn disconnect(self) -> Result<()> {
        info!("Closing UDP session to {}", self.transport.peer());
        drop(self.transport);
        Ok(())
    }

    async fn request(&self, command: &Command) -> Result<XmlElement> {
        self.transport
            .request(command, &self.info.class, &self.info.device_id)
            .await
            .map_err(|e| self.map_error(e))
    }

    fn map_error(&self, error: BlueBoltError) -> BlueBoltError {
        map_error(&self.config, error)
    }
}

/// Turn a rejected-token reply into `Auth` and scrub the token from details.
///
/// Card-supplied text can echo the MAC back, so every string that came off
/// the wire is passed through `redact`.
fn map_error(config: &DeviceConfig, error: BlueBoltError) -> BlueBoltError {
    match error {
        BlueBoltError::Device(code) if code.is_auth() => BlueBoltError::Auth {
            host: config.host.clone(),
            token: config.token.redacted(),
        },
        BlueBoltError::Device(DeviceErrorCode::Other(text)) => {
            BlueBoltError::Device(DeviceErrorCode::Other(config.token.redact(&text)))
        }
        BlueBoltError::Parse { details } => BlueBoltError::Parse {
            details: config.token.redact(&details),
        },
        BlueBoltError::UnsupportedDevice { identifier } => BlueBoltError::UnsupportedDevice {
            identifier: config.token.redact(&identifier),
        },
        other => other,
    }
}
