// MIT License - Copyright (c) 2026 Peter Wright
// BlueBOLT CV2 client

use std::collections::BTreeMap;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::debug;

use crate::error::{BlueBoltError, DeviceErrorCode, Result};
use crate::model::{lookup_class, DeviceModel, ModelSpec, SensorField};
use crate::status::StatusReading;
use crate::xml::XmlElement;

/// Commands understood by the CV2 card.
///
/// Every request is wrapped in a `<device class=".." id="..">` envelope
/// addressed either to the card itself (class `cv2`, id = MAC) or to the
/// attached device discovered through [`Command::SendFamily`].
///
/// # Exchange
///
/// ```text
/// → <device class="cv2" id="{mac}"><command><sendfamily/></command></device>
/// ← <device ...><kids class="km4315"><k>{device id}</k></kids></device>
/// → <device class="km4315" id="{device id}"><command><sendstatus/></command></device>
/// ← <device ...><voltage>..</voltage>..<outlet id="1">1</outlet>..</device>
/// → <device ...><command xid="set_outlet_3"><outlet id="3">1</outlet></command></device>
/// ← <device ...><ack xid="set_outlet_3"/></device>
/// ```
///
/// The protocol carries no request ids, so each command also knows what a
/// response to it looks like; see [`Command::matches`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `<sendfamily/>`: list devices attached to the card.
    SendFamily,
    /// `<sendinfo/>`: firmware and identity.
    SendInfo,
    /// `<sendstatus/>`: sensors and outlet states.
    SendStatus,
    /// `<outlet id="N">1|0</outlet>` with `xid="set_outlet_N"`.
    SetOutlet { id: u8, on: bool },
}

impl Command {
    /// Short name for logs and errors.
    pub fn name(&self) -> String {
        match self {
            Command::SendFamily => "sendfamily".to_string(),
            Command::SendInfo => "sendinfo".to_string(),
            Command::SendStatus => "sendstatus".to_string(),
            Command::SetOutlet { id, on } => {
                format!("set_outlet_{}={}", id, if *on { "on" } else { "off" })
            }
        }
    }

    /// Transaction id echoed back in the card's `<ack>`.
    pub fn xid(&self) -> Option<String> {
        match self {
            Command::SetOutlet { id, .. } => Some(format!("set_outlet_{}", id)),
            _ => None,
        }
    }

    /// Build the full request datagram.
    pub fn encode(&self, class: &str, id: &str) -> Result<String> {
        let mut writer = Writer::new(Vec::new());

        let mut device = BytesStart::new("device");
        device.push_attribute(("class", class));
        device.push_attribute(("id", id));

        let mut command = BytesStart::new("command");
        let xid = self.xid();
        if let Some(ref xid) = xid {
            command.push_attribute(("xid", xid.as_str()));
        }

        write(&mut writer, Event::Decl(BytesDecl::new("1.0", None, None)))?;
        write(&mut writer, Event::Start(device))?;
        write(&mut writer, Event::Start(command))?;
        match self {
            Command::SendFamily => write(&mut writer, Event::Empty(BytesStart::new("sendfamily")))?,
            Command::SendInfo => write(&mut writer, Event::Empty(BytesStart::new("sendinfo")))?,
            Command::SendStatus => write(&mut writer, Event::Empty(BytesStart::new("sendstatus")))?,
            Command::SetOutlet { id, on } => {
                let id = id.to_string();
                let mut outlet = BytesStart::new("outlet");
                outlet.push_attribute(("id", id.as_str()));
                write(&mut writer, Event::Start(outlet))?;
                write(&mut writer, Event::Text(BytesText::new(if *on { "1" } else { "0" })))?;
                write(&mut writer, Event::End(BytesEnd::new("outlet")))?;
            }
        }
        write(&mut writer, Event::End(BytesEnd::new("command")))?;
        write(&mut writer, Event::End(BytesEnd::new("device")))?;

        String::from_utf8(writer.into_inner()).map_err(|e| BlueBoltError::Encode(e.to_string()))
    }

    /// Whether `response` can be the answer to this command.
    ///
    /// Error responses match every command so that a rejected request fails
    /// immediately instead of timing out.
    pub fn matches(&self, response: &XmlElement) -> bool {
        if response.find("error").is_some() {
            return true;
        }
        match self {
            Command::SendFamily => response.find("kids").is_some(),
            Command::SendInfo => response.find("fwver").is_some(),
            Command::SendStatus => {
                response.find("outlet").is_some()
                    || SensorField::ALL
                        .iter()
                        .any(|f| response.find(f.element()).is_some())
            }
            Command::SetOutlet { .. } => {
                let xid = self.xid();
                response
                    .find_all("ack")
                    .iter()
                    .any(|ack| ack.attr("xid") == xid.as_deref())
            }
        }
    }
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| BlueBoltError::Encode(e.to_string()))
}

/// Fail with the card's error code if the response carries one.
pub fn check_error(response: &XmlElement) -> Result<()> {
    if let Some(err) = response.find("error") {
        let code = err.attr("code").unwrap_or(err.text.trim());
        return Err(BlueBoltError::Device(DeviceErrorCode::from_code(code)));
    }
    Ok(())
}

/// Pick the first supported device out of a `sendfamily` response.
///
/// Returns the model table entry and the id used to address the device.
pub fn parse_family(response: &XmlElement) -> Result<(&'static ModelSpec, String)> {
    check_error(response)?;

    let kids = response.find_all("kids");
    if kids.is_empty() {
        return Err(BlueBoltError::parse("family response has no <kids>"));
    }

    let mut seen = Vec::new();
    for entry in kids {
        let Some(class) = entry.attr("class") else {
            continue;
        };
        match lookup_class(class) {
            Some(spec) => match entry.find_text("k") {
                Some(id) if !id.is_empty() => return Ok((spec, id.to_string())),
                _ => debug!("Device class {} listed without an id", class),
            },
            None => seen.push(class.to_string()),
        }
    }

    Err(BlueBoltError::UnsupportedDevice {
        identifier: if seen.is_empty() {
            "<none>".to_string()
        } else {
            seen.join(",")
        },
    })
}

/// Firmware version from a `sendinfo` response.
pub fn parse_info(response: &XmlElement) -> Result<Option<String>> {
    check_error(response)?;
    Ok(response
        .find_text("fwver")
        .filter(|v| !v.is_empty())
        .map(str::to_string))
}

/// Build a [`StatusReading`] for `model` from a `sendstatus` response.
///
/// Every sensor in the model's set and every outlet `1..=switch_count` must be
/// present; other fields are ignored. Battery level arrives as a 0-1 fraction
/// and is stored as a percentage.
pub fn parse_status(response: &XmlElement, model: DeviceModel) -> Result<StatusReading> {
    check_error(response)?;

    let mut sensors = BTreeMap::new();
    for field in model.sensors().fields() {
        let raw = response
            .find_text(field.element())
            .ok_or_else(|| BlueBoltError::parse(format!("missing <{}>", field.element())))?;
        let mut value: f64 = raw.parse().map_err(|_| {
            BlueBoltError::parse(format!("<{}> is not a number", field.element()))
        })?;
        if field == SensorField::BatteryLevel {
            value *= 100.0;
        }
        sensors.insert(field, value);
    }

    let count = model.switch_count();
    let mut outlets = BTreeMap::new();
    for element in response.find_all("outlet") {
        let Some(id) = element.attr("id").and_then(|v| v.trim().parse::<u8>().ok()) else {
            debug!("Ignoring outlet element without a numeric id");
            continue;
        };
        if id == 0 || id > count {
            debug!("Ignoring outlet {} (model has {})", id, count);
            continue;
        }
        outlets.insert(id, element.text.trim() == "1");
    }
    if let Some(missing) = (1..=count).find(|id| !outlets.contains_key(id)) {
        return Err(BlueBoltError::parse(format!("missing outlet {}", missing)));
    }

    let power_condition = response
        .find_text("pwrcond")
        .and_then(|v| v.parse::<i64>().ok());

    Ok(StatusReading::new(model, sensors, outlets, power_condition))
}

/// Check that a response acknowledges `command`.
///
/// A refusal arrives as `<error>` and surfaces as `Device`. A reply that
/// carries no matching `<ack xid>` is malformed.
pub fn parse_ack(response: &XmlElement, command: &Command) -> Result<()> {
    check_error(response)?;
    match command.xid() {
        Some(_) if command.matches(response) => Ok(()),
        Some(xid) => Err(BlueBoltError::parse(format!("no <ack> for {}", xid))),
        None => Err(BlueBoltError::parse(format!("{} takes no <ack>", command.name()))),
    }
}
