use crate::{fieldnum, geometry::Geometry, geometry::Position};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Message priority, ordered ascendingly by urgency.
/// An absent priority component reads as `Routine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Unspecified = 0,
    #[default]
    Routine = 1,
    Immediate = 2,
    Flash = 3,
}

impl Priority {
    /// All priorities, highest urgency first. This is the pop/drain order.
    pub const DESCENDING: [Priority; 4] = [Priority::Flash, Priority::Immediate, Priority::Routine, Priority::Unspecified];

    pub fn index(self) -> usize { self as usize }

    pub fn from_index(index: usize) -> Option<Priority> {
        match index {
            0 => Some(Priority::Unspecified),
            1 => Some(Priority::Routine),
            2 => Some(Priority::Immediate),
            3 => Some(Priority::Flash),
            _ => None,
        }
    }
}

/// Validity window. `from` is stamped to push time when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Lifetime {
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// The logical actor that owns an entity, and the node it lives on.
/// `node` is stamped with the local node id on push when absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Controller {
    pub id: Option<String>,
    pub node: Option<String>,
}

/// A configuration directive: `selector` narrows which devices of
/// `controller` accept the `key`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub key: String,
    pub controller: String,
    pub selector: Option<crate::filter::Filter>,
    pub value: Option<crate::value::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    #[default]
    Unknown,
    Online,
    Offline,
    Degraded,
}

/// Declares that a device accepts a configuration key, optionally with a
/// schema describing the accepted value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configurable {
    pub key: String,
    pub schema: Option<crate::value::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeDescriptor {
    pub hostname: String,
    pub os: String,
    pub arch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub product: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialDescriptor {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpDescriptor {
    pub host: String,
    pub port: u16,
}

/// A device owned by some controller. At most one concrete descriptor
/// (node / usb / serial / ip) is typically present, but nothing enforces it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    pub parent: Option<String>,
    pub state: DeviceState,
    pub labels: BTreeMap<String, String>,
    pub configurable: Vec<Configurable>,
    pub node: Option<NodeDescriptor>,
    pub usb: Option<UsbDescriptor>,
    pub serial: Option<SerialDescriptor>,
    pub ip: Option<IpDescriptor>,
}

/// Links to other entities by id. The graph is resolved lazily by lookup,
/// never by pointer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Taskable {
    pub context: Vec<String>,
    pub assignee: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Track {
    pub tracker: String,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Kinematics {
    pub speed_mps: Option<f64>,
    pub course: Option<f64>,
    pub climb_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Orientation {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Camera {
    pub id: String,
    pub label: Option<String>,
    pub stream_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Power {
    pub battery_percent: Option<f64>,
    pub charging: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Link {
    pub rssi_dbm: Option<f64>,
    pub snr_db: Option<f64>,
}

/// A sparse component-structured entity. The id is the only mandatory
/// field; an entity is the union of whichever components are present.
/// Components never cross-reference each other structurally.
///
/// Field declaration order is the canonical serialization order for the
/// world file: id, label, controller, lifetime, priority, symbol, geo,
/// then the rest alphabetically.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Entity {
    pub id: String,
    pub label: Option<String>,
    pub controller: Option<Controller>,
    pub lifetime: Option<Lifetime>,
    pub priority: Option<Priority>,
    pub symbol: Option<String>,
    pub geo: Option<Position>,
    pub bearing: Option<f64>,
    pub cameras: Option<Vec<Camera>>,
    pub config: Option<Config>,
    pub device: Option<Device>,
    pub kinematics: Option<Kinematics>,
    pub link: Option<Link>,
    pub orientation: Option<Orientation>,
    pub power: Option<Power>,
    pub shape: Option<Geometry>,
    pub taskable: Option<Taskable>,
    pub track: Option<Track>,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Self { Self { id: id.into(), ..Default::default() } }

    /// Effective priority: absent reads as Routine.
    pub fn effective_priority(&self) -> Priority { self.priority.unwrap_or(Priority::Routine) }

    /// The node that owns this entity, if stamped.
    pub fn owner_node(&self) -> Option<&str> { self.controller.as_ref().and_then(|c| c.node.as_deref()) }

    /// The logical controller name, if any.
    pub fn controller_id(&self) -> Option<&str> { self.controller.as_ref().and_then(|c| c.id.as_deref()) }

    pub fn has_component(&self, field: u32) -> bool {
        match field {
            fieldnum::ID => true,
            fieldnum::LABEL => self.label.is_some(),
            fieldnum::LIFETIME => self.lifetime.is_some(),
            fieldnum::PRIORITY => self.priority.is_some(),
            fieldnum::CONTROLLER => self.controller.is_some(),
            fieldnum::CONFIG => self.config.is_some(),
            fieldnum::DEVICE => self.device.is_some(),
            fieldnum::GEO => self.geo.is_some(),
            fieldnum::SYMBOL => self.symbol.is_some(),
            fieldnum::TASKABLE => self.taskable.is_some(),
            fieldnum::TRACK => self.track.is_some(),
            fieldnum::BEARING => self.bearing.is_some(),
            fieldnum::KINEMATICS => self.kinematics.is_some(),
            fieldnum::SHAPE => self.shape.is_some(),
            fieldnum::ORIENTATION => self.orientation.is_some(),
            fieldnum::CAMERAS => self.cameras.is_some(),
            fieldnum::POWER => self.power.is_some(),
            fieldnum::LINK => self.link.is_some(),
            _ => false,
        }
    }

    /// Merge `incoming` into this entity component-by-component: each set
    /// top-level field replaces the stored one whole, unset fields preserve
    /// the stored value. Nested components are never deep-merged.
    pub fn merge_from(&mut self, incoming: Entity) {
        macro_rules! take {
            ($field:ident) => {
                if incoming.$field.is_some() {
                    self.$field = incoming.$field;
                }
            };
        }
        take!(label);
        take!(controller);
        take!(lifetime);
        take!(priority);
        take!(symbol);
        take!(geo);
        take!(bearing);
        take!(cameras);
        take!(config);
        take!(device);
        take!(kinematics);
        take!(link);
        take!(orientation);
        take!(power);
        take!(shape);
        take!(taskable);
        take!(track);
    }
}
