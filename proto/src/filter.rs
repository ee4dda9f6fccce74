use crate::geometry::Geometry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A structured predicate over entities.
///
/// All set leaf predicates AND together; `any` is a disjunction over its
/// children and `not` negates its child. The empty filter matches every
/// entity. Evaluation lives in argus-core; this is the wire shape shared
/// by queries, watch subscriptions and config selectors.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    /// Exact entity id.
    pub id: Option<String>,
    /// Exact label.
    pub label: Option<String>,
    /// Every listed component field number must be present. Empty matches all.
    pub components: Vec<u32>,
    /// Exact controller name.
    pub controller_id: Option<String>,
    /// Exact configuration key.
    pub config_key: Option<String>,
    pub device: Option<DeviceFilter>,
    /// Entity id that must appear in taskable.context.
    pub task_context: Option<String>,
    /// Entity id that must appear in taskable.assignee.
    pub task_assignee: Option<String>,
    /// Exact track.tracker.
    pub tracker: Option<String>,
    pub geo: Option<GeoFilter>,
    /// Disjunction: at least one child must match. Empty is ignored.
    pub any: Vec<Filter>,
    /// Negation of the child filter.
    pub not: Option<Box<Filter>>,
}

impl Filter {
    /// The filter that matches every entity.
    pub fn all() -> Self { Self::default() }

    pub fn with_id(id: impl Into<String>) -> Self { Self { id: Some(id.into()), ..Default::default() } }
}

/// Sub-filter over the device component. `labels` is a subset match: every
/// listed key must be present on the device with an equal value. Descriptor
/// sub-filters compare only the fields that are set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFilter {
    pub labels: BTreeMap<String, String>,
    pub usb: Option<UsbFilter>,
    pub ip: Option<IpFilter>,
    pub serial: Option<SerialFilter>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub product: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpFilter {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialFilter {
    pub path: Option<String>,
}

/// Geometric sub-filter: either an embedded geometry, or a reference to an
/// entity whose shape is to be used. The entity's geo point must intersect
/// the axis-aligned bounding box of the filter geometry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoFilter {
    pub geometry: Option<Geometry>,
    /// Reference by id. Currently evaluates true unconditionally; kept on
    /// the wire so the contract is stable once resolution lands.
    pub entity_id: Option<String>,
}
