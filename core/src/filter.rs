//! Evaluate structured filter predicates against entities. This is the
//! scan-side evaluator: every lookup that is not a direct id fetch funnels
//! through here, including watch subscriptions and config selectors.

use argus_proto::{DeviceFilter, Entity, Filter, GeoFilter};

/// Evaluate a filter against an entity. An absent filter matches all.
pub fn matches(filter: Option<&Filter>, entity: &Entity) -> bool {
    match filter {
        Some(f) => matches_filter(f, entity),
        None => true,
    }
}

/// All set leaf predicates AND together; `any` is a disjunction, `not` a
/// negation. A required sub-filter over an absent component fails.
fn matches_filter(f: &Filter, e: &Entity) -> bool {
    if let Some(id) = &f.id {
        if &e.id != id {
            return false;
        }
    }
    if let Some(label) = &f.label {
        if e.label.as_ref() != Some(label) {
            return false;
        }
    }
    // empty component list matches all
    if !f.components.iter().all(|&field| e.has_component(field)) {
        return false;
    }
    if let Some(controller_id) = &f.controller_id {
        if e.controller_id() != Some(controller_id.as_str()) {
            return false;
        }
    }
    if let Some(key) = &f.config_key {
        match &e.config {
            Some(config) if &config.key == key => {}
            _ => return false,
        }
    }
    if let Some(device_filter) = &f.device {
        match &e.device {
            Some(device) => {
                if !matches_device(device_filter, device) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if let Some(target) = &f.task_context {
        match &e.taskable {
            Some(t) if t.context.contains(target) => {}
            _ => return false,
        }
    }
    if let Some(target) = &f.task_assignee {
        match &e.taskable {
            Some(t) if t.assignee.contains(target) => {}
            _ => return false,
        }
    }
    if let Some(tracker) = &f.tracker {
        match &e.track {
            Some(track) if &track.tracker == tracker => {}
            _ => return false,
        }
    }
    if let Some(geo) = &f.geo {
        if !matches_geo(geo, e) {
            return false;
        }
    }
    if !f.any.is_empty() && !f.any.iter().any(|child| matches_filter(child, e)) {
        return false;
    }
    if let Some(child) = &f.not {
        if matches_filter(child, e) {
            return false;
        }
    }
    true
}

fn matches_device(f: &DeviceFilter, device: &argus_proto::Device) -> bool {
    for (key, want) in &f.labels {
        if device.labels.get(key) != Some(want) {
            return false;
        }
    }
    if let Some(usb_filter) = &f.usb {
        match &device.usb {
            Some(usb) => {
                if usb_filter.vendor_id.is_some_and(|v| v != usb.vendor_id) {
                    return false;
                }
                if usb_filter.product_id.is_some_and(|p| p != usb.product_id) {
                    return false;
                }
                if usb_filter.product.as_ref().is_some_and(|p| Some(p) != usb.product.as_ref()) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if let Some(ip_filter) = &f.ip {
        match &device.ip {
            Some(ip) => {
                if ip_filter.host.as_ref().is_some_and(|h| h != &ip.host) {
                    return false;
                }
                if ip_filter.port.is_some_and(|p| p != ip.port) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if let Some(serial_filter) = &f.serial {
        match &device.serial {
            Some(serial) => {
                if serial_filter.path.as_ref().is_some_and(|p| p != &serial.path) {
                    return false;
                }
            }
            None => return false,
        }
    }
    true
}

/// The entity's geo point must intersect the axis-aligned bounding box of
/// the filter geometry. The reference-by-id branch evaluates true
/// unconditionally (open extension, see GeoFilter).
fn matches_geo(f: &GeoFilter, e: &Entity) -> bool {
    if let Some(geometry) = &f.geometry {
        let Some(rect) = geometry.bounding_rect() else {
            // vertexless geometry intersects nothing
            return false;
        };
        return match &e.geo {
            Some(point) => rect.contains(point),
            None => false,
        };
    }
    if f.entity_id.is_some() {
        return true;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_proto::{fieldnum, Config, Controller, Device, Geometry, Position, Taskable, Track, UsbDescriptor, UsbFilter};

    fn tank() -> Entity {
        let mut e = Entity::new("e1");
        e.label = Some("tank".into());
        e.geo = Some(Position::new(11.0, 48.0));
        e.controller = Some(Controller { id: Some("radar".into()), node: Some("node/a".into()) });
        e.track = Some(Track { tracker: "trk-9".into(), confidence: None });
        e
    }

    #[test]
    fn absent_filter_matches_all() {
        assert!(matches(None, &tank()));
        assert!(matches(Some(&Filter::all()), &tank()));
    }

    #[test]
    fn leaves_and_together() {
        let f = Filter { label: Some("tank".into()), controller_id: Some("radar".into()), ..Default::default() };
        assert!(matches(Some(&f), &tank()));

        let f = Filter { label: Some("tank".into()), controller_id: Some("ais".into()), ..Default::default() };
        assert!(!matches(Some(&f), &tank()));
    }

    #[test]
    fn component_presence() {
        let f = Filter { components: vec![fieldnum::GEO, fieldnum::TRACK], ..Default::default() };
        assert!(matches(Some(&f), &tank()));

        let f = Filter { components: vec![fieldnum::DEVICE], ..Default::default() };
        assert!(!matches(Some(&f), &tank()));
    }

    #[test]
    fn or_and_not_combinators() {
        let f = Filter {
            any: vec![Filter::with_id("other"), Filter { label: Some("tank".into()), ..Default::default() }],
            ..Default::default()
        };
        assert!(matches(Some(&f), &tank()));

        let f = Filter { not: Some(Box::new(Filter { label: Some("tank".into()), ..Default::default() })), ..Default::default() };
        assert!(!matches(Some(&f), &tank()));
    }

    #[test]
    fn geo_bounding_box() {
        let enclosing = Geometry::Polygon {
            exterior: vec![Position::new(10.0, 47.0), Position::new(12.0, 47.0), Position::new(12.0, 49.0), Position::new(10.0, 49.0)],
            holes: vec![],
        };
        let f = Filter { geo: Some(GeoFilter { geometry: Some(enclosing), entity_id: None }), ..Default::default() };
        assert!(matches(Some(&f), &tank()));

        let far = Geometry::Polygon {
            exterior: vec![Position::new(-1.0, -1.0), Position::new(1.0, -1.0), Position::new(1.0, 1.0), Position::new(-1.0, 1.0)],
            holes: vec![],
        };
        let f = Filter { geo: Some(GeoFilter { geometry: Some(far), entity_id: None }), ..Default::default() };
        assert!(!matches(Some(&f), &tank()));
    }

    #[test]
    fn geo_filter_requires_point_on_entity() {
        let f = Filter {
            geo: Some(GeoFilter { geometry: Some(Geometry::Point(Position::new(0.0, 0.0))), entity_id: None }),
            ..Default::default()
        };
        assert!(!matches(Some(&f), &Entity::new("no-geo")));
    }

    #[test]
    fn geo_reference_by_id_is_permissive() {
        let f = Filter { geo: Some(GeoFilter { geometry: None, entity_id: Some("area-1".into()) }), ..Default::default() };
        assert!(matches(Some(&f), &Entity::new("anything")));
    }

    #[test]
    fn device_label_subset_and_usb() {
        let mut e = Entity::new("dev1");
        e.device = Some(Device {
            labels: [("site".to_string(), "alpha".to_string()), ("rack".to_string(), "r2".to_string())].into(),
            usb: Some(UsbDescriptor { vendor_id: 0x1a86, product_id: 0x7523, product: Some("CH340".into()) }),
            ..Default::default()
        });

        let f = Filter {
            device: Some(DeviceFilter {
                labels: [("site".to_string(), "alpha".to_string())].into(),
                usb: Some(UsbFilter { vendor_id: Some(0x1a86), product_id: None, product: None }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches(Some(&f), &e));

        let f = Filter {
            device: Some(DeviceFilter { labels: [("site".to_string(), "bravo".to_string())].into(), ..Default::default() }),
            ..Default::default()
        };
        assert!(!matches(Some(&f), &e));
    }

    #[test]
    fn taskable_and_config_key() {
        let mut e = Entity::new("t1");
        e.taskable = Some(Taskable { context: vec!["ctx-1".into()], assignee: vec!["unit-7".into()] });
        e.config = Some(Config { key: "meshtastic.usb.v0".into(), controller: "meshtastic".into(), ..Default::default() });

        let f = Filter { task_context: Some("ctx-1".into()), ..Default::default() };
        assert!(matches(Some(&f), &e));
        let f = Filter { task_assignee: Some("unit-8".into()), ..Default::default() };
        assert!(!matches(Some(&f), &e));
        let f = Filter { config_key: Some("meshtastic.usb.v0".into()), ..Default::default() };
        assert!(matches(Some(&f), &e));
    }
}
