//! Device tree and attribute dispatch.
//!
//! The device sub-tree is built from `tree.<adapter>.observatory` at startup:
//! each node has a `kind`, a `device_number` and optional nested
//! `components`; every other key is an option, inherited downward (base URL
//! and protocol usually live on the root).
//!
//! Attribute dispatch is a statically declared table keyed by
//! `(kind, attribute, direction)`. Most attributes are direct protocol
//! GET/PUT calls against `{base}/{kind}/{index}/{attribute}`; table entries
//! add parameter pre-processors (coordinate parsing, hour-angle conversion,
//! UTC formatting), result post-processors, or vendor action payloads.

use super::coords;
use ocs_common::TreeError;
use serde_json::{Map, Value as Json};
use tracing::warn;

pub mod kinds {
    pub const MOUNT: &str = "telescope";
    pub const DOME: &str = "dome";
    pub const CAMERA: &str = "camera";
    pub const FILTERWHEEL: &str = "filterwheel";
    pub const FOCUSER: &str = "focuser";
    pub const ROTATOR: &str = "rotator";
    pub const SWITCH: &str = "switch";
    pub const SAFETYMONITOR: &str = "safetymonitor";
    pub const COVERCALIBRATOR: &str = "covercalibrator";
    pub const COVERCALIBRATOR_OCA: &str = "covercalibratorOCA";
    pub const TERTIARY: &str = "tertiary";
    pub const TERTIARY_OCA: &str = "tertiaryOCA";
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceConfigError {
    #[error("device node {0} is not a mapping")]
    NotAMapping(String),
    #[error("device node {0} has no kind")]
    MissingKind(String),
}

/// One node of the device tree with its effective (inherited) options.
#[derive(Debug, Clone)]
pub struct DeviceNode {
    pub sys_id: String,
    pub kind: String,
    pub device_number: u32,
    pub options: Map<String, Json>,
    pub children: Vec<(String, DeviceNode)>,
}

impl DeviceNode {
    /// Build the root of a device tree from the adapter's `observatory`
    /// configuration block.
    pub fn observatory_root(config: &Json) -> Result<Self, DeviceConfigError> {
        Self::from_config("obs", "observatory", config, &Map::new())
    }

    fn from_config(
        sys_id: &str,
        kind_default: &str,
        config: &Json,
        inherited: &Map<String, Json>,
    ) -> Result<Self, DeviceConfigError> {
        let Some(map) = config.as_object() else {
            return Err(DeviceConfigError::NotAMapping(sys_id.to_owned()));
        };
        let kind = match map.get("kind").and_then(Json::as_str) {
            Some(kind) => kind.to_owned(),
            None if kind_default == "observatory" => kind_default.to_owned(),
            None => return Err(DeviceConfigError::MissingKind(sys_id.to_owned())),
        };
        let device_number = map
            .get("device_number")
            .and_then(Json::as_u64)
            .unwrap_or(0) as u32;

        // Options inherit downward; a child's own keys win.
        let mut options = inherited.clone();
        for (key, value) in map {
            if key != "components" && key != "kind" && key != "device_number" {
                options.insert(key.clone(), value.clone());
            }
        }

        let mut children = Vec::new();
        if let Some(component_map) = map.get("components").and_then(Json::as_object) {
            for (name, child_config) in component_map {
                let child_sys_id = format!("{sys_id}.{name}");
                let child = Self::from_config(&child_sys_id, "", child_config, &options)?;
                children.push((name.clone(), child));
            }
        }

        Ok(Self {
            sys_id: sys_id.to_owned(),
            kind,
            device_number,
            options,
            children,
        })
    }

    pub fn child(&self, name: &str) -> Option<&DeviceNode> {
        self.children
            .iter()
            .find(|(child_name, _)| child_name == name)
            .map(|(_, node)| node)
    }

    /// Resolve a device path below this node; `None` when any segment is
    /// unknown.
    pub fn descend(&self, path: &[String]) -> Option<&DeviceNode> {
        let mut node = self;
        for segment in path {
            node = node.child(segment)?;
        }
        Some(node)
    }

    pub fn base_url(&self) -> Option<&str> {
        self.options.get("address").and_then(Json::as_str)
    }

    pub fn protocol(&self) -> Option<&str> {
        self.options.get("protocol").and_then(Json::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Get,
    Put,
}

/// Fully resolved protocol call: method, url parts and encoded parameters.
#[derive(Debug)]
pub struct CallPlan {
    pub method: Direction,
    pub kind: String,
    pub attribute: String,
    pub params: Vec<(String, String)>,
    fix_result: Option<FixResult>,
}

impl CallPlan {
    pub fn finish(&self, raw: Json) -> Result<Json, TreeError> {
        match self.fix_result {
            Some(fix) => fix(raw),
            None => Ok(raw),
        }
    }
}

type FixParams = fn(&mut Map<String, Json>) -> Result<(), TreeError>;
type FixResult = fn(Json) -> Result<Json, TreeError>;
type BuildActionParams = fn(&Map<String, Json>) -> Result<Vec<(String, String)>, TreeError>;

/// A vendor-specific command: the attribute is replaced by a protocol
/// action/command call (always a PUT on the wire), optionally against a
/// different device kind.
struct Action {
    attribute: &'static str,
    kind_override: Option<&'static str>,
    params: &'static [(&'static str, &'static str)],
    build_params: Option<BuildActionParams>,
}

struct AttrRule {
    kind: &'static str,
    attribute: &'static str,
    direction: Direction,
    fix_params: Option<FixParams>,
    fix_result: Option<FixResult>,
    action: Option<Action>,
}

const fn with_params(
    kind: &'static str,
    attribute: &'static str,
    direction: Direction,
    fix_params: FixParams,
) -> AttrRule {
    AttrRule {
        kind,
        attribute,
        direction,
        fix_params: Some(fix_params),
        fix_result: None,
        action: None,
    }
}

const fn with_result(
    kind: &'static str,
    attribute: &'static str,
    direction: Direction,
    fix_result: FixResult,
) -> AttrRule {
    AttrRule {
        kind,
        attribute,
        direction,
        fix_params: None,
        fix_result: Some(fix_result),
        action: None,
    }
}

const fn action(
    kind: &'static str,
    attribute: &'static str,
    direction: Direction,
    target: &'static str,
    kind_override: Option<&'static str>,
    params: &'static [(&'static str, &'static str)],
) -> AttrRule {
    AttrRule {
        kind,
        attribute,
        direction,
        fix_params: None,
        fix_result: None,
        action: Some(Action {
            attribute: target,
            kind_override,
            params,
            build_params: None,
        }),
    }
}

const fn action_with_request_params(
    kind: &'static str,
    attribute: &'static str,
    direction: Direction,
    target: &'static str,
    params: &'static [(&'static str, &'static str)],
    build_params: BuildActionParams,
) -> AttrRule {
    AttrRule {
        kind,
        attribute,
        direction,
        fix_params: None,
        fix_result: None,
        action: Some(Action {
            attribute: target,
            kind_override: None,
            params,
            build_params: Some(build_params),
        }),
    }
}

static ATTR_RULES: &[AttrRule] = &[
    // Mount coordinate handling: right ascension travels as an hour angle on
    // the protocol side, degrees on ours.
    with_result(kinds::MOUNT, "rightascension", Direction::Get, result_hourangle_to_deg),
    with_result(kinds::MOUNT, "targetrightascension", Direction::Get, result_hourangle_to_deg),
    with_params(kinds::MOUNT, "targetrightascension", Direction::Put, params_target_rightascension),
    with_params(kinds::MOUNT, "targetdeclination", Direction::Put, params_target_declination),
    with_params(kinds::MOUNT, "utcdate", Direction::Put, params_utcdate),
    with_params(kinds::MOUNT, "destinationsideofpier", Direction::Get, params_equatorial),
    with_params(kinds::MOUNT, "slewtoaltaz", Direction::Put, params_horizontal),
    with_params(kinds::MOUNT, "slewtoaltazasync", Direction::Put, params_horizontal),
    with_params(kinds::MOUNT, "slewtocoordinates", Direction::Put, params_equatorial),
    with_params(kinds::MOUNT, "slewtocoordinatesasync", Direction::Put, params_equatorial),
    with_params(kinds::MOUNT, "synctoaltaz", Direction::Put, params_horizontal),
    with_params(kinds::MOUNT, "synctocoordinates", Direction::Put, params_equatorial),
    // Mount vendor commands.
    action(kinds::MOUNT, "reportmaxalt", Direction::Get, "action", None,
        &[("Action", "telescope:reportmaxalt"), ("Parameters", "")]),
    action(kinds::MOUNT, "motoron", Direction::Put, "action", None,
        &[("Action", "telescope:motoron"), ("Parameters", "")]),
    action(kinds::MOUNT, "motoroff", Direction::Put, "action", None,
        &[("Action", "telescope:motoroff"), ("Parameters", "")]),
    // The flat lamp is wired through the fan controller.
    action(kinds::MOUNT, "domeflatlampon", Direction::Put, "action", None,
        &[("Action", "telescope:startfans"), ("Parameters", "5")]),
    action(kinds::MOUNT, "domeflatlampoff", Direction::Put, "action", None,
        &[("Action", "telescope:stopfans"), ("Parameters", "")]),
    action(kinds::MOUNT, "motorstatus", Direction::Get, "commandstring", None,
        &[("Command", "MotStat"), ("Raw", "True")]),
    action(kinds::MOUNT, "errorstring", Direction::Get, "action", None,
        &[("Action", "telescope:errorstring"), ("Parameters", "")]),
    // Dome fans.
    action(kinds::DOME, "domefansrunning", Direction::Get, "commandbool", None,
        &[("Command", "DomeFansRunning"), ("Raw", "False")]),
    action(kinds::DOME, "domefansturnon", Direction::Put, "commandblind", None,
        &[("Command", "DomeFansTurnOn"), ("Raw", "False")]),
    action(kinds::DOME, "domefansturnoff", Direction::Put, "commandblind", None,
        &[("Command", "DomeFansTurnOff"), ("Raw", "False")]),
    // Focuser fans.
    action(kinds::FOCUSER, "fansturnon", Direction::Put, "action", None,
        &[("Action", "fansturnon"), ("Parameters", "")]),
    action(kinds::FOCUSER, "fansturnoff", Direction::Put, "action", None,
        &[("Action", "fansturnoff"), ("Parameters", "")]),
    action(kinds::FOCUSER, "fansstatus", Direction::Get, "action", None,
        &[("Action", "fansstatus"), ("Parameters", "")]),
    // Mirror cover is driven through the mount controller.
    action(kinds::COVERCALIBRATOR_OCA, "opencover", Direction::Put, "action", Some(kinds::MOUNT),
        &[("Action", "telescope:opencover"), ("Parameters", "")]),
    action(kinds::COVERCALIBRATOR_OCA, "closecover", Direction::Put, "action", Some(kinds::MOUNT),
        &[("Action", "telescope:closecover"), ("Parameters", "")]),
    // Nasmyth port selector takes a numeric position from the request.
    action_with_request_params(kinds::TERTIARY_OCA, "selectnasmythport", Direction::Put,
        "action", &[("Action", "selectnasmythport")], params_select_nasmyth_port),
];

/// Resolve one attribute call against the dispatch table. Attributes without
/// an entry are direct protocol calls with stringified request parameters.
pub fn plan_call(
    node: &DeviceNode,
    attribute: &str,
    direction: Direction,
    request_data: &std::collections::HashMap<String, Json>,
) -> Result<CallPlan, TreeError> {
    let rule = ATTR_RULES.iter().find(|rule| {
        rule.kind == node.kind && rule.attribute == attribute && rule.direction == direction
    });

    let mut params: Map<String, Json> = request_data
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(fix) = rule.and_then(|r| r.fix_params) {
        fix(&mut params)?;
    }

    match rule.and_then(|r| r.action.as_ref()) {
        Some(action) => {
            let mut encoded: Vec<(String, String)> = action
                .params
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect();
            if let Some(build) = action.build_params {
                encoded.extend(build(&params)?);
            }
            Ok(CallPlan {
                // Vendor commands are always protocol PUTs.
                method: Direction::Put,
                kind: action
                    .kind_override
                    .unwrap_or(node.kind.as_str())
                    .to_owned(),
                attribute: action.attribute.to_owned(),
                params: encoded,
                fix_result: rule.and_then(|r| r.fix_result),
            })
        }
        None => Ok(CallPlan {
            method: direction,
            kind: node.kind.clone(),
            attribute: attribute.to_owned(),
            params: encode_params(&params)?,
            fix_result: rule.and_then(|r| r.fix_result),
        }),
    }
}

fn encode_params(params: &Map<String, Json>) -> Result<Vec<(String, String)>, TreeError> {
    let mut encoded = Vec::with_capacity(params.len());
    for (key, value) in params {
        let text = match value {
            Json::String(s) => s.clone(),
            Json::Number(n) => n.to_string(),
            Json::Bool(b) => b.to_string(),
            Json::Null => continue,
            Json::Array(_) | Json::Object(_) => {
                return Err(TreeError::address_msg(
                    1003,
                    format!("parameter {key} has an unsupported shape"),
                ));
            }
        };
        encoded.push((key.clone(), text));
    }
    Ok(encoded)
}

fn result_hourangle_to_deg(raw: Json) -> Result<Json, TreeError> {
    let hours = raw
        .as_f64()
        .ok_or_else(|| TreeError::address_msg(1003, "device returned a non-numeric hour angle"))?;
    Ok(Json::from(coords::hourangle_to_deg(hours)))
}

fn take_param<'a>(params: &'a Map<String, Json>, key: &str) -> Result<&'a Json, TreeError> {
    params
        .get(key)
        .ok_or_else(|| TreeError::address_msg(1003, format!("missing parameter {key}")))
}

/// Degrees out of a coordinate parameter: numbers pass through, strings are
/// sexagesimal in the given unit.
fn coordinate_deg(value: &Json, hourangle_string: bool) -> Result<f64, TreeError> {
    match value {
        Json::Number(n) => n
            .as_f64()
            .ok_or_else(|| TreeError::address(1003)),
        Json::String(s) => {
            let parsed = if hourangle_string {
                coords::hourangle_string_to_deg(s)
            } else {
                coords::angle_string_to_deg(s)
            };
            parsed.map_err(|error| TreeError::address_msg(1003, error.to_string()))
        }
        _ => Err(TreeError::address(1003)),
    }
}

fn params_target_rightascension(params: &mut Map<String, Json>) -> Result<(), TreeError> {
    let deg = coordinate_deg(take_param(params, "TargetRightAscension")?, true)?;
    params.insert(
        "TargetRightAscension".to_owned(),
        Json::from(coords::deg_to_hourangle(deg)),
    );
    Ok(())
}

fn params_target_declination(params: &mut Map<String, Json>) -> Result<(), TreeError> {
    let deg = coordinate_deg(take_param(params, "TargetDeclination")?, false)?;
    params.insert("TargetDeclination".to_owned(), Json::from(deg));
    Ok(())
}

fn params_equatorial(params: &mut Map<String, Json>) -> Result<(), TreeError> {
    let ra_deg = coordinate_deg(take_param(params, "RightAscension")?, true)?;
    let dec_deg = coordinate_deg(take_param(params, "Declination")?, false)?;
    params.insert(
        "RightAscension".to_owned(),
        Json::from(coords::deg_to_hourangle(ra_deg)),
    );
    params.insert("Declination".to_owned(), Json::from(dec_deg));
    Ok(())
}

fn params_horizontal(params: &mut Map<String, Json>) -> Result<(), TreeError> {
    let az = coordinate_deg(take_param(params, "Azimuth")?, false)?;
    let alt = coordinate_deg(take_param(params, "Altitude")?, false)?;
    params.insert("Azimuth".to_owned(), Json::from(az));
    params.insert("Altitude".to_owned(), Json::from(alt));
    Ok(())
}

fn params_utcdate(params: &mut Map<String, Json>) -> Result<(), TreeError> {
    match take_param(params, "UTCDate")? {
        Json::String(_) => Ok(()),
        _ => Err(TreeError::address_msg(1003, "UTCDate must be an ISO string")),
    }
}

fn params_select_nasmyth_port(params: &Map<String, Json>) -> Result<Vec<(String, String)>, TreeError> {
    let parameters = match params.get("Position") {
        Some(Json::Number(n)) if n.is_i64() || n.is_u64() => n.to_string(),
        Some(Json::Null) | None => String::new(),
        Some(_) => {
            warn!("ignoring non-integer nasmyth port position");
            String::new()
        }
    };
    Ok(vec![("Parameters".to_owned(), parameters)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn observatory() -> DeviceNode {
        let config = json!({
            "address": "http://localhost:11111/api/v1",
            "protocol": "alpaca",
            "components": {
                "telescope": {"kind": "telescope", "device_number": 0},
                "dome": {"kind": "dome", "device_number": 0},
                "derotator": {
                    "kind": "rotator",
                    "device_number": 2,
                    "address": "http://other:11111/api/v1"
                },
                "tertiary": {"kind": "tertiaryOCA"}
            }
        });
        DeviceNode::observatory_root(&config).unwrap()
    }

    #[test]
    fn options_inherit_down_and_children_override() {
        let root = observatory();
        let telescope = root.child("telescope").unwrap();
        assert_eq!(telescope.base_url(), Some("http://localhost:11111/api/v1"));
        assert_eq!(telescope.protocol(), Some("alpaca"));
        let derotator = root.child("derotator").unwrap();
        assert_eq!(derotator.base_url(), Some("http://other:11111/api/v1"));
        assert_eq!(derotator.device_number, 2);
    }

    #[test]
    fn nodes_without_kind_are_rejected() {
        let config = json!({"components": {"dome": {"device_number": 1}}});
        assert!(matches!(
            DeviceNode::observatory_root(&config),
            Err(DeviceConfigError::MissingKind(_))
        ));
    }

    #[test]
    fn unlisted_attributes_pass_straight_through() {
        let root = observatory();
        let dome = root.child("dome").unwrap();
        let data = HashMap::from([("Azimuth".to_owned(), json!(120.5))]);
        let plan = plan_call(dome, "slewtoazimuth", Direction::Put, &data).unwrap();
        assert_eq!(plan.method, Direction::Put);
        assert_eq!(plan.kind, "dome");
        assert_eq!(plan.attribute, "slewtoazimuth");
        assert!(plan
            .params
            .contains(&("Azimuth".to_owned(), "120.5".to_owned())));
    }

    #[test]
    fn right_ascension_reads_convert_hour_angles() {
        let root = observatory();
        let telescope = root.child("telescope").unwrap();
        let plan = plan_call(telescope, "rightascension", Direction::Get, &HashMap::new()).unwrap();
        assert_eq!(plan.finish(json!(12.5)).unwrap(), json!(187.5));
        assert!(plan.finish(json!("noon")).is_err());
    }

    #[test]
    fn slew_parameters_accept_sexagesimal_strings() {
        let root = observatory();
        let telescope = root.child("telescope").unwrap();
        let data = HashMap::from([
            ("RightAscension".to_owned(), json!("12:30:00")),
            ("Declination".to_owned(), json!("-45:00:00")),
        ]);
        let plan = plan_call(telescope, "slewtocoordinates", Direction::Put, &data).unwrap();
        let params: HashMap<_, _> = plan.params.iter().cloned().collect();
        // 12h30m as an hour angle again after the degree round trip.
        assert_eq!(params["RightAscension"], "12.5");
        assert_eq!(params["Declination"], "-45.0");
    }

    #[test]
    fn missing_coordinate_parameters_are_1003() {
        let root = observatory();
        let telescope = root.child("telescope").unwrap();
        let error =
            plan_call(telescope, "slewtocoordinates", Direction::Put, &HashMap::new()).unwrap_err();
        assert_eq!(error.code(), 1003);
    }

    #[test]
    fn vendor_actions_rewrite_the_call() {
        let root = observatory();
        let dome = root.child("dome").unwrap();
        let plan = plan_call(dome, "domefansturnon", Direction::Put, &HashMap::new()).unwrap();
        assert_eq!(plan.method, Direction::Put);
        assert_eq!(plan.attribute, "commandblind");
        assert!(plan
            .params
            .contains(&("Command".to_owned(), "DomeFansTurnOn".to_owned())));

        // A "read" wired to a command still goes out as a protocol PUT.
        let plan = plan_call(dome, "domefansrunning", Direction::Get, &HashMap::new()).unwrap();
        assert_eq!(plan.method, Direction::Put);
        assert_eq!(plan.attribute, "commandbool");
    }

    #[test]
    fn nasmyth_port_selection_builds_its_parameters() {
        let root = observatory();
        let tertiary = root.child("tertiary").unwrap();
        let data = HashMap::from([("Position".to_owned(), json!(2))]);
        let plan = plan_call(tertiary, "selectnasmythport", Direction::Put, &data).unwrap();
        let params: HashMap<_, _> = plan.params.iter().cloned().collect();
        assert_eq!(params["Action"], "selectnasmythport");
        assert_eq!(params["Parameters"], "2");
    }

    #[test]
    fn cover_commands_target_the_mount_controller() {
        let config = json!({
            "address": "http://localhost:11111/api/v1",
            "components": {"cover": {"kind": "covercalibratorOCA", "device_number": 0}}
        });
        let root = DeviceNode::observatory_root(&config).unwrap();
        let cover = root.child("cover").unwrap();
        let plan = plan_call(cover, "opencover", Direction::Put, &HashMap::new()).unwrap();
        assert_eq!(plan.kind, "telescope");
        assert!(plan
            .params
            .contains(&("Action".to_owned(), "telescope:opencover".to_owned())));
    }
}
