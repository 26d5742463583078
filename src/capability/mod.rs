//! Capability registry: actions, events and status components.
//!
//! A device declares what it can do up front through
//! [`CapabilityRegistry::builder`]. The registry is a function table keyed by
//! name. Dispatch looks actions up here, status requests read every status
//! accessor in registration order, and outgoing events are checked against
//! the declared event names.
//!
//! # Example
//!
//! ```rust,ignore
//! use lyncnat::capability::CapabilityRegistry;
//! use lyncnat::codec::{ArgumentDef, ArgumentType, ArgumentValue};
//!
//! let registry = CapabilityRegistry::<Oven>::builder()
//!     .action(
//!         "bake",
//!         "bake food",
//!         vec![
//!             ArgumentDef::new("temperature", ArgumentType::Integer),
//!             ArgumentDef::new("time", ArgumentType::Integer),
//!         ],
//!         |oven, args| oven.bake(args),
//!     )
//!     .event("finished")
//!     .status("temperature", ArgumentType::Integer, |oven| {
//!         Ok(ArgumentValue::Integer(oven.temperature))
//!     })
//!     .build()?;
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::codec::{ArgumentDef, ArgumentType, ArgumentValue};
use crate::error::{LyncnatError, Result};

/// Most status components (and arguments per action) a device may declare
pub const MAX_ENTRIES: usize = 8;

/// Device type reported when none is configured
pub const DEFAULT_DEVICE_TYPE: &str = "lyncnat-rust";

/// Handler for an action with typed arguments, called with values in
/// definition order.
pub type ArgumentHandler<D> =
    Box<dyn FnMut(&mut D, &[ArgumentValue]) -> anyhow::Result<()> + Send>;

/// Handler for an action that takes the raw PAYLOAD attribute.
pub type PayloadHandler<D> = Box<dyn FnMut(&mut D, &[u8]) -> anyhow::Result<()> + Send>;

/// Reads one status component.
pub type StatusAccessor<D> = Box<dyn Fn(&D) -> anyhow::Result<ArgumentValue> + Send>;

/// How an action receives its input.
pub enum ActionHandler<D> {
    Arguments(ArgumentHandler<D>),
    Payload(PayloadHandler<D>),
}

/// A registered action
pub struct Action<D> {
    pub name: String,
    pub description: String,
    pub arguments: Vec<ArgumentDef>,
    pub handler: ActionHandler<D>,
}

impl<D> Action<D> {
    /// True when the action takes the raw PAYLOAD instead of ARGUMENTS.
    pub fn payload_needed(&self) -> bool {
        matches!(self.handler, ActionHandler::Payload(_))
    }
}

impl<D> std::fmt::Debug for Action<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .field("payload_needed", &self.payload_needed())
            .finish_non_exhaustive()
    }
}

/// A declared event and the components of its payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub components: Vec<ArgumentDef>,
}

/// A status component and its accessor
pub struct StatusComponent<D> {
    pub name: String,
    pub kind: ArgumentType,
    accessor: StatusAccessor<D>,
}

impl<D> StatusComponent<D> {
    pub fn def(&self) -> ArgumentDef {
        ArgumentDef::new(self.name.clone(), self.kind)
    }

    /// Read the value; a value of the wrong type counts as a failure.
    pub fn read(&self, device: &D) -> anyhow::Result<ArgumentValue> {
        let value = (self.accessor)(device)?;
        if value.kind() != self.kind {
            anyhow::bail!(
                "status '{}' is declared {} but read as {}",
                self.name,
                self.kind,
                value.kind()
            );
        }
        Ok(value)
    }
}

/// Static device information sent with the descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub model_name: String,
    pub manufacturer: String,
    pub device_type: String,
    pub serial_number: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            model_name: String::new(),
            manufacturer: String::new(),
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            serial_number: String::new(),
        }
    }
}

/// Action as it appears in the descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub name: String,
    pub description: String,
    pub inputs: Vec<ArgumentDef>,
}

/// JSON capability descriptor uploaded to the account service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub action_list: Vec<ActionDescriptor>,
    pub state_variable_list: Vec<ArgumentDef>,
    pub event_list: Vec<Event>,
    #[serde(flatten)]
    pub info: DeviceInfo,
}

/// Status read failure
#[derive(Debug)]
pub struct StatusFailure {
    /// Component that could not be read
    pub name: String,
    pub source: anyhow::Error,
}

/// Name-keyed table of a device's capabilities
pub struct CapabilityRegistry<D> {
    actions: Vec<Action<D>>,
    action_index: HashMap<String, usize>,
    events: Vec<Event>,
    status: Vec<StatusComponent<D>>,
    info: DeviceInfo,
}

impl<D> std::fmt::Debug for CapabilityRegistry<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("actions", &self.actions)
            .field("events", &self.events)
            .field(
                "status",
                &self.status.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .field("info", &self.info)
            .finish()
    }
}

impl<D> CapabilityRegistry<D> {
    pub fn builder() -> CapabilityRegistryBuilder<D> {
        CapabilityRegistryBuilder::new()
    }

    pub fn action(&self, name: &str) -> Option<&Action<D>> {
        self.action_index.get(name).and_then(|&i| self.actions.get(i))
    }

    pub fn action_mut(&mut self, name: &str) -> Option<&mut Action<D>> {
        let i = *self.action_index.get(name)?;
        self.actions.get_mut(i)
    }

    pub fn actions(&self) -> &[Action<D>] {
        &self.actions
    }

    pub fn event(&self, name: &str) -> Option<&Event> {
        self.events.iter().find(|e| e.name == name)
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.event(name).is_some()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn status_components(&self) -> &[StatusComponent<D>] {
        &self.status
    }

    /// Status components as argument definitions, registration order.
    pub fn status_defs(&self) -> Vec<ArgumentDef> {
        self.status.iter().map(StatusComponent::def).collect()
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Read every status component, stopping at the first failure.
    pub fn snapshot(
        &self,
        device: &D,
    ) -> std::result::Result<HashMap<String, ArgumentValue>, StatusFailure> {
        self.status
            .iter()
            .map(|component| {
                component
                    .read(device)
                    .map(|value| (component.name.clone(), value))
                    .map_err(|source| StatusFailure {
                        name: component.name.clone(),
                        source,
                    })
            })
            .collect()
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            action_list: self
                .actions
                .iter()
                .map(|a| ActionDescriptor {
                    name: a.name.clone(),
                    description: a.description.clone(),
                    inputs: a.arguments.clone(),
                })
                .collect(),
            state_variable_list: self.status_defs(),
            event_list: self.events.clone(),
            info: self.info.clone(),
        }
    }

    pub fn descriptor_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.descriptor())?)
    }
}

/// Names may contain only ASCII letters, digits and underscores.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Collects declarations and validates them in [`build`](Self::build).
pub struct CapabilityRegistryBuilder<D> {
    actions: Vec<Action<D>>,
    events: Vec<Event>,
    status: Vec<StatusComponent<D>>,
    info: DeviceInfo,
}

impl<D> CapabilityRegistryBuilder<D> {
    fn new() -> Self {
        Self {
            actions: Vec::new(),
            events: Vec::new(),
            status: Vec::new(),
            info: DeviceInfo::default(),
        }
    }

    /// Action with typed arguments.
    pub fn action<F>(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        arguments: Vec<ArgumentDef>,
        handler: F,
    ) -> Self
    where
        F: FnMut(&mut D, &[ArgumentValue]) -> anyhow::Result<()> + Send + 'static,
    {
        self.actions.push(Action {
            name: name.into(),
            description: description.into(),
            arguments,
            handler: ActionHandler::Arguments(Box::new(handler)),
        });
        self
    }

    /// Action that receives the raw PAYLOAD attribute.
    pub fn payload_action<F>(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: FnMut(&mut D, &[u8]) -> anyhow::Result<()> + Send + 'static,
    {
        self.actions.push(Action {
            name: name.into(),
            description: description.into(),
            arguments: Vec::new(),
            handler: ActionHandler::Payload(Box::new(handler)),
        });
        self
    }

    pub fn event(self, name: impl Into<String>) -> Self {
        self.event_with_components(name, Vec::new())
    }

    /// Event whose payload carries the given components.
    pub fn event_with_components(
        mut self,
        name: impl Into<String>,
        components: Vec<ArgumentDef>,
    ) -> Self {
        self.events.push(Event {
            name: name.into(),
            components,
        });
        self
    }

    pub fn status<F>(mut self, name: impl Into<String>, kind: ArgumentType, accessor: F) -> Self
    where
        F: Fn(&D) -> anyhow::Result<ArgumentValue> + Send + 'static,
    {
        self.status.push(StatusComponent {
            name: name.into(),
            kind,
            accessor: Box::new(accessor),
        });
        self
    }

    pub fn info(mut self, info: DeviceInfo) -> Self {
        self.info = info;
        self
    }

    /// Validate names and limits, then freeze the table.
    pub fn build(self) -> Result<CapabilityRegistry<D>> {
        let mut action_index = HashMap::with_capacity(self.actions.len());
        for (i, action) in self.actions.iter().enumerate() {
            check_name("action", &action.name)?;
            if action_index.insert(action.name.clone(), i).is_some() {
                return Err(LyncnatError::Registry(format!(
                    "duplicate action '{}'",
                    action.name
                )));
            }
            if action.arguments.len() > MAX_ENTRIES {
                return Err(LyncnatError::Registry(format!(
                    "action '{}' declares {} arguments, limit is {}",
                    action.name,
                    action.arguments.len(),
                    MAX_ENTRIES
                )));
            }
            check_unique_args(&action.name, &action.arguments)?;
        }

        let mut seen = HashSet::new();
        for event in &self.events {
            check_name("event", &event.name)?;
            if !seen.insert(event.name.as_str()) {
                return Err(LyncnatError::Registry(format!(
                    "duplicate event '{}'",
                    event.name
                )));
            }
            check_unique_args(&event.name, &event.components)?;
        }

        if self.status.len() > MAX_ENTRIES {
            return Err(LyncnatError::Registry(format!(
                "{} status components declared, limit is {}",
                self.status.len(),
                MAX_ENTRIES
            )));
        }
        let mut seen = HashSet::new();
        for component in &self.status {
            check_name("status component", &component.name)?;
            if !seen.insert(component.name.as_str()) {
                return Err(LyncnatError::Registry(format!(
                    "duplicate status component '{}'",
                    component.name
                )));
            }
        }

        tracing::debug!(
            actions = self.actions.len(),
            events = self.events.len(),
            status = self.status.len(),
            "Capability registry built"
        );

        Ok(CapabilityRegistry {
            actions: self.actions,
            action_index,
            events: self.events,
            status: self.status,
            info: self.info,
        })
    }
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(LyncnatError::Registry(format!(
            "'{}' is not a valid {} name, use only letters, digits and underscores",
            name, kind
        )))
    }
}

fn check_unique_args(owner: &str, args: &[ArgumentDef]) -> Result<()> {
    let mut seen = HashSet::new();
    for arg in args {
        if arg.name.is_empty() || arg.name.len() > usize::from(u8::MAX) {
            return Err(LyncnatError::Registry(format!(
                "argument name '{}' of '{}' must be 1 to 255 bytes",
                arg.name, owner
            )));
        }
        if !seen.insert(arg.name.as_str()) {
            return Err(LyncnatError::Registry(format!(
                "duplicate argument '{}' in '{}'",
                arg.name, owner
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Lamp {
        on: bool,
        brightness: i32,
        last_payload: Vec<u8>,
    }

    fn registry() -> CapabilityRegistry<Lamp> {
        CapabilityRegistry::builder()
            .action(
                "set",
                "switch and dim",
                vec![
                    ArgumentDef::new("on", ArgumentType::Boolean),
                    ArgumentDef::new("brightness", ArgumentType::Integer),
                ],
                |lamp: &mut Lamp, args| {
                    lamp.on = args[0].as_bool().unwrap_or(false);
                    lamp.brightness = args[1].as_i32().unwrap_or(0);
                    Ok(())
                },
            )
            .payload_action("raw", "store payload", |lamp: &mut Lamp, payload| {
                lamp.last_payload = payload.to_vec();
                Ok(())
            })
            .event("burnt_out")
            .status("on", ArgumentType::Boolean, |lamp: &Lamp| Ok(lamp.on.into()))
            .status("brightness", ArgumentType::Integer, |lamp: &Lamp| {
                Ok(lamp.brightness.into())
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_lookup_and_invoke() {
        let mut registry = registry();
        let mut lamp = Lamp::default();

        let action = registry.action_mut("set").unwrap();
        assert!(!action.payload_needed());
        match &mut action.handler {
            ActionHandler::Arguments(h) => {
                h(&mut lamp, &[true.into(), 80.into()]).unwrap();
            }
            ActionHandler::Payload(_) => panic!("expected argument handler"),
        }
        assert!(lamp.on);
        assert_eq!(lamp.brightness, 80);

        assert!(registry.action("raw").unwrap().payload_needed());
        assert!(registry.action("missing").is_none());
        assert!(registry.has_event("burnt_out"));
        assert!(!registry.has_event("exploded"));
    }

    #[test]
    fn test_snapshot_in_registration_order() {
        let registry = registry();
        let lamp = Lamp {
            on: true,
            brightness: 42,
            ..Default::default()
        };
        let snapshot = registry.snapshot(&lamp).unwrap();
        assert_eq!(snapshot["on"], ArgumentValue::Boolean(true));
        assert_eq!(snapshot["brightness"], ArgumentValue::Integer(42));
        let names: Vec<_> = registry.status_defs().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["on", "brightness"]);
    }

    #[test]
    fn test_snapshot_reports_failing_component() {
        let registry = CapabilityRegistry::<Lamp>::builder()
            .status("ok", ArgumentType::Integer, |_| Ok(1.into()))
            .status("broken", ArgumentType::Integer, |_| anyhow::bail!("sensor offline"))
            .build()
            .unwrap();
        let failure = registry.snapshot(&Lamp::default()).unwrap_err();
        assert_eq!(failure.name, "broken");
    }

    #[test]
    fn test_snapshot_type_mismatch_is_failure() {
        let registry = CapabilityRegistry::<Lamp>::builder()
            .status("level", ArgumentType::Integer, |_| Ok("high".into()))
            .build()
            .unwrap();
        assert_eq!(registry.snapshot(&Lamp::default()).unwrap_err().name, "level");
    }

    #[test]
    fn test_invalid_and_duplicate_names_rejected() {
        let bad = CapabilityRegistry::<Lamp>::builder()
            .event("has space")
            .build();
        assert!(matches!(bad, Err(LyncnatError::Registry(_))));

        let dup = CapabilityRegistry::<Lamp>::builder()
            .payload_action("a", "", |_, _| Ok(()))
            .payload_action("a", "", |_, _| Ok(()))
            .build();
        assert!(dup.is_err());

        assert!(is_valid_name("temp_1"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("tëmp"));
    }

    #[test]
    fn test_status_limit() {
        let mut builder = CapabilityRegistry::<Lamp>::builder();
        for i in 0..=MAX_ENTRIES {
            builder = builder.status(format!("s{i}"), ArgumentType::Integer, |_| Ok(0.into()));
        }
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_descriptor_json_shape() {
        let json = registry().descriptor_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["actionList"][0]["name"], "set");
        assert_eq!(value["actionList"][0]["inputs"][1]["type"], "integer");
        assert_eq!(value["stateVariableList"][0]["type"], "boolean");
        assert_eq!(value["eventList"][0]["name"], "burnt_out");
        assert_eq!(value["deviceType"], DEFAULT_DEVICE_TYPE);
        assert_eq!(value["modelName"], "");
    }
}
