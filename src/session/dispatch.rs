//! Turns inbound requests into capability calls and response frames.

use std::collections::HashSet;

use crate::capability::{
    Action, ActionHandler, CapabilityRegistry, DeviceDescriptor, DeviceInfo, MAX_ENTRIES,
};
use crate::codec::constants::{attr, error_code, method};
use crate::codec::{arguments, Attribute, Message, MessageFactory};
use crate::error::{LyncnatError, Result};

use super::device::DeviceContext;
use super::feature::FeatureSlot;

/// A device's state together with its capability table and installed
/// features.
pub(crate) struct Dispatcher<D> {
    device: D,
    registry: CapabilityRegistry<D>,
    features: Vec<Box<dyn FeatureSlot>>,
    factory: MessageFactory,
}

impl<D> Dispatcher<D> {
    pub(crate) fn new(device: D, registry: CapabilityRegistry<D>, factory: MessageFactory) -> Self {
        Self {
            device,
            registry,
            features: Vec::new(),
            factory,
        }
    }

    /// Add a feature whose capability names clash with nothing installed so
    /// far.
    pub(crate) fn install(&mut self, feature: Box<dyn FeatureSlot>) -> Result<()> {
        let current = self.descriptor();
        let mut added = DeviceDescriptor {
            action_list: Vec::new(),
            state_variable_list: Vec::new(),
            event_list: Vec::new(),
            info: DeviceInfo::default(),
        };
        feature.extend_descriptor(&mut added);

        let clash = |kind: &str, taken: HashSet<&str>, new: Vec<&str>| -> Result<()> {
            match new.into_iter().find(|name| taken.contains(*name)) {
                Some(name) => Err(LyncnatError::Registry(format!(
                    "feature '{}' declares {} '{}', which already exists",
                    feature.name(),
                    kind,
                    name
                ))),
                None => Ok(()),
            }
        };
        clash(
            "action",
            current.action_list.iter().map(|a| a.name.as_str()).collect(),
            added.action_list.iter().map(|a| a.name.as_str()).collect(),
        )?;
        clash(
            "event",
            current.event_list.iter().map(|e| e.name.as_str()).collect(),
            added.event_list.iter().map(|e| e.name.as_str()).collect(),
        )?;
        clash(
            "status component",
            current.state_variable_list.iter().map(|s| s.name.as_str()).collect(),
            added.state_variable_list.iter().map(|s| s.name.as_str()).collect(),
        )?;

        let status = current.state_variable_list.len() + added.state_variable_list.len();
        if status > MAX_ENTRIES {
            return Err(LyncnatError::Registry(format!(
                "feature '{}' brings the device to {} status components, limit is {}",
                feature.name(),
                status,
                MAX_ENTRIES
            )));
        }

        tracing::debug!("Feature '{}' installed", feature.name());
        self.features.push(feature);
        Ok(())
    }

    pub(crate) fn feature_count(&self) -> usize {
        self.features.len()
    }

    /// Run every feature's setup, in install order.
    pub(crate) fn setup_features(&mut self) -> Result<()> {
        for feature in &mut self.features {
            feature.setup().map_err(|e| {
                LyncnatError::Session(format!("feature '{}' setup failed: {:#}", feature.name(), e))
            })?;
        }
        Ok(())
    }

    /// One main loop iteration for every feature.
    pub(crate) fn tick_features(&mut self, ctx: &DeviceContext) {
        for feature in &mut self.features {
            feature.iteration(ctx);
        }
    }

    /// Descriptor of the device and every installed feature.
    pub(crate) fn descriptor(&self) -> DeviceDescriptor {
        let mut descriptor = self.registry.descriptor();
        for feature in &self.features {
            feature.extend_descriptor(&mut descriptor);
        }
        descriptor
    }

    pub(crate) fn descriptor_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.descriptor())?)
    }

    /// Device-level names of every event that may be sent.
    pub(crate) fn event_names(&self) -> HashSet<String> {
        self.descriptor()
            .event_list
            .into_iter()
            .map(|e| e.name)
            .collect()
    }

    pub(crate) fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub(crate) fn into_device(self) -> D {
        self.device
    }

    /// Handle one inbound message.
    ///
    /// Returns the response frame to send, or `None` when the message needs
    /// no answer. Errors mean the message was dropped without a response.
    pub(crate) fn dispatch(&mut self, message: &Message) -> Result<Option<Vec<u8>>> {
        if message.class.is_response() {
            return Ok(None);
        }
        match message.method {
            method::ACTION => self.perform_action(message).map(Some),
            method::STATUS_REQUEST => self.answer_status(message).map(Some),
            other => {
                tracing::trace!("Ignoring {} ({:#05x})", method::name(other), other);
                Ok(None)
            }
        }
    }

    fn perform_action(&mut self, message: &Message) -> Result<Vec<u8>> {
        let name = message.attribute_str(attr::NAME).ok_or_else(|| {
            LyncnatError::InvalidMessage("action request without NAME".to_string())
        })?;
        match self.registry.action_mut(name) {
            Some(action) => invoke(&mut self.device, action, message)?,
            None => self
                .features
                .iter_mut()
                .find_map(|feature| feature.perform(name, message))
                .ok_or_else(|| LyncnatError::UnknownCapability(format!("action '{}'", name)))??,
        }

        tracing::debug!("Action '{}' performed", name);
        self.factory
            .success_response(message, Vec::new(), Some(self.factory.username()))
    }

    fn answer_status(&self, message: &Message) -> Result<Vec<u8>> {
        let mut defs = self.registry.status_defs();
        for feature in &self.features {
            defs.extend(feature.status_defs());
        }
        let snapshot = self.registry.snapshot(&self.device).and_then(|mut values| {
            for feature in &self.features {
                values.extend(feature.snapshot()?);
            }
            Ok(values)
        });

        match snapshot {
            Ok(values) => {
                let payload = arguments::encode(&defs, &values)?;
                self.factory.success_response(
                    message,
                    vec![Attribute::new(attr::ARGUMENTS, payload)],
                    Some(self.factory.username()),
                )
            }
            Err(failure) => {
                let reason = format!("Value for {} could not be retrieved", failure.name);
                tracing::error!("{}: {:#}", reason, failure.source);
                self.factory
                    .error_response(message, error_code::NOT_AVAILABLE, &reason)
            }
        }
    }
}

/// Decode the request's input for `action` and call its handler on `target`.
pub(crate) fn invoke<T>(target: &mut T, action: &mut Action<T>, message: &Message) -> Result<()> {
    let Action {
        name,
        arguments: defs,
        handler,
        ..
    } = action;

    let outcome = match handler {
        ActionHandler::Payload(handler) => {
            let payload = message.attribute(attr::PAYLOAD).ok_or_else(|| {
                LyncnatError::InvalidMessage(format!("action '{}' needs a PAYLOAD", name))
            })?;
            handler(target, payload)
        }
        ActionHandler::Arguments(handler) => {
            let values = match message.attribute(attr::ARGUMENTS) {
                Some(raw) => arguments::decode_ordered(raw, defs)?,
                None if defs.is_empty() => Vec::new(),
                None => {
                    return Err(LyncnatError::InvalidMessage(format!(
                        "action '{}' needs ARGUMENTS",
                        name
                    )))
                }
            };
            handler(target, &values)
        }
    };
    outcome.map_err(|source| LyncnatError::ActionFailed {
        action: name.clone(),
        source,
    })
}
