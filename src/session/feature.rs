//! Features: self-contained parts a device is composed of.
//!
//! A feature owns its state and declares its own capabilities. Once installed
//! on a [`SessionManager`](super::SessionManager) its actions, events and
//! status components appear in the device descriptor next to the device's
//! own, actions addressed to it are routed to its handlers, and it gets its
//! own setup and periodic callbacks.
//!
//! Event names can be aliased on install, so two copies of the same feature
//! can live on one device under different event names.

use std::collections::{HashMap, HashSet};

use crate::capability::{
    CapabilityRegistry, CapabilityRegistryBuilder, DeviceDescriptor, StatusFailure,
};
use crate::codec::{ArgumentDef, ArgumentValue, Message};
use crate::error::{LyncnatError, Result};

use super::device::DeviceContext;
use super::dispatch::invoke;

/// A part of a device with its own state and capabilities.
pub trait Feature: Send + Sized + 'static {
    fn name(&self) -> &str;

    /// Capabilities this feature adds to the device. Handlers receive the
    /// feature itself.
    fn capabilities(&self) -> CapabilityRegistryBuilder<Self> {
        CapabilityRegistry::builder()
    }

    /// Runs once during start, after the device's own setup.
    fn setup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Periodic callback, every [`tick_every`](Self::tick_every) main loop
    /// iterations.
    fn tick(&mut self, _ctx: &FeatureContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Main loop iterations per tick. Zero is treated as one.
    fn tick_every(&self) -> u32 {
        1
    }
}

/// What a feature's tick may send. Event names are the feature's own and are
/// translated through its aliases.
#[derive(Debug)]
pub struct FeatureContext<'a> {
    device: &'a DeviceContext,
    events: &'a HashSet<String>,
    aliases: &'a HashMap<String, String>,
}

impl FeatureContext<'_> {
    pub fn device(&self) -> &DeviceContext {
        self.device
    }

    /// Send one of the feature's declared events under its device-level name.
    pub fn send_event(&self, name: &str, payload: Option<&[u8]>) -> Result<()> {
        if !self.events.contains(name) {
            return Err(LyncnatError::UnknownCapability(format!("event '{}'", name)));
        }
        self.device.send_event(exposed(self.aliases, name), payload)
    }

    pub fn send_log(&self, level: u8, message: &str) -> Result<()> {
        self.device.send_log(level, message)
    }
}

fn exposed<'a>(aliases: &'a HashMap<String, String>, name: &'a str) -> &'a str {
    aliases.get(name).map(String::as_str).unwrap_or(name)
}

/// Type-erased installed feature, as the dispatcher and main loop see it.
pub(crate) trait FeatureSlot: Send {
    fn name(&self) -> &str;

    fn setup(&mut self) -> anyhow::Result<()>;

    /// Called on every main loop iteration; ticks the feature when due.
    fn iteration(&mut self, ctx: &DeviceContext);

    /// Run `name` if this feature declares it.
    fn perform(&mut self, name: &str, message: &Message) -> Option<Result<()>>;

    fn status_defs(&self) -> Vec<ArgumentDef>;

    fn snapshot(&self) -> std::result::Result<HashMap<String, ArgumentValue>, StatusFailure>;

    /// Append this feature's entries, with event aliases applied.
    fn extend_descriptor(&self, descriptor: &mut DeviceDescriptor);
}

pub(crate) struct Installed<F: Feature> {
    feature: F,
    registry: CapabilityRegistry<F>,
    events: HashSet<String>,
    aliases: HashMap<String, String>,
    every: u64,
    iterations: u64,
}

impl<F: Feature> Installed<F> {
    /// Build the feature's registry and check that every alias names one of
    /// its events.
    pub(crate) fn new(feature: F, aliases: HashMap<String, String>) -> Result<Self> {
        let registry = feature.capabilities().build()?;
        let events: HashSet<String> = registry.events().iter().map(|e| e.name.clone()).collect();
        if let Some(unknown) = aliases.keys().find(|name| !events.contains(*name)) {
            return Err(LyncnatError::Registry(format!(
                "feature '{}' has no event '{}' to alias",
                feature.name(),
                unknown
            )));
        }
        let every = u64::from(feature.tick_every().max(1));
        Ok(Self {
            feature,
            registry,
            events,
            aliases,
            every,
            iterations: 0,
        })
    }
}

impl<F: Feature> FeatureSlot for Installed<F> {
    fn name(&self) -> &str {
        self.feature.name()
    }

    fn setup(&mut self) -> anyhow::Result<()> {
        self.feature.setup()
    }

    fn iteration(&mut self, ctx: &DeviceContext) {
        let due = self.iterations % self.every == 0;
        self.iterations = self.iterations.wrapping_add(1);
        if !due {
            return;
        }
        let feature_ctx = FeatureContext {
            device: ctx,
            events: &self.events,
            aliases: &self.aliases,
        };
        if let Err(e) = self.feature.tick(&feature_ctx) {
            tracing::warn!(
                device = %ctx.device(),
                "Feature '{}' periodic callback failed: {:#}",
                self.feature.name(),
                e
            );
        }
    }

    fn perform(&mut self, name: &str, message: &Message) -> Option<Result<()>> {
        let action = self.registry.action_mut(name)?;
        Some(invoke(&mut self.feature, action, message))
    }

    fn status_defs(&self) -> Vec<ArgumentDef> {
        self.registry.status_defs()
    }

    fn snapshot(&self) -> std::result::Result<HashMap<String, ArgumentValue>, StatusFailure> {
        self.registry.snapshot(&self.feature)
    }

    fn extend_descriptor(&self, descriptor: &mut DeviceDescriptor) {
        let own = self.registry.descriptor();
        descriptor.action_list.extend(own.action_list);
        descriptor.state_variable_list.extend(own.state_variable_list);
        descriptor
            .event_list
            .extend(own.event_list.into_iter().map(|mut event| {
                if let Some(alias) = self.aliases.get(&event.name) {
                    event.name = alias.clone();
                }
                event
            }));
    }
}
