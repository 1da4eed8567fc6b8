// SPDX-License-Identifier: GPL-3.0-or-later
//! Command name to handler lookup, frozen once the engine starts.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::handler::TaskHandler;

/// Description of a registered command, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandInfo {
    pub command_name: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn resolve(&self, command_name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(command_name).cloned()
    }

    pub fn contains(&self, command_name: &str) -> bool {
        self.handlers.contains_key(command_name)
    }

    /// Registered commands sorted by command name.
    pub fn commands(&self) -> Vec<CommandInfo> {
        let mut commands: Vec<CommandInfo> = self
            .handlers
            .iter()
            .map(|(command_name, handler)| CommandInfo {
                command_name: command_name.clone(),
                name: handler.name(),
                description: handler.description(),
            })
            .collect();
        commands.sort_by(|a, b| a.command_name.cmp(&b.command_name));
        commands
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn register<H>(self, command_name: impl Into<String>, handler: H) -> Self
    where
        H: TaskHandler + 'static,
    {
        self.register_arc(command_name, Arc::new(handler))
    }

    /// Register a shared handler. A later registration for the same command wins.
    pub fn register_arc(
        mut self,
        command_name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let command_name = command_name.into();
        let name = handler.name();
        if self.handlers.insert(command_name.clone(), handler).is_some() {
            warn!(target: "registry", command = %command_name, "handler replaced an earlier registration");
        } else {
            info!(target: "registry", command = %command_name, handler = %name, "registered task handler");
        }
        self
    }

    pub fn build(self) -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}
