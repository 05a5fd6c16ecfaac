/*
 * Copyright 2026 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::{
    filters::{CreationError, ListenerFilter, NetworkFilter},
    listener::ListenerFactoryContext,
};

/// An owned pointer to a dynamic [`ListenerFilterFactory`] instance.
pub type DynListenerFilterFactory = Box<dyn ListenerFilterFactory>;

/// An owned pointer to a dynamic [`NetworkFilterFactory`] instance.
pub type DynNetworkFilterFactory = Box<dyn NetworkFilterFactory>;

/// Arguments handed to a factory when a listener is being built.
pub struct CreateFilterArgs<'a> {
    /// Opaque configuration from the listener proto, if any.
    pub config: Option<&'a serde_json::Value>,
    /// Build context: lets factories contribute socket options and register
    /// init targets against the listener under construction.
    pub context: &'a mut ListenerFactoryContext,
}

impl CreateFilterArgs<'_> {
    /// Deserializes the configuration into `T`, defaulting when absent.
    pub fn config_or_default<T: DeserializeOwned + Default>(
        &self,
        filter: &'static str,
    ) -> Result<T, CreationError> {
        match self.config {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|error| CreationError::invalid_config(filter, error)),
            None => Ok(T::default()),
        }
    }

    /// Deserializes the configuration into `T`, erroring when absent.
    pub fn require_config<T: DeserializeOwned>(
        &self,
        filter: &'static str,
    ) -> Result<T, CreationError> {
        let value = self.config.ok_or(CreationError::MissingConfig(filter))?;
        serde_json::from_value(value.clone())
            .map_err(|error| CreationError::invalid_config(filter, error))
    }
}

/// Provides the name and creation function for an accept-time filter.
pub trait ListenerFilterFactory: Sync + Send {
    /// The factory's registry key, in the form
    /// `gangway.listener_filters.<module>.<version>.<item-name>`.
    fn name(&self) -> &'static str;

    /// Returns the schema for the configuration of the filter.
    fn config_schema(&self) -> schemars::schema::RootSchema;

    /// Builds a filter for the listener under construction. Factories may
    /// call
    /// [`add_listen_socket_option`][ListenerFactoryContext::add_listen_socket_option]
    /// on the context to attach socket options to the listener's socket.
    fn create_filter(
        &self,
        args: CreateFilterArgs<'_>,
    ) -> Result<Arc<dyn ListenerFilter>, CreationError>;
}

/// Provides the name and creation function for a network filter.
pub trait NetworkFilterFactory: Sync + Send {
    /// The factory's registry key, in the form
    /// `gangway.filters.<module>.<version>.<item-name>`.
    fn name(&self) -> &'static str;

    /// Returns the schema for the configuration of the filter.
    fn config_schema(&self) -> schemars::schema::RootSchema;

    /// Builds a filter instance for one filter chain of the listener under
    /// construction. Factories needing external readiness (e.g. dynamic route
    /// tables) register an init target on the context, which keeps the
    /// listener warming until the target is ready.
    fn create_filter(
        &self,
        args: CreateFilterArgs<'_>,
    ) -> Result<NetworkFilterInstance, CreationError>;
}

/// The value returned by [`NetworkFilterFactory::create_filter`].
#[derive(Clone)]
pub struct NetworkFilterInstance(Arc<NetworkFilterInstanceData>);

struct NetworkFilterInstanceData {
    config: serde_json::Value,
    filter: Arc<dyn NetworkFilter>,
}

impl NetworkFilterInstance {
    pub fn new(config: serde_json::Value, filter: Arc<dyn NetworkFilter>) -> Self {
        Self(Arc::new(NetworkFilterInstanceData { config, filter }))
    }

    pub fn testing(filter: impl NetworkFilter + 'static) -> Self {
        Self::new(serde_json::Value::Null, Arc::new(filter))
    }

    pub fn config(&self) -> &serde_json::Value {
        &self.0.config
    }

    pub fn filter(&self) -> &Arc<dyn NetworkFilter> {
        &self.0.filter
    }
}

impl std::fmt::Debug for NetworkFilterInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkFilterInstance")
            .field("config", self.config())
            .finish_non_exhaustive()
    }
}
