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

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;

use crate::filters::{
    tls_inspector, CreateFilterArgs, CreationError, DynListenerFilterFactory,
    DynNetworkFilterFactory, FilterSet, ListenerFilter, ListenerFilterFactory,
    NetworkFilterFactory, NetworkFilterInstance,
};

static LISTENER_FILTERS: Lazy<ArcSwap<FilterSet<dyn ListenerFilterFactory>>> =
    Lazy::new(|| {
        ArcSwap::new(Arc::new(FilterSet::with([tls_inspector::factory()])))
    });

static NETWORK_FILTERS: Lazy<ArcSwap<FilterSet<dyn NetworkFilterFactory>>> =
    Lazy::new(|| ArcSwap::new(Arc::new(FilterSet::default())));

/// Registry of all filter factories known to the process.
///
/// Listener filters and network filters are distinct namespaces; the
/// canonical TLS inspector is pre-registered in the former.
#[derive(Debug)]
pub struct FilterRegistry;

impl FilterRegistry {
    /// Loads the provided factories into the listener-filter registry.
    pub fn register_listener_filters(
        factories: impl IntoIterator<Item = DynListenerFilterFactory>,
    ) {
        let mut set = FilterSet::clone(&LISTENER_FILTERS.load_full());
        for factory in factories {
            set.insert(factory);
        }
        LISTENER_FILTERS.store(Arc::new(set));
    }

    /// Loads the provided factories into the network-filter registry.
    pub fn register_network_filters(factories: impl IntoIterator<Item = DynNetworkFilterFactory>) {
        let mut set = FilterSet::clone(&NETWORK_FILTERS.load_full());
        for factory in factories {
            set.insert(factory);
        }
        NETWORK_FILTERS.store(Arc::new(set));
    }

    /// Creates a listener filter for `key`. Errors if no factory is
    /// registered under that name or the configuration is rejected.
    pub fn listener_filter(
        key: &str,
        args: CreateFilterArgs<'_>,
    ) -> Result<Arc<dyn ListenerFilter>, CreationError> {
        match LISTENER_FILTERS.load().get(key) {
            Some(factory) => factory.create_filter(args),
            None => Err(CreationError::NotFound(key.to_owned())),
        }
    }

    /// Creates a network filter instance for `key`.
    pub fn network_filter(
        key: &str,
        args: CreateFilterArgs<'_>,
    ) -> Result<NetworkFilterInstance, CreationError> {
        match NETWORK_FILTERS.load().get(key) {
            Some(factory) => factory.create_filter(args),
            None => Err(CreationError::NotFound(key.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenerFactoryContext;

    #[test]
    fn unknown_name_message() {
        let mut context = ListenerFactoryContext::for_testing();
        let err = FilterRegistry::network_filter(
            "no.such.filter",
            CreateFilterArgs {
                config: None,
                context: &mut context,
            },
        )
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Didn't find a registered implementation for name: 'no.such.filter'"
        );
    }

    #[test]
    fn tls_inspector_is_preregistered() {
        let mut context = ListenerFactoryContext::for_testing();
        let filter = FilterRegistry::listener_filter(
            tls_inspector::NAME,
            CreateFilterArgs {
                config: None,
                context: &mut context,
            },
        );
        assert!(filter.is_ok());
    }
}
