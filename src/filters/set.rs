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

/// A map of factory names to factory values.
pub type FilterMap<F> = std::collections::HashMap<&'static str, Arc<F>>;

/// A set of factories to be registered with the
/// [`FilterRegistry`][crate::filters::FilterRegistry]. Generic over the
/// factory kind, since listener filters and network filters live in separate
/// namespaces.
pub struct FilterSet<F: FactoryName + ?Sized>(FilterMap<F>);

/// The registry key of a factory.
pub trait FactoryName {
    fn factory_name(&self) -> &'static str;
}

impl FactoryName for dyn crate::filters::ListenerFilterFactory {
    fn factory_name(&self) -> &'static str {
        self.name()
    }
}

impl FactoryName for dyn crate::filters::NetworkFilterFactory {
    fn factory_name(&self) -> &'static str {
        self.name()
    }
}

impl<F: FactoryName + ?Sized> FilterSet<F> {
    /// Creates a new [`FilterSet`] with `factories` and no defaults.
    pub fn with(factories: impl IntoIterator<Item = Box<F>>) -> Self {
        let mut set = Self(Default::default());
        for factory in factories {
            set.insert(factory);
        }
        set
    }

    /// Returns the factory matching `key`, if any.
    pub fn get(&self, key: &str) -> Option<&Arc<F>> {
        self.0.get(key)
    }

    /// Inserts `factory`, returning any previous factory under that name.
    pub fn insert(&mut self, factory: Box<F>) -> Option<Arc<F>> {
        let factory: Arc<F> = Arc::from(factory);
        self.0.insert(factory.factory_name(), factory)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Arc<F>)> {
        self.0.iter().map(|(name, factory)| (*name, factory))
    }
}

impl<F: FactoryName + ?Sized> Clone for FilterSet<F> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<F: FactoryName + ?Sized> Default for FilterSet<F> {
    fn default() -> Self {
        Self(Default::default())
    }
}
