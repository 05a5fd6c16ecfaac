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

/// Failure to materialize a filter from its declared name and config.
#[derive(Debug, thiserror::Error)]
pub enum CreationError {
    #[error("Didn't find a registered implementation for name: '{0}'")]
    NotFound(String),
    #[error("filter `{0}` requires configuration")]
    MissingConfig(&'static str),
    #[error("invalid configuration for filter `{filter}`: {error}")]
    InvalidConfig {
        filter: String,
        error: serde_json::Error,
    },
    #[error("field `{field}` is invalid: {reason}")]
    FieldInvalid { field: String, reason: String },
}

impl CreationError {
    pub fn invalid_config(filter: impl Into<String>, error: serde_json::Error) -> Self {
        Self::InvalidConfig {
            filter: filter.into(),
            error,
        }
    }
}
