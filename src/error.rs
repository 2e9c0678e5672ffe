//  Copyright 2024 Cedana.
//
//  Modifications licensed under the Apache License, Version 2.0.

//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Typed errors shared by every component (C1-C8). Hot-path append calls stay
//! on `bool`/small-int returns per the error-handling policy; everything else
//! that can fail returns `Result<T, StreamError>`.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("{what} is at capacity ({capacity})")]
    CapacityExceeded { what: &'static str, capacity: usize },

    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },

    #[error("invalid argument to {op}: {reason}")]
    InvalidArgument { op: &'static str, reason: String },

    #[error("io error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("invariant violated in {component}: {detail}")]
    InvariantViolated {
        component: &'static str,
        detail: String,
    },

    #[error("{op} rejected: job manager is stopped")]
    Stopped { op: &'static str },
}

pub type Result<T> = std::result::Result<T, StreamError>;

impl StreamError {
    pub fn io(op: &'static str, source: io::Error) -> Self {
        StreamError::Io { op, source }
    }

    pub fn not_found(what: &'static str, key: impl Into<String>) -> Self {
        StreamError::NotFound { what, key: key.into() }
    }

    pub fn invalid(op: &'static str, reason: impl Into<String>) -> Self {
        StreamError::InvalidArgument { op, reason: reason.into() }
    }

    pub fn invariant(component: &'static str, detail: impl Into<String>) -> Self {
        StreamError::InvariantViolated { component, detail: detail.into() }
    }
}
