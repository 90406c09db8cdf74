// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Common error types shared across the session engine.

pub use crate::cloud::{CloudError, CloudErrorKind};
pub use crate::config::{ConfigError, ConfigErrorKind};
pub use crate::engine::EngineError;
pub use crate::frame::{FrameError, FrameErrorKind};
