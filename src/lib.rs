// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A transparent TCP proxy that sits between an OIG inverter gateway (the "BOX")
//! and its cloud endpoint, synthesizing local acknowledgements when the cloud is
//! unreachable so the BOX never has to know its cloud link dropped.

pub mod cloud;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod frame;
pub mod listener;
pub mod mode;
pub mod responder;

#[macro_use]
extern crate derive_builder;

pub use config::{ProxyConfig, ProxyConfigBuilder};
pub use engine::BoxSession;
pub use events::{Event, EventBus};
