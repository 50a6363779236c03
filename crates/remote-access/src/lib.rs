// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote access layer.
//!
//! Services are described by TOML files, loaded into a [`Mapper`] and called
//! through a [`Raller`]. Each service owns a discoverer feeding addresses to
//! a connector, which picks an address, dials it and pools the connection.
//! Components talk to each other through a per-service message broker.
//! [`Runtime`] bundles the process-wide pieces so callers pass them around
//! explicitly.

#![cfg_attr(
    not(test),
    deny(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::todo,
        clippy::unimplemented
    )
)]

pub mod address;
pub mod config;
pub mod conn;
pub mod connector;
pub mod context;
pub mod discoverer;
pub mod error;
pub mod logger;
pub mod messager;
pub mod option;
pub mod picker;
pub mod pool;
pub mod ral;
pub mod runtime;
pub mod servicer;
pub mod timer;
pub mod worker;
pub mod writer;

pub use address::{Address, Network};
pub use config::{ConfigError, RemoteAccessConfig};
pub use connector::{ConnectError, Connector, DefaultConnector};
pub use context::{Context, ContextError};
pub use discoverer::{Discoverer, DiscovererRegistry, StaticDiscoverer};
pub use error::ErrorKind;
pub use logger::{Field, WorkLogger};
pub use messager::{Broker, Message, MessageKind};
pub use option::{Dynamic, Fixed, Options, Value};
pub use picker::{AddressPicker, PickerRegistry};
pub use ral::{CallOptions, RalError, RalParam, Raller, Request, RequestError, Response};
pub use runtime::Runtime;
pub use servicer::{LoadFailure, LoadOptions, Loader, Mapper, Servicer, ServicerFactory};
