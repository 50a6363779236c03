// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::context::Context;

pub type WorkerError = Box<dyn std::error::Error + Send + Sync>;

/// A component with background work bound to its owner's lifecycle.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Starts background work. Tasks should stop when `ctx` is done.
    async fn start(&self, ctx: &Context) -> Result<(), WorkerError>;

    async fn stop(&self) -> Result<(), WorkerError>;
}
