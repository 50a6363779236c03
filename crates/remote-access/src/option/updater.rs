// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, OnceLock};

use tracing::debug;

use super::{Dynamic, Options};
use crate::messager::{Consumer, Message, MessageKind};

fn option_kind() -> MessageKind {
    static KIND: OnceLock<MessageKind> = OnceLock::new();
    *KIND.get_or_init(|| MessageKind::register("option"))
}

/// Wraps an option snapshot for the broker.
pub fn option_message(options: &Options) -> Message {
    Message::new(option_kind(), options.clone())
}

pub fn options_from_message(msg: &Message) -> Option<&Options> {
    msg.payload::<Options>(option_kind())
}

/// Copies the front layer of every option message into a [`Dynamic`] layer.
#[derive(Debug)]
pub struct OptionUpdater {
    target: Arc<Dynamic>,
}

impl OptionUpdater {
    pub fn new(target: Arc<Dynamic>) -> Self {
        Self { target }
    }
}

impl Consumer for OptionUpdater {
    fn consume(&self, msg: &Message) {
        let Some(options) = options_from_message(msg) else {
            return;
        };
        let mut updated = 0usize;
        options.range(|k, v| {
            self.target.set(k, v.clone());
            updated += 1;
            true
        });
        debug!(updated, "option: applied update");
    }
}
