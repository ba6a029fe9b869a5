//! Inbound dispatch: command name → handler routing.
//!
//! The table is populated before the channel starts and read-only
//! afterwards. Handler registration is deliberately unforgiving: two
//! handlers under one name is a programmer error and panics.

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Serialize};

use crate::channel::wire::{self, ArgFrame, DEFAULT_ARG_CAP};
use crate::trace::debug;

/// Reply payload for a command with no registered handler.
pub const UNKNOWN_COMMAND: &str = "Unknown Command";

/// One inbound request, split into name and raw argument bytes.
pub struct RpcRequest<'a> {
    pub name: &'a str,
    pub args: &'a [u8],
}

/// The reply flushed back to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub success: bool,
    pub payload: Vec<u8>,
}

impl RpcResponse {
    /// A successful reply carrying `payload`.
    #[must_use]
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            success: true,
            payload,
        }
    }

    /// A failed reply carrying a diagnostic message. Protocol-level
    /// failures are replies, not errors: the peer always gets an answer.
    #[must_use]
    pub fn failure(message: &str) -> Self {
        Self {
            success: false,
            payload: message.as_bytes().to_vec(),
        }
    }
}

type Handler = Box<dyn Fn(&RpcRequest<'_>) -> RpcResponse + Send + Sync>;

/// Name-keyed handler table.
#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<String, Handler>,
}

impl DispatchTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a raw handler.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered under `name`.
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&RpcRequest<'_>) -> RpcResponse + Send + Sync + 'static,
    {
        if self
            .handlers
            .insert(name.to_owned(), Box::new(handler))
            .is_some()
        {
            panic!("duplicate RPC handler registered for {name:?}");
        }
    }

    /// Registers a structured handler with postcard-encoded arguments and
    /// results.
    ///
    /// Decode and encode failures are converted into failed replies; they
    /// never propagate as errors.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered under `name`.
    pub fn register_typed<A, R, F>(&mut self, name: &str, handler: F)
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&A) -> Result<R, String> + Send + Sync + 'static,
    {
        self.register(name, move |request| {
            let args: A = match wire::decode_args(request.args) {
                Ok(args) => args,
                Err(_) => return RpcResponse::failure("Invalid argument encoding"),
            };
            match handler(&args) {
                Ok(result) => match ArgFrame::<DEFAULT_ARG_CAP>::encode(&result) {
                    Ok(frame) => RpcResponse::ok(frame.as_bytes().to_vec()),
                    Err(_) => RpcResponse::failure("Result encoding failed"),
                },
                Err(message) => RpcResponse::failure(&message),
            }
        });
    }

    /// Moves every handler of `other` into this table.
    ///
    /// # Panics
    ///
    /// Panics if the tables share a handler name.
    pub fn absorb(&mut self, other: DispatchTable) {
        for (name, handler) in other.handlers {
            if self.handlers.insert(name.clone(), handler).is_some() {
                panic!("duplicate RPC handler registered for {name:?}");
            }
        }
    }

    /// Removes a handler; returns whether one was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    /// Whether a handler is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Routes a framed command to its handler.
    pub fn dispatch(&self, data: &[u8]) -> RpcResponse {
        let Some((name, args)) = wire::split_command(data) else {
            return RpcResponse::failure(UNKNOWN_COMMAND);
        };
        match self.handlers.get(name) {
            Some(handler) => handler(&RpcRequest { name, args }),
            None => {
                debug!(name, "inbound command has no handler");
                RpcResponse::failure(UNKNOWN_COMMAND)
            }
        }
    }
}
