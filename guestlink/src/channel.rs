//! RPC channel over a pluggable transport.

pub mod dispatch;
pub mod endpoint;
mod reset;
pub mod selector;
pub mod types;
pub mod wire;

pub use dispatch::{DispatchTable, RpcRequest, RpcResponse, UNKNOWN_COMMAND};
pub use endpoint::{Channel, FailureCallback, InboundHandle, ResetCallback};
pub use types::{
    ChannelConfig, ChannelError, RpcReply, Transport, TransportError, TransportKind,
    MAX_RESTART_ATTEMPTS, RESTART_DELAY,
};
pub use wire::{decode_args, frame_command, split_command, ArgFrame, WireError, DEFAULT_ARG_CAP};
