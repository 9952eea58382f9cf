pub mod bootstrap_dial;
pub mod bootstrap_listen;
pub mod conduit;
pub mod conn;
pub mod dial;
pub mod listen;
pub mod pre_conduit;
pub mod recv;
pub mod resume;
pub mod send;
pub mod send_receive;

use crate::context::ApiContext;
use crate::support::ApiStatus;

/// Invokes every callback a context still owes, with the given status. Used
/// on shutdown, where no machine gets to run its terminal state.
pub fn drain_callbacks(context: &mut ApiContext, status: ApiStatus) {
    match context {
        ApiContext::Conn(_) => (),
        ApiContext::Send(ctx) => {
            if let Some(callback) = ctx.callback.take() {
                callback(status);
            }
        }
        ApiContext::Recv(ctx) => {
            if let Some(callback) = ctx.receiver_callback.take() {
                callback(status, String::new(), crate::support::NULL_OP_HANDLE);
            }
            if let Some(callback) = ctx.read_callback.take() {
                callback(status, Vec::new());
            }
            if let Some(callback) = ctx.close_callback.take() {
                callback(status);
            }
        }
        ApiContext::SendReceive(ctx) => {
            if let Some(callback) = ctx.callback.take() {
                callback(status, Vec::new());
            }
        }
        ApiContext::Dial(ctx) => {
            if let Some(callback) = ctx.callback.take() {
                callback(status, crate::support::NULL_OP_HANDLE);
            }
        }
        ApiContext::Resume(ctx) => {
            if let Some(callback) = ctx.callback.take() {
                callback(status, crate::support::NULL_OP_HANDLE);
            }
        }
        ApiContext::Listen(ctx) => {
            if let Some(callback) = ctx.listen_callback.take() {
                callback(status, String::new(), crate::support::NULL_OP_HANDLE);
            }
            if let Some(callback) = ctx.accept_callback.take() {
                callback(status, crate::support::NULL_OP_HANDLE);
            }
            if let Some(callback) = ctx.close_callback.take() {
                callback(status);
            }
        }
        ApiContext::PreConduit(ctx) => {
            if let Some(callback) = ctx.accept_callback.take() {
                callback(status, crate::support::NULL_OP_HANDLE);
            }
        }
        ApiContext::Conduit(ctx) => {
            if let Some(callback) = ctx.read_callback.take() {
                callback(status, Vec::new());
            }
            for (callback, _) in ctx.send_queue.drain(..) {
                callback(status);
            }
            for (_, callback) in ctx.sent_map.drain() {
                callback(status);
            }
            if let Some(callback) = ctx.close_callback.take() {
                callback(status);
            }
        }
        ApiContext::BootstrapDial(ctx) => {
            if let Some(callback) = ctx.callback.take() {
                callback(status, crate::support::NULL_OP_HANDLE);
            }
        }
        ApiContext::BootstrapListen(ctx) => {
            if let Some(callback) = ctx.listen_callback.take() {
                callback(status, String::new(), crate::support::NULL_OP_HANDLE);
            }
            if let Some(callback) = ctx.accept_callback.take() {
                callback(status, crate::support::NULL_OP_HANDLE);
            }
            if let Some(callback) = ctx.close_callback.take() {
                callback(status);
            }
        }
        ApiContext::BootstrapPreConduit(ctx) => {
            if let Some(callback) = ctx.accept_callback.take() {
                callback(status, crate::support::NULL_OP_HANDLE);
            }
        }
    }
}
