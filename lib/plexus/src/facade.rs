use crate::encoding::base64;
use crate::logging::Logger;
use crate::manager::ApiManager;
use crate::plugin::PluginHandle;
use crate::support::{
    ApiStatus, BootstrapOptions, LinkAddress, OpHandle, ReceiveOptions, ResumeOptions, SendOptions,
};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

// Blocking convenience layer over the asynchronous core: every call posts
// the matching manager operation with a callback that fulfills a one-shot
// channel, then blocks on it. Timeouts are implemented here, not in the
// core; a late result lands in a disconnected channel and disappears.
// A rejected post means the worker has already stopped, so every wrapper
// reports it as `Closing`.

/// Blocking entry point for applications.
pub struct Courier {
    manager: Arc<ApiManager>,
}

impl Courier {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(plugins: Vec<PluginHandle>, log: L) -> Courier {
        Courier {
            manager: Arc::new(ApiManager::new(plugins, log)),
        }
    }

    #[inline]
    pub fn manager(&self) -> &Arc<ApiManager> {
        &self.manager
    }

    /// Sends one package and blocks until the channel accepted it.
    pub fn send(&self, opts: SendOptions, data: Vec<u8>) -> ApiStatus {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.send(opts, data, move |status| {
            drop(tx.send(status));
        });

        match response.is_ok() {
            true => rx.recv().unwrap_or(ApiStatus::InternalError),
            _ => ApiStatus::Closing,
        }
    }

    pub fn send_str(&self, opts: SendOptions, message: &str) -> ApiStatus {
        self.send(opts, message.as_bytes().to_vec())
    }

    /// Sends one package and blocks for the single tagged response.
    pub fn send_receive(&self, opts: SendOptions, data: Vec<u8>) -> (ApiStatus, Vec<u8>) {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.send_receive(opts, data, move |status, bytes| {
            drop(tx.send((status, bytes)));
        });

        match response.is_ok() {
            true => rx.recv().unwrap_or((ApiStatus::InternalError, Vec::new())),
            _ => (ApiStatus::Closing, Vec::new()),
        }
    }

    /// Opens a bidirectional conduit to the peer behind the send address.
    pub fn dial(&self, opts: SendOptions, data: Vec<u8>) -> (ApiStatus, Conduit) {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.dial(opts, data, move |status, handle| {
            drop(tx.send((status, handle)));
        });

        let (status, handle) = match response.is_ok() {
            true => rx.recv().unwrap_or((ApiStatus::InternalError, 0)),
            _ => (ApiStatus::Closing, 0),
        };
        (status, Conduit::new(self.manager.clone(), handle))
    }

    /// Reconstructs a conduit from saved addresses without a handshake.
    pub fn resume(&self, opts: ResumeOptions) -> (ApiStatus, Conduit) {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.resume(opts, move |status, handle| {
            drop(tx.send((status, handle)));
        });

        let (status, handle) = match response.is_ok() {
            true => rx.recv().unwrap_or((ApiStatus::InternalError, 0)),
            _ => (ApiStatus::Closing, 0),
        };
        (status, Conduit::new(self.manager.clone(), handle))
    }

    pub fn bootstrap_dial(&self, opts: BootstrapOptions, data: Vec<u8>) -> (ApiStatus, Conduit) {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.bootstrap_dial(opts, data, move |status, handle| {
            drop(tx.send((status, handle)));
        });

        let (status, handle) = match response.is_ok() {
            true => rx.recv().unwrap_or((ApiStatus::InternalError, 0)),
            _ => (ApiStatus::Closing, 0),
        };
        (status, Conduit::new(self.manager.clone(), handle))
    }

    /// Stands up a receive endpoint and returns its link address for
    /// out-of-band distribution.
    pub fn receive(&self, opts: ReceiveOptions) -> (ApiStatus, LinkAddress, Receiver) {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.get_receiver(opts, move |status, address, handle| {
            drop(tx.send((status, address, handle)));
        });

        let (status, address, handle) = match response.is_ok() {
            true => rx
                .recv()
                .unwrap_or((ApiStatus::InternalError, String::new(), 0)),
            _ => (ApiStatus::Closing, String::new(), 0),
        };
        (status, address, Receiver::new(self.manager.clone(), handle))
    }

    /// Like [`Courier::receive`], but each delivery carries the reply
    /// address and tag, packaged as a [`ReplySender`].
    pub fn receive_respond(&self, opts: ReceiveOptions) -> (ApiStatus, LinkAddress, ReplyReceiver) {
        let send_opts = SendOptions {
            send_channel: opts.send_channel.clone(),
            send_role: opts.send_role.clone(),
            ..Default::default()
        };

        let (status, address, receiver) = self.receive(opts);
        (
            status,
            address,
            ReplyReceiver {
                manager: self.manager.clone(),
                handle: receiver.handle,
                send_opts,
            },
        )
    }

    /// Stands up an accept endpoint for incoming dials.
    pub fn listen(&self, opts: ReceiveOptions) -> (ApiStatus, LinkAddress, Acceptor) {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.listen(opts, move |status, address, handle| {
            drop(tx.send((status, address, handle)));
        });

        let (status, address, handle) = match response.is_ok() {
            true => rx
                .recv()
                .unwrap_or((ApiStatus::InternalError, String::new(), 0)),
            _ => (ApiStatus::Closing, String::new(), 0),
        };
        (status, address, Acceptor::new(self.manager.clone(), handle))
    }

    pub fn bootstrap_listen(&self, opts: BootstrapOptions) -> (ApiStatus, LinkAddress, Acceptor) {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self
            .manager
            .bootstrap_listen(opts, move |status, address, handle| {
                drop(tx.send((status, address, handle)));
            });

        let (status, address, handle) = match response.is_ok() {
            true => rx
                .recv()
                .unwrap_or((ApiStatus::InternalError, String::new(), 0)),
            _ => (ApiStatus::Closing, String::new(), 0),
        };
        (status, address, Acceptor::new(self.manager.clone(), handle))
    }

    /// Fails everything outstanding with `Closing`.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }
}

/// A bidirectional user-visible stream backed by one send connection, one
/// receive connection, and a package id.
pub struct Conduit {
    manager: Arc<ApiManager>,
    handle: OpHandle,
}

impl Conduit {
    #[inline]
    pub fn new(manager: Arc<ApiManager>, handle: OpHandle) -> Conduit {
        Conduit { manager, handle }
    }

    #[inline]
    pub fn handle(&self) -> OpHandle {
        self.handle
    }

    /// Blocks for the next package. With a timeout the call returns
    /// `Timeout` and a package arriving later waits for the next read.
    pub fn read(&self, timeout: Option<Duration>) -> (ApiStatus, Vec<u8>) {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.read(self.handle, move |status, bytes| {
            drop(tx.send((status, bytes)));
        });

        if !response.is_ok() {
            return (ApiStatus::Closing, Vec::new());
        }

        match timeout {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(_) => (ApiStatus::Timeout, Vec::new()),
            },
            None => rx.recv().unwrap_or((ApiStatus::InternalError, Vec::new())),
        }
    }

    pub fn read_str(&self) -> (ApiStatus, String) {
        let (status, bytes) = self.read(None);
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Blocks until the package was handed to the channel.
    pub fn write(&self, bytes: Vec<u8>) -> ApiStatus {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.write(self.handle, bytes, move |status| {
            drop(tx.send(status));
        });

        match response.is_ok() {
            true => rx.recv().unwrap_or(ApiStatus::InternalError),
            _ => ApiStatus::Closing,
        }
    }

    pub fn write_str(&self, message: &str) -> ApiStatus {
        self.write(message.as_bytes().to_vec())
    }

    pub fn close(&self) -> ApiStatus {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.close(self.handle, move |status| {
            drop(tx.send(status));
        });

        match response.is_ok() {
            true => rx.recv().unwrap_or(ApiStatus::InternalError),
            _ => ApiStatus::Closing,
        }
    }
}

/// Blocking handle onto a receive endpoint.
pub struct Receiver {
    manager: Arc<ApiManager>,
    handle: OpHandle,
}

impl Receiver {
    #[inline]
    pub fn new(manager: Arc<ApiManager>, handle: OpHandle) -> Receiver {
        Receiver { manager, handle }
    }

    #[inline]
    pub fn handle(&self) -> OpHandle {
        self.handle
    }

    /// Blocks for the next package. On timeout the pending request inside
    /// the core is cancelled so a later package is not claimed by it.
    pub fn receive(&self, timeout: Option<Duration>) -> (ApiStatus, Vec<u8>) {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.receive(self.handle, move |status, bytes| {
            drop(tx.send((status, bytes)));
        });

        if !response.is_ok() {
            return (ApiStatus::Closing, Vec::new());
        }

        match timeout {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(_) => {
                    self.manager.cancel(self.handle);
                    (ApiStatus::Timeout, Vec::new())
                }
            },
            None => rx.recv().unwrap_or((ApiStatus::InternalError, Vec::new())),
        }
    }

    pub fn close(&self) -> ApiStatus {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.close(self.handle, move |status| {
            drop(tx.send(status));
        });

        match response.is_ok() {
            true => rx.recv().unwrap_or(ApiStatus::InternalError),
            _ => ApiStatus::Closing,
        }
    }
}

/// Receive endpoint whose deliveries can be answered.
pub struct ReplyReceiver {
    manager: Arc<ApiManager>,
    handle: OpHandle,
    send_opts: SendOptions,
}

impl ReplyReceiver {
    /// Blocks for the next package and returns it together with a sender
    /// aimed back at the peer.
    pub fn receive(&self) -> (ApiStatus, Vec<u8>, ReplySender) {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self
            .manager
            .receive_respond(self.handle, move |status, bytes, address, package_id| {
                drop(tx.send((status, bytes, address, package_id)));
            });

        let (status, bytes, address, package_id) = match response.is_ok() {
            true => rx.recv().unwrap_or((
                ApiStatus::InternalError,
                Vec::new(),
                String::new(),
                String::new(),
            )),
            _ => (
                ApiStatus::Closing,
                Vec::new(),
                String::new(),
                String::new(),
            ),
        };

        let mut send_opts = self.send_opts.clone();
        send_opts.send_address = address;

        (
            status,
            bytes,
            ReplySender {
                manager: self.manager.clone(),
                send_opts,
                package_id,
            },
        )
    }

    pub fn close(&self) -> ApiStatus {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.close(self.handle, move |status| {
            drop(tx.send(status));
        });

        match response.is_ok() {
            true => rx.recv().unwrap_or(ApiStatus::InternalError),
            _ => ApiStatus::Closing,
        }
    }
}

/// Answers one received message over a fresh send, tagging the reply so the
/// peer's pending operation claims it.
pub struct ReplySender {
    manager: Arc<ApiManager>,
    send_opts: SendOptions,
    package_id: String,
}

impl ReplySender {
    pub fn respond(&self, data: Vec<u8>) -> ApiStatus {
        let tag = match base64::decode(&self.package_id) {
            Ok(tag) => tag,
            Err(_) => return ApiStatus::InvalidArgument,
        };

        let mut package = tag;
        package.extend_from_slice(&data);

        let (tx, rx) = mpsc::sync_channel(1);
        let response = self
            .manager
            .send(self.send_opts.clone(), package, move |status| {
                drop(tx.send(status));
            });

        match response.is_ok() {
            true => rx.recv().unwrap_or(ApiStatus::InternalError),
            _ => ApiStatus::Closing,
        }
    }

    pub fn respond_str(&self, message: &str) -> ApiStatus {
        self.respond(message.as_bytes().to_vec())
    }
}

/// Blocking handle onto a listening endpoint.
pub struct Acceptor {
    manager: Arc<ApiManager>,
    handle: OpHandle,
}

impl Acceptor {
    #[inline]
    pub fn new(manager: Arc<ApiManager>, handle: OpHandle) -> Acceptor {
        Acceptor { manager, handle }
    }

    #[inline]
    pub fn handle(&self) -> OpHandle {
        self.handle
    }

    /// Blocks until a dial has been fully upgraded into a conduit.
    pub fn accept(&self) -> (ApiStatus, Conduit) {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.accept(self.handle, move |status, handle| {
            drop(tx.send((status, handle)));
        });

        let (status, handle) = match response.is_ok() {
            true => rx.recv().unwrap_or((ApiStatus::InternalError, 0)),
            _ => (ApiStatus::Closing, 0),
        };
        (status, Conduit::new(self.manager.clone(), handle))
    }

    pub fn close(&self) -> ApiStatus {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = self.manager.close(self.handle, move |status| {
            drop(tx.send(status));
        });

        match response.is_ok() {
            true => rx.recv().unwrap_or(ApiStatus::InternalError),
            _ => ApiStatus::Closing,
        }
    }
}
