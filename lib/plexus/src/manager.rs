use crate::channel_mgr::{ActivateChannelStatusCode, ChannelManager};
use crate::context::{
    ApiContext, BootstrapPreConduitContext, ConduitContext, ConnContext, PreConduitContext,
};
use crate::engine::{self, ApiEvent, EventResult};
use crate::frame::BootstrapEnvelope;
use crate::handler::{Handler, Poster};
use crate::logging::{self, debug, error, warn, Logger};
use crate::machines::bootstrap_dial::BootstrapDialMachine;
use crate::machines::bootstrap_listen::{BootstrapListenMachine, BootstrapPreConduitMachine};
use crate::machines::conduit::ConduitMachine;
use crate::machines::conn::ConnMachine;
use crate::machines::dial::DialMachine;
use crate::machines::listen::ListenMachine;
use crate::machines::pre_conduit::PreConduitMachine;
use crate::machines::recv::RecvMachine;
use crate::machines::resume::ResumeMachine;
use crate::machines::send::SendMachine;
use crate::machines::send_receive::SendReceiveMachine;
use crate::plugin::{ChannelPlugin, EventSink, PluginHandle};
use crate::registry::Registry;
use crate::support::{
    ApiStatus, BootstrapOptions, BytesCallback, ChannelId, ChannelProps, ChannelStatus, ConnId,
    ConnectionStatus, HandleCallback, HandleSource, LinkAddress, LinkId, LinkProps, LinkStatus,
    OpHandle, PackageId, PackageStatus, ReceiveOptions, ReceiverCallback, RespondCallback,
    ResumeOptions, SdkResponse, SdkStatus, SendOptions, StatusCallback, NULL_OP_HANDLE,
};
use crate::PACKAGE_ID_LEN;
use hashbrown::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

/// Counters exposed for quiescence checks in tests and diagnostics.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ManagerStats {
    pub contexts: usize,
    pub handle_entries: usize,
    pub id_entries: usize,
    pub package_entries: usize,
}

/// Public face of the runtime. Every entry point enqueues work onto the
/// single worker thread owning all mutable core state and returns
/// immediately; the supplied callback is invoked exactly once, on the
/// worker, with a terminal status.
pub struct ApiManager {
    handler: Handler<ManagerInner>,
    poster: Poster<ManagerInner>,
}

impl ApiManager {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(plugins: Vec<PluginHandle>, log: L) -> ApiManager {
        let inner = ManagerInner::new(plugins, logging::child(log));
        let handler = Handler::new("api-manager-thread", inner);
        let poster = handler.poster();

        // Hand the worker its own posting half before any real task runs.
        let self_poster = poster.clone();
        poster.post(Box::new(move |inner| inner.poster = Some(self_poster)));

        ApiManager { handler, poster }
    }

    /// Callback surface to hand to plugins.
    pub fn event_sink(&self) -> Arc<dyn EventSink> {
        Arc::new(ManagerSink {
            poster: self.poster.clone(),
        })
    }

    /// Blocks until every task enqueued so far, and everything those tasks
    /// spawned, has run.
    pub fn wait_for_callbacks(&self) {
        let (tx, rx) = mpsc::sync_channel(1);
        if self.poster.post_wait(Box::new(move |_| {
            drop(tx.send(()));
        })) {
            drop(rx.recv());
        }
    }

    pub fn stats(&self) -> ManagerStats {
        let (tx, rx) = mpsc::sync_channel(1);
        self.poster.post(Box::new(move |inner| {
            drop(tx.send(ManagerStats {
                contexts: inner.contexts.len(),
                handle_entries: inner.registry.handle_entries(),
                id_entries: inner.registry.id_entries(),
                package_entries: inner.registry.package_entries(),
            }));
        }));
        rx.recv().expect("Manager worker is gone")
    }

    /// Fails every outstanding callback with `Closing` and drops all
    /// contexts. The worker itself stops when the manager is dropped.
    pub fn shutdown(&self) {
        self.poster.post(Box::new(|inner| inner.shutdown()));
        self.wait_for_callbacks();
    }

    #[inline]
    fn post(&self, task: crate::handler::Task<ManagerInner>) -> SdkResponse {
        match self.poster.post(task) {
            true => SdkResponse::ok(),
            _ => SdkResponse::new(SdkStatus::Invalid),
        }
    }

    // ----------------------------------------------
    // Library API calls
    // ----------------------------------------------

    pub fn send<F>(&self, opts: SendOptions, data: Vec<u8>, callback: F) -> SdkResponse
    where
        F: FnOnce(ApiStatus) + Send + 'static,
    {
        self.post(Box::new(move |inner| {
            inner.send(opts, data, Box::new(callback))
        }))
    }

    pub fn send_receive<F>(&self, opts: SendOptions, data: Vec<u8>, callback: F) -> SdkResponse
    where
        F: FnOnce(ApiStatus, Vec<u8>) + Send + 'static,
    {
        self.post(Box::new(move |inner| {
            inner.send_receive(opts, data, Box::new(callback))
        }))
    }

    pub fn dial<F>(&self, opts: SendOptions, data: Vec<u8>, callback: F) -> SdkResponse
    where
        F: FnOnce(ApiStatus, OpHandle) + Send + 'static,
    {
        self.post(Box::new(move |inner| {
            inner.dial(opts, data, Box::new(callback))
        }))
    }

    pub fn resume<F>(&self, opts: ResumeOptions, callback: F) -> SdkResponse
    where
        F: FnOnce(ApiStatus, OpHandle) + Send + 'static,
    {
        self.post(Box::new(move |inner| inner.resume(opts, Box::new(callback))))
    }

    pub fn bootstrap_dial<F>(
        &self,
        opts: BootstrapOptions,
        data: Vec<u8>,
        callback: F,
    ) -> SdkResponse
    where
        F: FnOnce(ApiStatus, OpHandle) + Send + 'static,
    {
        self.post(Box::new(move |inner| {
            inner.bootstrap_dial(opts, data, Box::new(callback))
        }))
    }

    pub fn get_receiver<F>(&self, opts: ReceiveOptions, callback: F) -> SdkResponse
    where
        F: FnOnce(ApiStatus, LinkAddress, OpHandle) + Send + 'static,
    {
        self.post(Box::new(move |inner| {
            inner.get_receiver(opts, Box::new(callback))
        }))
    }

    pub fn receive<F>(&self, handle: OpHandle, callback: F) -> SdkResponse
    where
        F: FnOnce(ApiStatus, Vec<u8>) + Send + 'static,
    {
        self.post(Box::new(move |inner| {
            inner.receive(handle, Box::new(callback))
        }))
    }

    pub fn receive_respond<F>(&self, handle: OpHandle, callback: F) -> SdkResponse
    where
        F: FnOnce(ApiStatus, Vec<u8>, LinkAddress, String) + Send + 'static,
    {
        self.post(Box::new(move |inner| {
            inner.receive_respond(handle, Box::new(callback))
        }))
    }

    pub fn listen<F>(&self, opts: ReceiveOptions, callback: F) -> SdkResponse
    where
        F: FnOnce(ApiStatus, LinkAddress, OpHandle) + Send + 'static,
    {
        self.post(Box::new(move |inner| inner.listen(opts, Box::new(callback))))
    }

    pub fn bootstrap_listen<F>(&self, opts: BootstrapOptions, callback: F) -> SdkResponse
    where
        F: FnOnce(ApiStatus, LinkAddress, OpHandle) + Send + 'static,
    {
        self.post(Box::new(move |inner| {
            inner.bootstrap_listen(opts, Box::new(callback))
        }))
    }

    pub fn accept<F>(&self, handle: OpHandle, callback: F) -> SdkResponse
    where
        F: FnOnce(ApiStatus, OpHandle) + Send + 'static,
    {
        self.post(Box::new(move |inner| {
            inner.accept(handle, Box::new(callback))
        }))
    }

    pub fn read<F>(&self, handle: OpHandle, callback: F) -> SdkResponse
    where
        F: FnOnce(ApiStatus, Vec<u8>) + Send + 'static,
    {
        self.post(Box::new(move |inner| inner.read(handle, Box::new(callback))))
    }

    pub fn write<F>(&self, handle: OpHandle, bytes: Vec<u8>, callback: F) -> SdkResponse
    where
        F: FnOnce(ApiStatus) + Send + 'static,
    {
        self.post(Box::new(move |inner| {
            inner.write(handle, bytes, Box::new(callback))
        }))
    }

    pub fn close<F>(&self, handle: OpHandle, callback: F) -> SdkResponse
    where
        F: FnOnce(ApiStatus) + Send + 'static,
    {
        self.post(Box::new(move |inner| inner.close(handle, Box::new(callback))))
    }

    /// Requests that any pending blocking read on the operation be released.
    pub fn cancel(&self, handle: OpHandle) -> SdkResponse {
        self.post(Box::new(move |inner| inner.cancel(handle)))
    }
}

impl Drop for ApiManager {
    fn drop(&mut self) {
        self.handler.stop();
    }
}

// ----------------------------------------------
// Plugin-facing sink
// ----------------------------------------------

struct ManagerSink {
    poster: Poster<ManagerInner>,
}

impl ManagerSink {
    #[inline]
    fn post(&self, task: crate::handler::Task<ManagerInner>) -> SdkResponse {
        match self.poster.post(task) {
            true => SdkResponse::ok(),
            _ => SdkResponse::new(SdkStatus::Invalid),
        }
    }
}

impl EventSink for ManagerSink {
    fn on_channel_status_changed(
        &self,
        handle: OpHandle,
        channel_id: &ChannelId,
        status: ChannelStatus,
        props: ChannelProps,
    ) -> SdkResponse {
        let channel_id = channel_id.clone();
        self.post(Box::new(move |inner| {
            inner.on_channel_status_changed(handle, &channel_id, status, props)
        }))
    }

    fn on_link_status_changed(
        &self,
        handle: OpHandle,
        link_id: &LinkId,
        status: LinkStatus,
        props: LinkProps,
    ) -> SdkResponse {
        let link_id = link_id.clone();
        self.post(Box::new(move |inner| {
            inner.on_link_status_changed(handle, &link_id, status, props)
        }))
    }

    fn on_connection_status_changed(
        &self,
        handle: OpHandle,
        conn_id: &ConnId,
        status: ConnectionStatus,
        props: LinkProps,
    ) -> SdkResponse {
        let conn_id = conn_id.clone();
        self.post(Box::new(move |inner| {
            inner.on_connection_status_changed(handle, &conn_id, status, props)
        }))
    }

    fn on_package_status_changed(&self, handle: OpHandle, status: PackageStatus) -> SdkResponse {
        self.post(Box::new(move |inner| {
            inner.on_package_status_changed(handle, status)
        }))
    }

    fn receive_enc_pkg(&self, package: Vec<u8>, conn_ids: &[ConnId]) -> SdkResponse {
        let conn_ids = conn_ids.to_vec();
        self.post(Box::new(move |inner| {
            inner.receive_enc_pkg(package, &conn_ids)
        }))
    }
}

// ----------------------------------------------
// Worker-owned state
// ----------------------------------------------

/// All mutable core state. Lives on the worker thread; every method below
/// runs there, so nothing is locked.
pub struct ManagerInner {
    pub(crate) log: Logger,
    pub(crate) poster: Option<Poster<ManagerInner>>,
    handles: HandleSource,

    plugins: HashMap<ChannelId, PluginHandle>,
    pub(crate) channel_manager: ChannelManager,
    pub(crate) registry: Registry,
    contexts: HashMap<OpHandle, ApiContext>,

    // ChannelId -> last observed status and properties.
    activated_channels: HashMap<ChannelId, (ChannelStatus, ChannelProps)>,
    // (ChannelId, normalized address) -> (owning conn SM handle, conn id).
    reuse_table: HashMap<(ChannelId, String), (OpHandle, ConnId)>,
}

impl ManagerInner {
    fn new(plugins: Vec<PluginHandle>, log: Logger) -> ManagerInner {
        let channel_manager = ChannelManager::new(&plugins, log.clone());
        let plugins = plugins
            .into_iter()
            .map(|registration| (registration.channel_id.clone(), registration))
            .collect();

        ManagerInner {
            log,
            poster: None,
            handles: HandleSource::new(),
            plugins,
            channel_manager,
            registry: Registry::new(),
            contexts: HashMap::new(),
            activated_channels: HashMap::new(),
            reuse_table: HashMap::new(),
        }
    }

    #[inline]
    pub(crate) fn next_handle(&self) -> OpHandle {
        self.handles.next()
    }

    #[inline]
    pub(crate) fn random_package_id(&self) -> PackageId {
        PackageId::random(&mut rand::thread_rng())
    }

    #[inline]
    pub(crate) fn plugin(&self, channel_id: &ChannelId) -> Option<Arc<dyn ChannelPlugin>> {
        self.plugins
            .get(channel_id)
            .map(|registration| registration.plugin.clone())
    }

    #[inline]
    pub(crate) fn creates_links(&self, channel_id: &ChannelId, role: &str, sending: bool) -> bool {
        self.channel_manager.creates_links(channel_id, role, sending)
    }

    #[inline]
    pub(crate) fn register_handle(&mut self, key: OpHandle, context: OpHandle) {
        self.registry.register_handle(key, context);
    }

    #[inline]
    pub(crate) fn register_id(&mut self, key: &str, context: OpHandle) {
        self.registry.register_id(key, context);
    }

    /// Registers interest in a package id and returns any packages that were
    /// buffered against it before the registration, prefix stripped.
    #[inline]
    pub(crate) fn register_package_id(
        &mut self,
        package_id: PackageId,
        conn_id: &ConnId,
        context: OpHandle,
    ) -> Vec<Vec<u8>> {
        self.registry.register_package_id(package_id, conn_id, context)
    }

    // ----------------------------------------------
    // API call task bodies
    // ----------------------------------------------

    fn send(&mut self, opts: SendOptions, data: Vec<u8>, callback: StatusCallback) {
        let handle = self.next_handle();
        let context = crate::machines::send::new_context(handle, opts, data, callback);
        self.start_context(ApiContext::Send(context));
    }

    fn send_receive(&mut self, opts: SendOptions, data: Vec<u8>, callback: BytesCallback) {
        let handle = self.next_handle();
        let context = crate::machines::send_receive::new_context(handle, opts, data, callback);
        self.start_context(ApiContext::SendReceive(context));
    }

    fn dial(&mut self, opts: SendOptions, data: Vec<u8>, callback: HandleCallback) {
        let handle = self.next_handle();
        let context = crate::machines::dial::new_context(handle, opts, data, callback);
        self.start_context(ApiContext::Dial(context));
    }

    fn resume(&mut self, opts: ResumeOptions, callback: HandleCallback) {
        let handle = self.next_handle();
        let context = crate::machines::resume::new_context(handle, opts, callback);
        self.start_context(ApiContext::Resume(context));
    }

    fn bootstrap_dial(&mut self, opts: BootstrapOptions, data: Vec<u8>, callback: HandleCallback) {
        let handle = self.next_handle();
        let context = crate::machines::bootstrap_dial::new_context(handle, opts, data, callback);
        self.start_context(ApiContext::BootstrapDial(context));
    }

    fn get_receiver(&mut self, opts: ReceiveOptions, callback: ReceiverCallback) {
        let handle = self.next_handle();
        let context = crate::machines::recv::new_context(handle, opts, callback);
        self.start_context(ApiContext::Recv(context));
    }

    fn receive(&mut self, handle: OpHandle, callback: BytesCallback) {
        // Request fulfilled by a package arrival; may be posted before or
        // after the package itself.
        let contexts = self.registry.contexts_for_handle(handle);
        if contexts.len() != 1 {
            error!(self.log, "invalid handle passed to receive";
                   "context" => "receive", "handle" => handle);
            callback(ApiStatus::InternalError, Vec::new());
            return;
        }

        let context_handle = contexts[0];
        match self.contexts.get_mut(&context_handle) {
            Some(ApiContext::Recv(ctx)) => {
                if let Some(stale) = ctx.read_callback.take() {
                    error!(self.log, "read callback already pending";
                           "context" => "receive", "handle" => handle);
                    stale(ApiStatus::InternalError, Vec::new());
                }
                ctx.read_callback = Some(callback);
                self.trigger_event(context_handle, ApiEvent::ReceiveRequest);
            }
            _ => {
                error!(self.log, "handle does not name a receiver";
                       "context" => "receive", "handle" => handle);
                callback(ApiStatus::InternalError, Vec::new());
            }
        }
    }

    fn receive_respond(&mut self, handle: OpHandle, callback: RespondCallback) {
        let contexts = self.registry.contexts_for_handle(handle);
        if contexts.len() != 1 {
            error!(self.log, "invalid handle passed to receive_respond";
                   "context" => "receive_respond", "handle" => handle);
            callback(ApiStatus::InternalError, Vec::new(), String::new(), String::new());
            return;
        }

        let context_handle = contexts[0];
        let (send_channel, multi_channel) = match self.contexts.get(&context_handle) {
            Some(ApiContext::Recv(ctx)) => (ctx.opts.send_channel.clone(), ctx.opts.multi_channel),
            _ => {
                error!(self.log, "handle does not name a receiver";
                       "context" => "receive_respond", "handle" => handle);
                callback(ApiStatus::InternalError, Vec::new(), String::new(), String::new());
                return;
            }
        };

        let log = self.log.clone();
        let wrapped: BytesCallback = Box::new(move |status, data| {
            if status != ApiStatus::Ok {
                callback(status, Vec::new(), String::new(), String::new());
                return;
            }

            match crate::machines::recv::parse_respond_envelope(&data, &send_channel, multi_channel)
            {
                Ok((message, reply_address, package_id)) => {
                    callback(ApiStatus::Ok, message, reply_address, package_id)
                }
                Err(status) => {
                    error!(log, "failed to process received message";
                           "context" => "receive_respond");
                    callback(status, Vec::new(), String::new(), String::new());
                }
            }
        });

        if let Some(ApiContext::Recv(ctx)) = self.contexts.get_mut(&context_handle) {
            if let Some(stale) = ctx.read_callback.take() {
                stale(ApiStatus::InternalError, Vec::new());
            }
            ctx.read_callback = Some(wrapped);
        }
        self.trigger_event(context_handle, ApiEvent::ReceiveRequest);
    }

    fn listen(&mut self, opts: ReceiveOptions, callback: ReceiverCallback) {
        let handle = self.next_handle();
        let context = crate::machines::listen::new_context(handle, opts, callback);
        self.start_context(ApiContext::Listen(context));
    }

    fn bootstrap_listen(&mut self, opts: BootstrapOptions, callback: ReceiverCallback) {
        let handle = self.next_handle();
        let context = crate::machines::bootstrap_listen::new_context(handle, opts, callback);
        self.start_context(ApiContext::BootstrapListen(context));
    }

    fn accept(&mut self, handle: OpHandle, callback: HandleCallback) {
        let contexts = self.registry.contexts_for_handle(handle);
        if contexts.len() != 1 {
            error!(self.log, "invalid handle passed to accept";
                   "context" => "accept", "handle" => handle);
            callback(ApiStatus::InternalError, NULL_OP_HANDLE);
            return;
        }

        let context_handle = contexts[0];
        match self.contexts.get_mut(&context_handle) {
            Some(ApiContext::Listen(ctx)) => {
                if let Some(stale) = ctx.accept_callback.replace(callback) {
                    stale(ApiStatus::InternalError, NULL_OP_HANDLE);
                }
            }
            Some(ApiContext::BootstrapListen(ctx)) => {
                if let Some(stale) = ctx.accept_callback.replace(callback) {
                    stale(ApiStatus::InternalError, NULL_OP_HANDLE);
                }
            }
            _ => {
                error!(self.log, "handle does not name a listener";
                       "context" => "accept", "handle" => handle);
                callback(ApiStatus::InternalError, NULL_OP_HANDLE);
                return;
            }
        }
        self.trigger_event(context_handle, ApiEvent::Accept);
    }

    fn read(&mut self, handle: OpHandle, callback: BytesCallback) {
        let contexts = self.registry.contexts_for_handle(handle);
        if contexts.len() != 1 {
            error!(self.log, "invalid handle passed to read";
                   "context" => "read", "handle" => handle);
            callback(ApiStatus::InternalError, Vec::new());
            return;
        }

        let context_handle = contexts[0];
        match self.contexts.get_mut(&context_handle) {
            Some(ApiContext::Conduit(ctx)) => {
                if let Some(stale) = ctx.read_callback.take() {
                    error!(self.log, "read callback already pending";
                           "context" => "read", "handle" => handle);
                    stale(ApiStatus::InternalError, Vec::new());
                }
                ctx.read_callback = Some(callback);
                self.trigger_event(context_handle, ApiEvent::Read);
            }
            _ => {
                error!(self.log, "handle does not name a conduit";
                       "context" => "read", "handle" => handle);
                callback(ApiStatus::InternalError, Vec::new());
            }
        }
    }

    fn write(&mut self, handle: OpHandle, bytes: Vec<u8>, callback: StatusCallback) {
        let contexts = self.registry.contexts_for_handle(handle);
        if contexts.len() != 1 {
            error!(self.log, "invalid handle passed to write";
                   "context" => "write", "handle" => handle);
            callback(ApiStatus::InternalError);
            return;
        }

        let context_handle = contexts[0];
        match self.contexts.get_mut(&context_handle) {
            Some(ApiContext::Conduit(ctx)) => {
                ctx.send_queue.push_back((callback, bytes));
                self.trigger_event(context_handle, ApiEvent::Write);
            }
            _ => {
                error!(self.log, "handle does not name a conduit";
                       "context" => "write", "handle" => handle);
                callback(ApiStatus::InternalError);
            }
        }
    }

    fn close(&mut self, handle: OpHandle, callback: StatusCallback) {
        let contexts = self.registry.contexts_for_handle(handle);
        if contexts.len() != 1 {
            error!(self.log, "invalid handle passed to close";
                   "context" => "close", "handle" => handle);
            callback(ApiStatus::InternalError);
            return;
        }

        let context_handle = contexts[0];
        let accepted = match self.contexts.get_mut(&context_handle) {
            Some(ApiContext::Conduit(ctx)) => {
                ctx.close_callback = Some(callback);
                true
            }
            Some(ApiContext::Recv(ctx)) => {
                ctx.close_callback = Some(callback);
                true
            }
            Some(ApiContext::Listen(ctx)) => {
                ctx.close_callback = Some(callback);
                true
            }
            Some(ApiContext::BootstrapListen(ctx)) => {
                ctx.close_callback = Some(callback);
                true
            }
            _ => {
                error!(self.log, "handle does not name a closeable operation";
                       "context" => "close", "handle" => handle);
                callback(ApiStatus::InternalError);
                false
            }
        };

        if accepted {
            self.trigger_event(context_handle, ApiEvent::Close);
        }
    }

    fn cancel(&mut self, handle: OpHandle) {
        let contexts = self.registry.contexts_for_handle(handle);
        if contexts.len() != 1 {
            debug!(self.log, "cancel for unknown handle";
                   "context" => "cancel", "handle" => handle);
        }

        for context_handle in contexts {
            if let Some(context) = self.contexts.get_mut(&context_handle) {
                context.update_cancelled();
            }
            self.trigger_event(context_handle, ApiEvent::Cancelled);
        }
    }

    fn shutdown(&mut self) {
        let handles: Vec<OpHandle> = self.contexts.keys().copied().collect();

        for handle in handles {
            if let Some(mut context) = self.contexts.remove(&handle) {
                crate::machines::drain_callbacks(&mut context, ApiStatus::Closing);
            }
            self.registry.remove_context(handle);
        }
        self.reuse_table.clear();
    }

    // ----------------------------------------------
    // State machine services
    // ----------------------------------------------

    /// Consults the activated-channel table before delegating to the
    /// channel manager, so re-activation with the same role is answered
    /// from memory (through the worker queue, preserving event order).
    pub(crate) fn activate_channel(
        &mut self,
        context_handle: OpHandle,
        call_handle: OpHandle,
        channel_id: &ChannelId,
        role: &str,
    ) -> ActivateChannelStatusCode {
        if let Some((status, props)) = self.activated_channels.get(channel_id) {
            if props.role != role {
                return ActivateChannelStatusCode::ActivatedWithDifferentRole;
            }

            let status = *status;
            let props = props.clone();
            let channel_id = channel_id.clone();
            let posted = self.post_internal(Box::new(move |inner| {
                inner.on_channel_status_changed_for_context(
                    context_handle,
                    call_handle,
                    &channel_id,
                    status,
                    props,
                )
            }));

            return match posted {
                true => ActivateChannelStatusCode::AlreadyActivated,
                _ => ActivateChannelStatusCode::InvalidState,
            };
        }

        let registration = self.plugins.get(channel_id).cloned();
        self.channel_manager
            .activate_channel(call_handle, channel_id, role, registration.as_ref())
    }

    /// Starts a connection state machine, or reuses an open connection when
    /// one already exists for the caller-specified address.
    pub(crate) fn start_conn_state_machine(
        &mut self,
        parent: OpHandle,
        channel_id: &ChannelId,
        role: &str,
        link_address: &LinkAddress,
        creating: bool,
        sending: bool,
    ) -> OpHandle {
        if !link_address.is_empty() && !creating {
            let key = (channel_id.clone(), normalize_address(link_address));
            if let Some((sm_handle, conn_id)) = self.reuse_table.get(&key).cloned() {
                debug!(self.log, "reusing open connection";
                       "context" => "start_conn_state_machine",
                       "channel_id" => %channel_id,
                       "conn_id" => %conn_id);

                let call_handle = self.next_handle();
                let link_address = link_address.clone();
                self.post_internal(Box::new(move |inner| {
                    inner.on_conn_sm_connected_for_context(
                        parent,
                        call_handle,
                        sm_handle,
                        &conn_id,
                        &link_address,
                    )
                }));
                return sm_handle;
            }
        }

        let handle = self.next_handle();
        let context = ConnContext::new(
            handle,
            parent,
            channel_id,
            role,
            link_address,
            creating,
            sending,
        );

        match self.start_context(ApiContext::Conn(context)) {
            EventResult::Success => handle,
            _ => NULL_OP_HANDLE,
        }
    }

    pub(crate) fn start_conduit_state_machine(
        &mut self,
        _parent: OpHandle,
        recv_sm_handle: OpHandle,
        recv_conn_id: &ConnId,
        send_sm_handle: OpHandle,
        send_conn_id: &ConnId,
        send_channel: &ChannelId,
        recv_channel: &ChannelId,
        package_id: PackageId,
        recv_messages: Vec<Vec<u8>>,
        api_handle: OpHandle,
    ) -> OpHandle {
        let handle = self.next_handle();
        let context = ConduitContext {
            base: crate::context::ContextBase::new(handle),
            state: crate::machines::conduit::ConduitState::Initial,
            api_handle,
            send_sm_handle,
            send_conn_id: send_conn_id.clone(),
            recv_sm_handle,
            recv_conn_id: recv_conn_id.clone(),
            send_channel: send_channel.clone(),
            recv_channel: recv_channel.clone(),
            package_id,
            send_queue: Default::default(),
            sent_map: Default::default(),
            sent_list: Vec::new(),
            failed_list: Vec::new(),
            recv_queue: recv_messages.into(),
            read_callback: None,
            close_callback: None,
        };

        if self.start_context(ApiContext::Conduit(context)) != EventResult::Success {
            error!(self.log, "conduit state machine failed to start";
                   "context" => "start_conduit_state_machine");
            return NULL_OP_HANDLE;
        }

        self.add_dependent(recv_sm_handle, handle);
        self.add_dependent(send_sm_handle, handle);
        handle
    }

    pub(crate) fn start_pre_conduit_state_machine(
        &mut self,
        listen_handle: OpHandle,
        recv_sm_handle: OpHandle,
        recv_conn_id: &ConnId,
        recv_channel: &ChannelId,
        send_channel: &ChannelId,
        send_role: &str,
        send_link_address: &LinkAddress,
        package_id: PackageId,
        recv_messages: Vec<Vec<u8>>,
    ) -> OpHandle {
        debug!(self.log, "starting pre-conduit";
               "context" => "start_pre_conduit_state_machine",
               "listen_handle" => listen_handle);

        let handle = self.next_handle();
        let context = PreConduitContext {
            base: crate::context::ContextBase::new(handle),
            state: crate::machines::pre_conduit::PreConduitState::Initial,
            listen_handle,
            recv_sm_handle,
            recv_conn_id: recv_conn_id.clone(),
            recv_channel: recv_channel.clone(),
            send_channel: send_channel.clone(),
            send_role: send_role.into(),
            send_link_address: send_link_address.clone(),
            package_id,
            recv_messages,
            accept_callback: None,
            send_sm_handle: NULL_OP_HANDLE,
            send_conn_id: None,
        };

        if self.start_context(ApiContext::PreConduit(context)) != EventResult::Success {
            return NULL_OP_HANDLE;
        }

        self.add_dependent(recv_sm_handle, handle);
        handle
    }

    pub(crate) fn start_bootstrap_pre_conduit_state_machine(
        &mut self,
        listen_handle: OpHandle,
        opts: BootstrapOptions,
        init_recv_sm_handle: OpHandle,
        init_recv_conn_id: &ConnId,
        package_id: PackageId,
        envelope: &BootstrapEnvelope,
        recv_messages: Vec<Vec<u8>>,
    ) -> OpHandle {
        debug!(self.log, "starting bootstrap pre-conduit";
               "context" => "start_bootstrap_pre_conduit_state_machine",
               "listen_handle" => listen_handle);

        let handle = self.next_handle();
        let context = BootstrapPreConduitContext {
            base: crate::context::ContextBase::new(handle),
            state: crate::machines::bootstrap_listen::BootstrapPreConduitState::Initial,
            listen_handle,
            opts,
            package_id,
            init_recv_conn_id: init_recv_conn_id.clone(),
            init_recv_sm_handle,
            init_send: Default::default(),
            final_send: Default::default(),
            final_recv: Default::default(),
            hello_init_send_address: envelope.init_send_link_address.clone(),
            hello_final_send_address: envelope.final_send_link_address.clone(),
            hello_final_recv_address: envelope.final_recv_link_address.clone(),
            response_needed: false,
            recv_messages,
            accept_callback: None,
        };

        if self.start_context(ApiContext::BootstrapPreConduit(context)) != EventResult::Success {
            return NULL_OP_HANDLE;
        }

        self.add_dependent(init_recv_sm_handle, handle);
        handle
    }

    /// Hands an accept callback to a waiting pre-conduit.
    pub(crate) fn listen_accept(&mut self, pre_handle: OpHandle, callback: HandleCallback) -> bool {
        match self.contexts.get_mut(&pre_handle) {
            Some(ApiContext::PreConduit(ctx)) => ctx.accept_callback = Some(callback),
            Some(ApiContext::BootstrapPreConduit(ctx)) => ctx.accept_callback = Some(callback),
            _ => {
                error!(self.log, "could not find pre-conduit for accept";
                       "context" => "listen_accept", "handle" => pre_handle);
                callback(ApiStatus::InternalError, NULL_OP_HANDLE);
                return false;
            }
        }

        self.trigger_event(pre_handle, ApiEvent::ListenAccepted);
        true
    }

    /// Folds `dependent` into the target's dependent set and registers the
    /// target for the dependent's terminal notification.
    pub(crate) fn add_dependent(&mut self, target: OpHandle, dependent: OpHandle) {
        let present = match self.contexts.get_mut(&target) {
            Some(context) => {
                context.update_dependent(dependent);
                true
            }
            None => false,
        };

        if present {
            self.registry.register_handle(dependent, target);
            self.trigger_event(target, ApiEvent::AddDependent);
        }
    }

    pub(crate) fn detach_conn_sm(&mut self, context_handle: OpHandle, sm_handle: OpHandle) -> bool {
        let present = match self.contexts.get_mut(&sm_handle) {
            Some(context) => {
                context.update_detach(context_handle);
                true
            }
            None => false,
        };

        if present {
            self.trigger_event(sm_handle, ApiEvent::DetachDependent);
        }
        present
    }

    pub(crate) fn record_reuse(
        &mut self,
        channel_id: &ChannelId,
        link_address: &LinkAddress,
        sm_handle: OpHandle,
        conn_id: &ConnId,
    ) -> (ChannelId, String) {
        let key = (channel_id.clone(), normalize_address(link_address));
        debug!(self.log, "recording reusable connection";
               "context" => "record_reuse",
               "channel_id" => %channel_id,
               "conn_id" => %conn_id);
        self.reuse_table
            .insert(key.clone(), (sm_handle, conn_id.clone()));
        key
    }

    pub(crate) fn remove_reuse(&mut self, key: &(ChannelId, String)) {
        self.reuse_table.remove(key);
    }

    /// Terminal notification from a machine; processed through the worker
    /// queue so in-flight events drain first.
    pub(crate) fn state_machine_finished(&mut self, context_handle: OpHandle) {
        self.post_internal(Box::new(move |inner| {
            inner.on_state_machine_finished(context_handle)
        }));
    }

    pub(crate) fn state_machine_failed(&mut self, context_handle: OpHandle) {
        self.post_internal(Box::new(move |inner| {
            inner.on_state_machine_failed(context_handle)
        }));
    }

    /// A connection machine reached its ready state; routed to every context
    /// registered against the machine's handle.
    pub(crate) fn conn_sm_connected(
        &mut self,
        sm_handle: OpHandle,
        conn_id: &ConnId,
        link_address: &LinkAddress,
    ) {
        let conn_id = conn_id.clone();
        let link_address = link_address.clone();
        self.post_internal(Box::new(move |inner| {
            inner.on_conn_sm_connected(sm_handle, &conn_id, &link_address)
        }));
    }

    #[inline]
    fn post_internal(&self, task: crate::handler::Task<ManagerInner>) -> bool {
        match &self.poster {
            Some(poster) => poster.post(task),
            None => false,
        }
    }

    // ----------------------------------------------
    // Internal callback task bodies
    // ----------------------------------------------

    fn on_state_machine_finished(&mut self, context_handle: OpHandle) {
        if self.contexts.remove(&context_handle).is_none() {
            return;
        }
        self.registry.remove_context(context_handle);

        for triggered in self.registry.contexts_for_handle(context_handle) {
            if let Some(context) = self.contexts.get_mut(&triggered) {
                context.update_state_machine_finished(context_handle);
            }
            self.trigger_event(triggered, ApiEvent::StateMachineFinished);
        }
    }

    fn on_state_machine_failed(&mut self, context_handle: OpHandle) {
        if self.contexts.remove(&context_handle).is_none() {
            return;
        }
        self.registry.remove_context(context_handle);

        for triggered in self.registry.contexts_for_handle(context_handle) {
            if let Some(context) = self.contexts.get_mut(&triggered) {
                context.update_state_machine_failed(context_handle);
            }
            self.trigger_event(triggered, ApiEvent::StateMachineFailed);
        }
    }

    fn on_conn_sm_connected(
        &mut self,
        sm_handle: OpHandle,
        conn_id: &ConnId,
        link_address: &LinkAddress,
    ) {
        for triggered in self.registry.contexts_for_handle(sm_handle) {
            if let Some(context) = self.contexts.get_mut(&triggered) {
                context.update_conn_sm_connected(sm_handle, conn_id, link_address);
            }
            self.trigger_event(triggered, ApiEvent::ConnSmConnected);
        }
    }

    /// Reuse-table hit: the caller is attached to the existing machine and
    /// told about the open connection.
    fn on_conn_sm_connected_for_context(
        &mut self,
        context_handle: OpHandle,
        _call_handle: OpHandle,
        sm_handle: OpHandle,
        conn_id: &ConnId,
        link_address: &LinkAddress,
    ) {
        if !self.contexts.contains_key(&context_handle) {
            error!(self.log, "could not find calling context";
                   "context" => "on_conn_sm_connected_for_context");
            return;
        }

        self.add_dependent(sm_handle, context_handle);

        if let Some(context) = self.contexts.get_mut(&context_handle) {
            context.update_conn_sm_connected(sm_handle, conn_id, link_address);
        }
        self.trigger_event(context_handle, ApiEvent::ConnSmConnected);
    }

    /// Channel already active: replay the cached status to one context.
    fn on_channel_status_changed_for_context(
        &mut self,
        context_handle: OpHandle,
        _call_handle: OpHandle,
        channel_id: &ChannelId,
        status: ChannelStatus,
        _props: ChannelProps,
    ) {
        let event = match status {
            ChannelStatus::Available => ApiEvent::ChannelActivated,
            _ => ApiEvent::Failed,
        };

        debug!(self.log, "replaying channel status";
               "context" => "on_channel_status_changed_for_context",
               "channel_id" => %channel_id,
               "status" => ?status);

        if self.contexts.contains_key(&context_handle) {
            self.trigger_event(context_handle, event);
        }
    }

    // ----------------------------------------------
    // Plugin callback task bodies
    // ----------------------------------------------

    fn on_channel_status_changed(
        &mut self,
        handle: OpHandle,
        channel_id: &ChannelId,
        status: ChannelStatus,
        props: ChannelProps,
    ) {
        debug!(self.log, "channel status changed";
               "context" => "on_channel_status_changed",
               "handle" => handle,
               "channel_id" => %channel_id,
               "status" => ?status);

        self.activated_channels
            .insert(channel_id.clone(), (status, props));
        self.channel_manager.on_channel_status_changed(channel_id, status);

        let event = match status {
            ChannelStatus::Available => ApiEvent::ChannelActivated,
            _ => ApiEvent::Failed,
        };

        for triggered in self.registry.contexts_for_union(handle, channel_id) {
            self.trigger_event(triggered, event);
        }
    }

    fn on_link_status_changed(
        &mut self,
        handle: OpHandle,
        link_id: &LinkId,
        status: LinkStatus,
        props: LinkProps,
    ) {
        debug!(self.log, "link status changed";
               "context" => "on_link_status_changed",
               "handle" => handle,
               "link_id" => %link_id,
               "status" => ?status);

        let event = match status {
            LinkStatus::Created | LinkStatus::Loaded => ApiEvent::LinkEstablished,
            LinkStatus::Destroyed => ApiEvent::LinkDestroyed,
            _ => ApiEvent::Failed,
        };

        for triggered in self.registry.contexts_for_union(handle, link_id) {
            if event == ApiEvent::LinkEstablished {
                if let Some(context) = self.contexts.get_mut(&triggered) {
                    context.update_link_status_changed(link_id, &props.link_address);
                }
            }
            self.trigger_event(triggered, event);
        }
    }

    fn on_connection_status_changed(
        &mut self,
        handle: OpHandle,
        conn_id: &ConnId,
        status: ConnectionStatus,
        _props: LinkProps,
    ) {
        debug!(self.log, "connection status changed";
               "context" => "on_connection_status_changed",
               "handle" => handle,
               "conn_id" => %conn_id,
               "status" => ?status);

        let event = match status {
            ConnectionStatus::Open => ApiEvent::ConnectionEstablished,
            ConnectionStatus::Closed => ApiEvent::ConnectionDestroyed,
            _ => ApiEvent::Failed,
        };

        for triggered in self.registry.contexts_for_union(handle, conn_id) {
            if let Some(context) = self.contexts.get_mut(&triggered) {
                context.update_connection_status_changed(
                    conn_id,
                    event == ApiEvent::ConnectionEstablished,
                );
            }
            self.trigger_event(triggered, event);
        }
    }

    fn on_package_status_changed(&mut self, handle: OpHandle, status: PackageStatus) {
        debug!(self.log, "package status changed";
               "context" => "on_package_status_changed",
               "handle" => handle,
               "status" => ?status);

        let event = match status {
            PackageStatus::Sent => ApiEvent::PackageSent,
            PackageStatus::Received => ApiEvent::PackageReceived,
            PackageStatus::FailedGeneric
            | PackageStatus::FailedNetworkError
            | PackageStatus::FailedTimeout => ApiEvent::PackageFailed,
            _ => ApiEvent::Failed,
        };

        for triggered in self.registry.contexts_for_handle(handle) {
            if let Some(context) = self.contexts.get_mut(&triggered) {
                context.update_package_status_changed(handle, status);
            }
            self.trigger_event(triggered, event);
        }
    }

    fn receive_enc_pkg(&mut self, package: Vec<u8>, conn_ids: &[ConnId]) {
        if conn_ids.is_empty() {
            error!(self.log, "no connection ids"; "context" => "receive_enc_pkg");
            return;
        } else if conn_ids.len() > 1 {
            error!(self.log, "too many connection ids"; "context" => "receive_enc_pkg");
            return;
        }

        let conn_id = &conn_ids[0];
        let mut deliveries: Vec<(OpHandle, Vec<u8>)> = Vec::new();

        match PackageId::from_prefix(&package) {
            Some(package_id) => {
                let contexts = self.registry.contexts_for_package(package_id, conn_id);
                if !contexts.is_empty() {
                    debug!(self.log, "package id matched";
                           "context" => "receive_enc_pkg",
                           "package_id" => %package_id,
                           "conn_id" => %conn_id);

                    let payload = package[PACKAGE_ID_LEN..].to_vec();
                    for context in contexts {
                        deliveries.push((context, payload.clone()));
                    }
                } else {
                    // Buffer for a package id that may be registered later;
                    // contexts listening on the bare connection still see
                    // the full prefixed bytes. The zero tag frames hellos
                    // and is never registered, so it is not buffered.
                    debug!(self.log, "package id not yet registered";
                           "context" => "receive_enc_pkg",
                           "package_id" => %package_id,
                           "conn_id" => %conn_id);

                    if package_id != PackageId::zero() {
                        self.registry.buffer_unassociated(package_id, package.clone());
                    }
                    for context in self.registry.contexts_for_id(conn_id) {
                        deliveries.push((context, package.clone()));
                    }
                }
            }
            None => {
                for context in self.registry.contexts_for_id(conn_id) {
                    deliveries.push((context, package.clone()));
                }
            }
        }

        if deliveries.is_empty() {
            warn!(self.log, "found no contexts for package";
                  "context" => "receive_enc_pkg", "conn_id" => %conn_id);
        }

        for (context_handle, payload) in deliveries {
            if let Some(context) = self.contexts.get_mut(&context_handle) {
                context.update_receive_enc_pkg(conn_id, payload);
            }
            self.trigger_event(context_handle, ApiEvent::ReceivePackage);
        }
    }

    // ----------------------------------------------
    // Context plumbing
    // ----------------------------------------------

    /// Runs a machine's initial state and parks the context in the arena.
    fn start_context(&mut self, mut context: ApiContext) -> EventResult {
        let handle = context.handle();
        let log = self.log.clone();

        debug!(log, "starting context";
               "context" => "start_context",
               "kind" => context.kind(),
               "handle" => handle);

        let result = match &mut context {
            ApiContext::Conn(ctx) => engine::start::<ConnMachine>(self, ctx, &log),
            ApiContext::Send(ctx) => engine::start::<SendMachine>(self, ctx, &log),
            ApiContext::Recv(ctx) => engine::start::<RecvMachine>(self, ctx, &log),
            ApiContext::SendReceive(ctx) => engine::start::<SendReceiveMachine>(self, ctx, &log),
            ApiContext::Dial(ctx) => engine::start::<DialMachine>(self, ctx, &log),
            ApiContext::Resume(ctx) => engine::start::<ResumeMachine>(self, ctx, &log),
            ApiContext::Listen(ctx) => engine::start::<ListenMachine>(self, ctx, &log),
            ApiContext::PreConduit(ctx) => engine::start::<PreConduitMachine>(self, ctx, &log),
            ApiContext::Conduit(ctx) => engine::start::<ConduitMachine>(self, ctx, &log),
            ApiContext::BootstrapDial(ctx) => {
                engine::start::<BootstrapDialMachine>(self, ctx, &log)
            }
            ApiContext::BootstrapListen(ctx) => {
                engine::start::<BootstrapListenMachine>(self, ctx, &log)
            }
            ApiContext::BootstrapPreConduit(ctx) => {
                engine::start::<BootstrapPreConduitMachine>(self, ctx, &log)
            }
        };

        self.contexts.insert(handle, context);
        result
    }

    /// Fires one event into one context. The context is detached from the
    /// arena for the duration so machine hooks can borrow the manager.
    pub(crate) fn trigger_event(&mut self, handle: OpHandle, event: ApiEvent) -> EventResult {
        let mut context = match self.contexts.remove(&handle) {
            Some(context) => context,
            None => return EventResult::NotSupported,
        };

        let log = self.log.clone();
        let result = match &mut context {
            ApiContext::Conn(ctx) => engine::handle_event::<ConnMachine>(self, ctx, event, &log),
            ApiContext::Send(ctx) => engine::handle_event::<SendMachine>(self, ctx, event, &log),
            ApiContext::Recv(ctx) => engine::handle_event::<RecvMachine>(self, ctx, event, &log),
            ApiContext::SendReceive(ctx) => {
                engine::handle_event::<SendReceiveMachine>(self, ctx, event, &log)
            }
            ApiContext::Dial(ctx) => engine::handle_event::<DialMachine>(self, ctx, event, &log),
            ApiContext::Resume(ctx) => {
                engine::handle_event::<ResumeMachine>(self, ctx, event, &log)
            }
            ApiContext::Listen(ctx) => {
                engine::handle_event::<ListenMachine>(self, ctx, event, &log)
            }
            ApiContext::PreConduit(ctx) => {
                engine::handle_event::<PreConduitMachine>(self, ctx, event, &log)
            }
            ApiContext::Conduit(ctx) => {
                engine::handle_event::<ConduitMachine>(self, ctx, event, &log)
            }
            ApiContext::BootstrapDial(ctx) => {
                engine::handle_event::<BootstrapDialMachine>(self, ctx, event, &log)
            }
            ApiContext::BootstrapListen(ctx) => {
                engine::handle_event::<BootstrapListenMachine>(self, ctx, event, &log)
            }
            ApiContext::BootstrapPreConduit(ctx) => {
                engine::handle_event::<BootstrapPreConduitMachine>(self, ctx, event, &log)
            }
        };

        self.contexts.insert(handle, context);

        if result != EventResult::Success {
            debug!(self.log, "event dispatch failed";
                   "context" => "trigger_event", "handle" => handle, "event" => ?event);
        }
        result
    }
}

/// Canonicalizes a link address so textually different but semantically
/// identical JSON addresses key the same reuse entry. Non-JSON addresses
/// are used verbatim.
pub(crate) fn normalize_address(address: &LinkAddress) -> String {
    match serde_json::from_str::<serde_json::Value>(address) {
        Ok(value) => value.to_string(),
        Err(_) => address.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_mgr::{ChannelRole, LinkSide};
    use crate::frame::{frame, parse_envelope, HelloEnvelope};
    use crate::support::LinkKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Eq, PartialEq)]
    enum PluginCall {
        ActivateChannel {
            handle: OpHandle,
            channel_id: ChannelId,
            role: String,
        },
        CreateLink {
            handle: OpHandle,
            channel_id: ChannelId,
        },
        LoadLinkAddress {
            handle: OpHandle,
            channel_id: ChannelId,
            address: LinkAddress,
        },
        OpenConnection {
            handle: OpHandle,
            link_id: LinkId,
            kind: LinkKind,
        },
        SendPackage {
            handle: OpHandle,
            conn_id: ConnId,
            package: Vec<u8>,
        },
        CloseConnection {
            handle: OpHandle,
            conn_id: ConnId,
        },
        DestroyLink {
            handle: OpHandle,
            link_id: LinkId,
        },
    }

    /// Records every request and answers with a scripted accept/reject;
    /// the tests drive the asynchronous outcomes through the event sink.
    #[derive(Default)]
    struct MockPlugin {
        calls: Mutex<Vec<PluginCall>>,
        rejected_ops: Mutex<Vec<&'static str>>,
    }

    impl MockPlugin {
        fn record(&self, op: &'static str, call: PluginCall) -> SdkResponse {
            self.calls.lock().unwrap().push(call);
            match self.rejected_ops.lock().unwrap().contains(&op) {
                true => SdkResponse::new(SdkStatus::InvalidArgument),
                _ => SdkResponse::ok(),
            }
        }
    }

    impl ChannelPlugin for MockPlugin {
        fn activate_channel(
            &self,
            handle: OpHandle,
            channel_id: &ChannelId,
            role: &str,
        ) -> SdkResponse {
            self.record(
                "activate_channel",
                PluginCall::ActivateChannel {
                    handle,
                    channel_id: channel_id.clone(),
                    role: role.into(),
                },
            )
        }

        fn create_link(&self, handle: OpHandle, channel_id: &ChannelId) -> SdkResponse {
            self.record(
                "create_link",
                PluginCall::CreateLink {
                    handle,
                    channel_id: channel_id.clone(),
                },
            )
        }

        fn load_link_address(
            &self,
            handle: OpHandle,
            channel_id: &ChannelId,
            address: &LinkAddress,
        ) -> SdkResponse {
            self.record(
                "load_link_address",
                PluginCall::LoadLinkAddress {
                    handle,
                    channel_id: channel_id.clone(),
                    address: address.clone(),
                },
            )
        }

        fn load_link_addresses(
            &self,
            _handle: OpHandle,
            _channel_id: &ChannelId,
            _addresses: &[LinkAddress],
        ) -> SdkResponse {
            SdkResponse::ok()
        }

        fn create_link_from_address(
            &self,
            _handle: OpHandle,
            _channel_id: &ChannelId,
            _address: &LinkAddress,
        ) -> SdkResponse {
            SdkResponse::ok()
        }

        fn create_bootstrap_link(
            &self,
            _handle: OpHandle,
            _channel_id: &ChannelId,
            _passphrase: &str,
        ) -> SdkResponse {
            SdkResponse::ok()
        }

        fn open_connection(
            &self,
            handle: OpHandle,
            kind: LinkKind,
            link_id: &LinkId,
            _hints: &str,
            _send_timeout: u64,
        ) -> SdkResponse {
            self.record(
                "open_connection",
                PluginCall::OpenConnection {
                    handle,
                    link_id: link_id.clone(),
                    kind,
                },
            )
        }

        fn send_package(
            &self,
            handle: OpHandle,
            conn_id: &ConnId,
            package: Vec<u8>,
            _deadline: f64,
            _batch_id: u64,
        ) -> SdkResponse {
            self.record(
                "send_package",
                PluginCall::SendPackage {
                    handle,
                    conn_id: conn_id.clone(),
                    package,
                },
            )
        }

        fn close_connection(&self, handle: OpHandle, conn_id: &ConnId) -> SdkResponse {
            self.record(
                "close_connection",
                PluginCall::CloseConnection {
                    handle,
                    conn_id: conn_id.clone(),
                },
            )
        }

        fn destroy_link(&self, handle: OpHandle, link_id: &LinkId) -> SdkResponse {
            self.record(
                "destroy_link",
                PluginCall::DestroyLink {
                    handle,
                    link_id: link_id.clone(),
                },
            )
        }

        fn deactivate_channel(&self, _handle: OpHandle, _channel_id: &ChannelId) -> SdkResponse {
            SdkResponse::ok()
        }
    }

    struct Harness {
        manager: ApiManager,
        sink: Arc<dyn EventSink>,
        plugin: Arc<MockPlugin>,
    }

    impl Harness {
        fn new(channels: &[(&str, &str, LinkSide)]) -> Harness {
            let plugin = Arc::new(MockPlugin::default());
            let registrations = channels
                .iter()
                .map(|(channel_id, role, side)| {
                    PluginHandle::new(
                        channel_id,
                        vec![ChannelRole::new(role, *side)],
                        plugin.clone(),
                    )
                })
                .collect();

            let manager = ApiManager::new(registrations, None);
            let sink = manager.event_sink();
            Harness {
                manager,
                sink,
                plugin,
            }
        }

        fn wait(&self) {
            self.manager.wait_for_callbacks();
        }

        fn calls(&self) -> Vec<PluginCall> {
            self.plugin.calls.lock().unwrap().clone()
        }

        fn reject(&self, op: &'static str) {
            self.plugin.rejected_ops.lock().unwrap().push(op);
        }

        fn count<F: Fn(&PluginCall) -> bool>(&self, predicate: F) -> usize {
            self.calls().iter().filter(|call| predicate(call)).count()
        }

        fn channel_available(&self, channel: &str, role: &str) {
            let handle = self
                .calls()
                .iter()
                .rev()
                .find_map(|call| match call {
                    PluginCall::ActivateChannel {
                        handle, channel_id, ..
                    } if channel_id == channel => Some(*handle),
                    _ => None,
                })
                .expect("no activate call for channel");

            self.sink.on_channel_status_changed(
                handle,
                &channel.to_string(),
                ChannelStatus::Available,
                ChannelProps { role: role.into() },
            );
            self.wait();
        }

        fn link_loaded(&self, channel: &str, link_id: &str, address: &str) {
            let handle = self
                .calls()
                .iter()
                .rev()
                .find_map(|call| match call {
                    PluginCall::LoadLinkAddress {
                        handle, channel_id, ..
                    } if channel_id == channel => Some(*handle),
                    _ => None,
                })
                .expect("no load call for channel");

            self.sink.on_link_status_changed(
                handle,
                &link_id.to_string(),
                LinkStatus::Loaded,
                LinkProps {
                    link_address: address.into(),
                },
            );
            self.wait();
        }

        fn link_created(&self, channel: &str, link_id: &str, address: &str) {
            let handle = self
                .calls()
                .iter()
                .rev()
                .find_map(|call| match call {
                    PluginCall::CreateLink {
                        handle, channel_id, ..
                    } if channel_id == channel => Some(*handle),
                    _ => None,
                })
                .expect("no create call for channel");

            self.sink.on_link_status_changed(
                handle,
                &link_id.to_string(),
                LinkStatus::Created,
                LinkProps {
                    link_address: address.into(),
                },
            );
            self.wait();
        }

        fn conn_open(&self, link: &str, conn_id: &str) {
            let handle = self
                .calls()
                .iter()
                .rev()
                .find_map(|call| match call {
                    PluginCall::OpenConnection {
                        handle, link_id, ..
                    } if link_id == link => Some(*handle),
                    _ => None,
                })
                .expect("no open call for link");

            self.sink.on_connection_status_changed(
                handle,
                &conn_id.to_string(),
                ConnectionStatus::Open,
                LinkProps::default(),
            );
            self.wait();
        }

        fn conn_closed(&self, conn: &str) {
            let handle = self
                .calls()
                .iter()
                .rev()
                .find_map(|call| match call {
                    PluginCall::CloseConnection { handle, conn_id } if conn_id == conn => {
                        Some(*handle)
                    }
                    _ => None,
                })
                .expect("no close call for connection");

            self.sink.on_connection_status_changed(
                handle,
                &conn.to_string(),
                ConnectionStatus::Closed,
                LinkProps::default(),
            );
            self.wait();
        }

        fn link_destroyed(&self, link: &str) {
            let handle = self
                .calls()
                .iter()
                .rev()
                .find_map(|call| match call {
                    PluginCall::DestroyLink { handle, link_id } if link_id == link => Some(*handle),
                    _ => None,
                })
                .expect("no destroy call for link");

            self.sink.on_link_status_changed(
                handle,
                &link.to_string(),
                LinkStatus::Destroyed,
                LinkProps::default(),
            );
            self.wait();
        }

        fn last_send_package(&self) -> (OpHandle, ConnId, Vec<u8>) {
            self.calls()
                .iter()
                .rev()
                .find_map(|call| match call {
                    PluginCall::SendPackage {
                        handle,
                        conn_id,
                        package,
                    } => Some((*handle, conn_id.clone(), package.clone())),
                    _ => None,
                })
                .expect("no send package call")
        }

        fn package_sent(&self, handle: OpHandle) {
            self.sink.on_package_status_changed(handle, PackageStatus::Sent);
            self.wait();
        }

        fn deliver(&self, package: Vec<u8>, conn_id: &str) {
            self.sink.receive_enc_pkg(package, &[conn_id.to_string()]);
            self.wait();
        }
    }

    fn send_receive_harness() -> Harness {
        Harness::new(&[
            ("sendChannel", "sendRole", LinkSide::Loader),
            ("recvChannel", "recvRole", LinkSide::Creator),
        ])
    }

    fn send_options() -> SendOptions {
        SendOptions {
            send_channel: "sendChannel".into(),
            send_role: "sendRole".into(),
            send_address: "sendAddress".into(),
            recv_channel: "recvChannel".into(),
            recv_role: "recvRole".into(),
            alt_channel: String::new(),
            timeout_ms: 0,
        }
    }

    fn test_bytes() -> (Vec<u8>, Vec<u8>) {
        let mut send_bytes = Vec::with_capacity(0x100);
        let mut recv_bytes = Vec::with_capacity(0x100);
        for byte in 0..=0xFFu8 {
            send_bytes.push(byte);
            recv_bytes.push(0xFF - byte);
        }
        (send_bytes, recv_bytes)
    }

    type SharedResult<T> = Arc<Mutex<Option<T>>>;

    fn capture<T: Send + 'static>() -> (SharedResult<T>, impl FnOnce(T) + Send + 'static) {
        let slot: SharedResult<T> = Arc::new(Mutex::new(None));
        let writer = slot.clone();
        (slot, move |value: T| {
            *writer.lock().unwrap() = Some(value);
        })
    }

    /// Drives a send-receive through both connection state machines up to
    /// the point where the hello package is on the wire.
    fn drive_send_receive_connections(harness: &Harness) {
        harness.channel_available("sendChannel", "sendRole");
        harness.channel_available("recvChannel", "recvRole");
        harness.link_loaded("sendChannel", "sendLinkId", "sendAddress");
        harness.link_created("recvChannel", "recvLinkId", "recvLinkAddr");
        harness.conn_open("sendLinkId", "sendConnId");
        harness.conn_open("recvLinkId", "recvConnId");
    }

    #[test]
    fn test_send_receive_no_errors() {
        let harness = send_receive_harness();
        let (send_bytes, recv_bytes) = test_bytes();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = fired.clone();
        let (result, store) = capture::<(ApiStatus, Vec<u8>)>();
        let response = harness
            .manager
            .send_receive(send_options(), send_bytes.clone(), move |status, bytes| {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
                store((status, bytes));
            });
        assert!(response.is_ok());
        harness.wait();
        assert_eq!(harness.manager.stats().contexts, 3);

        drive_send_receive_connections(&harness);

        let (pkg_handle, conn_id, package) = harness.last_send_package();
        assert_eq!(conn_id, "sendConnId");
        assert!(package[..crate::PACKAGE_ID_LEN].iter().all(|byte| *byte == 0));

        let hello: HelloEnvelope = parse_envelope(&package[crate::PACKAGE_ID_LEN..]).unwrap();
        assert_eq!(hello.link_address, "recvLinkAddr");
        assert_eq!(hello.reply_channel, "recvChannel");
        assert_eq!(hello.message_bytes().unwrap(), send_bytes);
        let package_id = hello.package_id().unwrap();

        harness.package_sent(pkg_handle);
        harness.deliver(frame(package_id, &recv_bytes), "recvConnId");

        let (status, bytes) = result.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_eq!(bytes, recv_bytes);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // The created receive side tears itself down; the loaded send side
        // stays open for reuse until shutdown.
        harness.conn_closed("recvConnId");
        harness.link_destroyed("recvLinkId");
        assert_eq!(harness.manager.stats().contexts, 1);
        assert_eq!(
            harness.count(|call| matches!(call, PluginCall::CloseConnection { conn_id, .. } if conn_id == "sendConnId")),
            0
        );

        harness.manager.shutdown();
        let stats = harness.manager.stats();
        assert_eq!(stats.contexts, 0);
        assert_eq!(stats.handle_entries, 0);
        assert_eq!(stats.id_entries, 0);
        assert_eq!(stats.package_entries, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_receive_second_call_reuses_connection() {
        let harness = send_receive_harness();
        let (send_bytes, recv_bytes) = test_bytes();

        let (result, store) = capture::<(ApiStatus, Vec<u8>)>();
        harness
            .manager
            .send_receive(send_options(), send_bytes.clone(), move |status, bytes| {
                store((status, bytes));
            });
        harness.wait();

        drive_send_receive_connections(&harness);
        let (pkg_handle, _, package) = harness.last_send_package();
        let hello: HelloEnvelope = parse_envelope(&package[crate::PACKAGE_ID_LEN..]).unwrap();
        harness.package_sent(pkg_handle);
        harness.deliver(
            frame(hello.package_id().unwrap(), &recv_bytes),
            "recvConnId",
        );
        harness.conn_closed("recvConnId");
        harness.link_destroyed("recvLinkId");

        assert_eq!(result.lock().unwrap().take().unwrap().0, ApiStatus::Ok);
        assert_eq!(
            harness.count(|call| matches!(call, PluginCall::LoadLinkAddress { .. })),
            1
        );

        // Second operation against the same send address: the open send
        // connection is reused, so no further activation or link load
        // happens on the send side.
        let (result, store) = capture::<(ApiStatus, Vec<u8>)>();
        harness
            .manager
            .send_receive(send_options(), send_bytes.clone(), move |status, bytes| {
                store((status, bytes));
            });
        harness.wait();

        harness.link_created("recvChannel", "recvLinkId2", "recvLinkAddr2");
        harness.conn_open("recvLinkId2", "recvConnId2");

        let (pkg_handle, conn_id, package) = harness.last_send_package();
        assert_eq!(conn_id, "sendConnId");
        let hello: HelloEnvelope = parse_envelope(&package[crate::PACKAGE_ID_LEN..]).unwrap();
        assert_eq!(hello.link_address, "recvLinkAddr2");

        harness.package_sent(pkg_handle);
        harness.deliver(
            frame(hello.package_id().unwrap(), &recv_bytes),
            "recvConnId2",
        );

        let (status, bytes) = result.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_eq!(bytes, recv_bytes);

        assert_eq!(
            harness.count(|call| matches!(call, PluginCall::LoadLinkAddress { .. })),
            1
        );
        assert_eq!(
            harness.count(|call| matches!(call, PluginCall::ActivateChannel { .. })),
            2
        );
    }

    #[test]
    fn test_send_receive_empty_send_address() {
        let harness = send_receive_harness();

        let mut opts = send_options();
        opts.send_address = String::new();

        let (result, store) = capture::<ApiStatus>();
        harness
            .manager
            .send_receive(opts, vec![1, 2, 3], move |status, _| store(status));
        harness.wait();

        assert_eq!(result.lock().unwrap().take().unwrap(), ApiStatus::InvalidArgument);
        assert!(harness.calls().is_empty());
        assert_eq!(harness.manager.stats().contexts, 0);
        assert_eq!(harness.manager.stats().handle_entries, 0);
    }

    #[test]
    fn test_send_receive_validation_statuses() {
        let harness = send_receive_harness();

        for (field, expected) in [
            ("send_channel", ApiStatus::ChannelInvalid),
            ("recv_channel", ApiStatus::ChannelInvalid),
            ("send_role", ApiStatus::InvalidArgument),
            ("recv_role", ApiStatus::InvalidArgument),
        ]
        .iter()
        {
            let mut opts = send_options();
            match *field {
                "send_channel" => opts.send_channel = String::new(),
                "recv_channel" => opts.recv_channel = String::new(),
                "send_role" => opts.send_role = String::new(),
                _ => opts.recv_role = String::new(),
            }

            let (result, store) = capture::<ApiStatus>();
            harness
                .manager
                .send_receive(opts, Vec::new(), move |status, _| store(status));
            harness.wait();

            assert_eq!(result.lock().unwrap().take().unwrap(), *expected);
        }

        assert_eq!(harness.manager.stats().contexts, 0);
    }

    #[test]
    fn test_send_receive_activation_rejected() {
        let harness = send_receive_harness();

        let mut opts = send_options();
        opts.send_role = "bogusRole".into();

        let (result, store) = capture::<ApiStatus>();
        harness
            .manager
            .send_receive(opts, Vec::new(), move |status, _| store(status));
        harness.wait();

        assert_eq!(result.lock().unwrap().take().unwrap(), ApiStatus::InternalError);
        let stats = harness.manager.stats();
        assert_eq!(stats.contexts, 0);
        assert_eq!(stats.handle_entries, 0);
        assert_eq!(stats.id_entries, 0);
    }

    #[test]
    fn test_send_receive_create_link_rejected() {
        let harness = send_receive_harness();
        harness.reject("create_link");

        let (result, store) = capture::<ApiStatus>();
        harness
            .manager
            .send_receive(send_options(), Vec::new(), move |status, _| store(status));
        harness.wait();

        harness.channel_available("sendChannel", "sendRole");
        harness.channel_available("recvChannel", "recvRole");

        assert_eq!(result.lock().unwrap().take().unwrap(), ApiStatus::InternalError);
        let stats = harness.manager.stats();
        assert_eq!(stats.contexts, 0);
        assert_eq!(stats.handle_entries, 0);
    }

    #[test]
    fn test_send_receive_link_destroyed_fails() {
        let harness = send_receive_harness();

        let (result, store) = capture::<ApiStatus>();
        harness
            .manager
            .send_receive(send_options(), Vec::new(), move |status, _| store(status));
        harness.wait();

        harness.channel_available("sendChannel", "sendRole");
        harness.channel_available("recvChannel", "recvRole");
        harness.link_loaded("sendChannel", "sendLinkId", "sendAddress");

        // The created link is reported destroyed instead of created.
        let handle = harness
            .calls()
            .iter()
            .rev()
            .find_map(|call| match call {
                PluginCall::CreateLink { handle, .. } => Some(*handle),
                _ => None,
            })
            .unwrap();
        harness.sink.on_link_status_changed(
            handle,
            &"recvLinkId".to_string(),
            LinkStatus::Destroyed,
            LinkProps::default(),
        );
        harness.wait();

        assert_eq!(result.lock().unwrap().take().unwrap(), ApiStatus::InternalError);
        assert_eq!(harness.manager.stats().contexts, 0);
    }

    #[test]
    fn test_dial_buffered_response_and_conduit_close() {
        let harness = send_receive_harness();
        let (send_bytes, recv_bytes) = test_bytes();

        let (dialed, store) = capture::<(ApiStatus, OpHandle)>();
        harness
            .manager
            .dial(send_options(), send_bytes, move |status, handle| {
                store((status, handle));
            });
        harness.wait();

        drive_send_receive_connections(&harness);

        let (pkg_handle, _, package) = harness.last_send_package();
        let hello: HelloEnvelope = parse_envelope(&package[crate::PACKAGE_ID_LEN..]).unwrap();
        let package_id = hello.package_id().unwrap();

        // The response lands before the conduit exists; it must be buffered
        // and drained into the conduit exactly once.
        harness.deliver(frame(package_id, &recv_bytes), "recvConnId");
        harness.package_sent(pkg_handle);

        let (status, conduit_handle) = dialed.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_ne!(conduit_handle, NULL_OP_HANDLE);

        let (read, store) = capture::<(ApiStatus, Vec<u8>)>();
        harness.manager.read(conduit_handle, move |status, bytes| {
            store((status, bytes));
        });
        harness.wait();

        let (status, bytes) = read.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_eq!(bytes, recv_bytes);

        // Two writes go out tagged with the package id.
        let (write1, store1) = capture::<ApiStatus>();
        harness
            .manager
            .write(conduit_handle, b"first".to_vec(), move |status| store1(status));
        harness.wait();
        let (write1_handle, write1_conn, write1_package) = harness.last_send_package();
        assert_eq!(write1_conn, "sendConnId");
        assert_eq!(&write1_package[..crate::PACKAGE_ID_LEN], package_id.as_bytes());
        assert_eq!(&write1_package[crate::PACKAGE_ID_LEN..], b"first");

        let (write2, store2) = capture::<ApiStatus>();
        harness
            .manager
            .write(conduit_handle, b"second".to_vec(), move |status| store2(status));
        harness.wait();
        let (write2_handle, _, _) = harness.last_send_package();

        // Close while both writes await their outcome: the writes fail, the
        // close succeeds, and late outcomes are dropped silently.
        let (closed, store) = capture::<ApiStatus>();
        harness
            .manager
            .close(conduit_handle, move |status| store(status));
        harness.wait();

        assert_eq!(write1.lock().unwrap().take().unwrap(), ApiStatus::InternalError);
        assert_eq!(write2.lock().unwrap().take().unwrap(), ApiStatus::InternalError);
        assert_eq!(closed.lock().unwrap().take().unwrap(), ApiStatus::Ok);

        harness.sink.on_package_status_changed(write1_handle, PackageStatus::Sent);
        harness.sink.on_package_status_changed(write2_handle, PackageStatus::Sent);
        harness.wait();

        // The created receive side shuts down once the conduit is gone.
        harness.conn_closed("recvConnId");
        harness.link_destroyed("recvLinkId");

        harness.manager.shutdown();
        assert_eq!(harness.manager.stats().contexts, 0);
    }

    #[test]
    fn test_listen_accept_upgrades_oldest_hello() {
        let harness = Harness::new(&[
            ("sendChannel", "sendRole", LinkSide::Loader),
            ("recvChannel", "recvRole", LinkSide::Creator),
        ]);

        let opts = ReceiveOptions {
            recv_channel: "recvChannel".into(),
            recv_role: "recvRole".into(),
            send_channel: "sendChannel".into(),
            send_role: "sendRole".into(),
            alt_channel: String::new(),
            multi_channel: false,
            timeout_ms: 0,
        };

        let (listening, store) = capture::<(ApiStatus, LinkAddress, OpHandle)>();
        harness.manager.listen(opts, move |status, address, handle| {
            store((status, address, handle));
        });
        harness.wait();

        harness.channel_available("recvChannel", "recvRole");
        harness.link_created("recvChannel", "listenLinkId", "listenAddr");
        harness.conn_open("listenLinkId", "listenConnId");

        let (status, address, listen_handle) = listening.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_eq!(address, "listenAddr");

        // A dialer's hello arrives on the listening connection.
        let package_id = PackageId::new([7; crate::PACKAGE_ID_LEN]);
        let hello = HelloEnvelope::new(package_id, "dialerRecvAddr", "sendChannel", b"hi");
        harness.deliver(
            crate::frame::frame_envelope(PackageId::zero(), &hello),
            "listenConnId",
        );

        let (accepted, store) = capture::<(ApiStatus, OpHandle)>();
        harness.manager.accept(listen_handle, move |status, handle| {
            store((status, handle));
        });
        harness.wait();

        // The upgrade dials back over the hello's reply address.
        harness.channel_available("sendChannel", "sendRole");
        harness.link_loaded("sendChannel", "replyLinkId", "dialerRecvAddr");
        harness.conn_open("replyLinkId", "replyConnId");

        let (status, conduit_handle) = accepted.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_ne!(conduit_handle, NULL_OP_HANDLE);

        // The hello's payload is the first read off the conduit.
        let (read, store) = capture::<(ApiStatus, Vec<u8>)>();
        harness.manager.read(conduit_handle, move |status, bytes| {
            store((status, bytes));
        });
        harness.wait();
        let (status, bytes) = read.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_eq!(bytes, b"hi");

        // Writes flow back tagged with the dialer's package id.
        let (written, store) = capture::<ApiStatus>();
        harness
            .manager
            .write(conduit_handle, b"pong".to_vec(), move |status| store(status));
        harness.wait();

        let (write_handle, conn_id, package) = harness.last_send_package();
        assert_eq!(conn_id, "replyConnId");
        assert_eq!(&package[..crate::PACKAGE_ID_LEN], package_id.as_bytes());
        harness.package_sent(write_handle);
        assert_eq!(written.lock().unwrap().take().unwrap(), ApiStatus::Ok);
    }

    #[test]
    fn test_buffered_package_delivered_once_after_registration() {
        let harness = send_receive_harness();
        let (send_bytes, recv_bytes) = test_bytes();

        let (dialed, store) = capture::<(ApiStatus, OpHandle)>();
        harness
            .manager
            .dial(send_options(), send_bytes, move |status, handle| {
                store((status, handle));
            });
        harness.wait();
        drive_send_receive_connections(&harness);

        let (pkg_handle, _, package) = harness.last_send_package();
        let hello: HelloEnvelope = parse_envelope(&package[crate::PACKAGE_ID_LEN..]).unwrap();
        let package_id = hello.package_id().unwrap();

        harness.deliver(frame(package_id, &recv_bytes), "recvConnId");
        harness.package_sent(pkg_handle);

        let (_, conduit_handle) = dialed.lock().unwrap().take().unwrap();

        // First read drains the buffered package, a second read blocks on
        // an empty queue rather than seeing it twice.
        let reads = Arc::new(AtomicUsize::new(0));
        let reads_in_cb = reads.clone();
        harness.manager.read(conduit_handle, move |_, _| {
            reads_in_cb.fetch_add(1, Ordering::SeqCst);
        });
        harness.wait();
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        let second = Arc::new(AtomicUsize::new(0));
        let second_in_cb = second.clone();
        harness.manager.read(conduit_handle, move |_, _| {
            second_in_cb.fetch_add(1, Ordering::SeqCst);
        });
        harness.wait();
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_receive_respond_decodes_envelope() {
        let harness = send_receive_harness();

        let opts = ReceiveOptions {
            recv_channel: "recvChannel".into(),
            recv_role: "recvRole".into(),
            send_channel: "sendChannel".into(),
            send_role: "sendRole".into(),
            alt_channel: String::new(),
            multi_channel: false,
            timeout_ms: 0,
        };

        let (receiver, store) = capture::<(ApiStatus, LinkAddress, OpHandle)>();
        harness
            .manager
            .get_receiver(opts, move |status, address, handle| {
                store((status, address, handle));
            });
        harness.wait();

        harness.channel_available("recvChannel", "recvRole");
        harness.link_created("recvChannel", "recvLinkId", "recvAddr");
        harness.conn_open("recvLinkId", "recvConnId");

        let (status, address, api_handle) = receiver.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_eq!(address, "recvAddr");

        let package_id = PackageId::new([9; crate::PACKAGE_ID_LEN]);
        let hello = HelloEnvelope::new(package_id, "replyAddr", "sendChannel", b"ping");
        harness.deliver(
            crate::frame::frame_envelope(PackageId::zero(), &hello),
            "recvConnId",
        );

        let (responded, store) = capture::<(ApiStatus, Vec<u8>, LinkAddress, String)>();
        harness
            .manager
            .receive_respond(api_handle, move |status, bytes, address, tag| {
                store((status, bytes, address, tag));
            });
        harness.wait();

        let (status, bytes, reply_address, tag) = responded.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_eq!(bytes, b"ping");
        assert_eq!(reply_address, "replyAddr");
        assert_eq!(
            crate::encoding::base64::decode(&tag).unwrap(),
            package_id.as_bytes()
        );
    }

    #[test]
    fn test_receive_cancel_releases_pending_read() {
        let harness = send_receive_harness();

        let opts = ReceiveOptions {
            recv_channel: "recvChannel".into(),
            recv_role: "recvRole".into(),
            send_channel: String::new(),
            send_role: String::new(),
            alt_channel: String::new(),
            multi_channel: false,
            timeout_ms: 0,
        };

        let (receiver, store) = capture::<(ApiStatus, LinkAddress, OpHandle)>();
        harness
            .manager
            .get_receiver(opts, move |status, address, handle| {
                store((status, address, handle));
            });
        harness.wait();

        harness.channel_available("recvChannel", "recvRole");
        harness.link_created("recvChannel", "recvLinkId", "recvAddr");
        harness.conn_open("recvLinkId", "recvConnId");
        let (_, _, api_handle) = receiver.lock().unwrap().take().unwrap();

        let (read, store) = capture::<(ApiStatus, Vec<u8>)>();
        harness.manager.receive(api_handle, move |status, bytes| {
            store((status, bytes));
        });
        harness.wait();
        assert!(read.lock().unwrap().is_none());

        harness.manager.cancel(api_handle);
        harness.wait();
        assert_eq!(read.lock().unwrap().take().unwrap().0, ApiStatus::Timeout);

        // A package arriving after the cancel waits for the next request.
        harness.deliver(b"late".to_vec(), "recvConnId");

        let (read, store) = capture::<(ApiStatus, Vec<u8>)>();
        harness.manager.receive(api_handle, move |status, bytes| {
            store((status, bytes));
        });
        harness.wait();

        let (status, bytes) = read.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_eq!(bytes, b"late");
    }

    #[test]
    fn test_bootstrap_dial_without_response() {
        let harness = Harness::new(&[
            ("initSendChannel", "initSendRole", LinkSide::Loader),
            ("initRecvChannel", "initRecvRole", LinkSide::Creator),
            ("finalSendChannel", "finalSendRole", LinkSide::Creator),
            ("finalRecvChannel", "finalRecvRole", LinkSide::Creator),
        ]);

        let opts = BootstrapOptions {
            init_send_channel: "initSendChannel".into(),
            init_send_role: "initSendRole".into(),
            init_send_address: "initSendAddr".into(),
            init_recv_channel: "initRecvChannel".into(),
            init_recv_role: "initRecvRole".into(),
            init_recv_address: String::new(),
            final_send_channel: "finalSendChannel".into(),
            final_send_role: "finalSendRole".into(),
            final_recv_channel: "finalRecvChannel".into(),
            final_recv_role: "finalRecvRole".into(),
            timeout_seconds: 0,
        };

        let (dialed, store) = capture::<(ApiStatus, OpHandle)>();
        harness
            .manager
            .bootstrap_dial(opts, b"hello".to_vec(), move |status, handle| {
                store((status, handle));
            });
        harness.wait();

        harness.channel_available("initSendChannel", "initSendRole");
        harness.channel_available("initRecvChannel", "initRecvRole");
        harness.channel_available("finalSendChannel", "finalSendRole");
        harness.channel_available("finalRecvChannel", "finalRecvRole");
        harness.link_loaded("initSendChannel", "initSendLink", "initSendAddr");
        harness.link_created("initRecvChannel", "initRecvLink", "initRecvAddr");
        harness.link_created("finalSendChannel", "finalSendLink", "finalSendAddr");
        harness.link_created("finalRecvChannel", "finalRecvLink", "finalRecvAddr");
        harness.conn_open("initSendLink", "initSendConn");
        harness.conn_open("initRecvLink", "initRecvConn");
        harness.conn_open("finalSendLink", "finalSendConn");
        harness.conn_open("finalRecvLink", "finalRecvConn");

        // Every link was created on this side, so the hello carries all
        // three addresses the listener needs and no response is awaited.
        let (pkg_handle, conn_id, package) = harness.last_send_package();
        assert_eq!(conn_id, "initSendConn");
        assert!(package[..crate::PACKAGE_ID_LEN].iter().all(|byte| *byte == 0));

        let envelope: crate::frame::BootstrapEnvelope =
            parse_envelope(&package[crate::PACKAGE_ID_LEN..]).unwrap();
        assert_eq!(envelope.init_send_link_address.as_deref(), Some("initRecvAddr"));
        assert_eq!(envelope.init_send_channel.as_deref(), Some("initRecvChannel"));
        assert_eq!(envelope.final_send_link_address.as_deref(), Some("finalRecvAddr"));
        assert_eq!(envelope.final_send_channel.as_deref(), Some("finalRecvChannel"));
        assert_eq!(envelope.final_recv_link_address.as_deref(), Some("finalSendAddr"));
        assert_eq!(envelope.final_recv_channel.as_deref(), Some("finalSendChannel"));
        assert_eq!(envelope.message_bytes().unwrap(), b"hello");
        let package_id = envelope.package_id().unwrap();

        harness.package_sent(pkg_handle);

        let (status, conduit_handle) = dialed.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_ne!(conduit_handle, NULL_OP_HANDLE);

        // The conduit runs over the final pair.
        let (written, store) = capture::<ApiStatus>();
        harness
            .manager
            .write(conduit_handle, b"data".to_vec(), move |status| store(status));
        harness.wait();

        let (write_handle, write_conn, write_package) = harness.last_send_package();
        assert_eq!(write_conn, "finalSendConn");
        assert_eq!(&write_package[..crate::PACKAGE_ID_LEN], package_id.as_bytes());
        harness.package_sent(write_handle);
        assert_eq!(written.lock().unwrap().take().unwrap(), ApiStatus::Ok);

        // Tagged inbound packages on the final receive connection reach the
        // conduit.
        harness.deliver(frame(package_id, b"reply"), "finalRecvConn");
        let (read, store) = capture::<(ApiStatus, Vec<u8>)>();
        harness.manager.read(conduit_handle, move |status, bytes| {
            store((status, bytes));
        });
        harness.wait();
        let (status, bytes) = read.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_eq!(bytes, b"reply");
    }

    #[test]
    fn test_bootstrap_listen_responds_and_accepts() {
        let harness = Harness::new(&[
            ("initSendChannel", "initSendRole", LinkSide::Loader),
            ("initRecvChannel", "initRecvRole", LinkSide::Creator),
            ("finalSendChannel", "finalSendRole", LinkSide::Creator),
            ("finalRecvChannel", "finalRecvRole", LinkSide::Creator),
        ]);

        let opts = BootstrapOptions {
            init_send_channel: "initSendChannel".into(),
            init_send_role: "initSendRole".into(),
            init_send_address: String::new(),
            init_recv_channel: "initRecvChannel".into(),
            init_recv_role: "initRecvRole".into(),
            init_recv_address: String::new(),
            final_send_channel: "finalSendChannel".into(),
            final_send_role: "finalSendRole".into(),
            final_recv_channel: "finalRecvChannel".into(),
            final_recv_role: "finalRecvRole".into(),
            timeout_seconds: 0,
        };

        let (listening, store) = capture::<(ApiStatus, LinkAddress, OpHandle)>();
        harness
            .manager
            .bootstrap_listen(opts, move |status, address, handle| {
                store((status, address, handle));
            });
        harness.wait();

        harness.channel_available("initRecvChannel", "initRecvRole");
        harness.link_created("initRecvChannel", "initRecvLink", "initRecvAddr");
        harness.conn_open("initRecvLink", "initRecvConn");

        let (status, address, listen_handle) = listening.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_eq!(address, "initRecvAddr");

        // A dialer that could not create the final links sends a hello
        // carrying only its package id and reply leg.
        let package_id = PackageId::new([3; crate::PACKAGE_ID_LEN]);
        let hello = crate::frame::BootstrapEnvelope {
            package_id: crate::encoding::base64::encode(package_id.as_bytes()),
            message: crate::encoding::base64::encode(b"knock"),
            init_send_link_address: Some("dialerInitRecvAddr".into()),
            init_send_channel: Some("initSendChannel".into()),
            ..Default::default()
        };
        harness.deliver(
            crate::frame::frame_envelope(PackageId::zero(), &hello),
            "initRecvConn",
        );

        let (accepted, store) = capture::<(ApiStatus, OpHandle)>();
        harness.manager.accept(listen_handle, move |status, handle| {
            store((status, handle));
        });
        harness.wait();

        // The upgrade creates both final links and loads the reply leg.
        harness.channel_available("finalSendChannel", "finalSendRole");
        harness.channel_available("finalRecvChannel", "finalRecvRole");
        harness.channel_available("initSendChannel", "initSendRole");
        harness.link_created("finalSendChannel", "lFinalSendLink", "lFinalSendAddr");
        harness.link_created("finalRecvChannel", "lFinalRecvLink", "lFinalRecvAddr");
        harness.link_loaded("initSendChannel", "replyLink", "dialerInitRecvAddr");
        harness.conn_open("lFinalSendLink", "lFinalSendConn");
        harness.conn_open("lFinalRecvLink", "lFinalRecvConn");
        harness.conn_open("replyLink", "replyConn");

        // The response goes back over the reply leg, tagged with the real
        // package id and naming the created final links.
        let (pkg_handle, conn_id, package) = harness.last_send_package();
        assert_eq!(conn_id, "replyConn");
        assert_eq!(&package[..crate::PACKAGE_ID_LEN], package_id.as_bytes());

        let response: crate::frame::BootstrapEnvelope =
            parse_envelope(&package[crate::PACKAGE_ID_LEN..]).unwrap();
        assert_eq!(response.final_recv_link_address.as_deref(), Some("lFinalSendAddr"));
        assert_eq!(response.final_recv_channel.as_deref(), Some("finalSendChannel"));
        assert_eq!(response.final_send_link_address.as_deref(), Some("lFinalRecvAddr"));
        assert_eq!(response.final_send_channel.as_deref(), Some("finalRecvChannel"));

        harness.package_sent(pkg_handle);

        let (status, conduit_handle) = accepted.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_ne!(conduit_handle, NULL_OP_HANDLE);

        // The hello's payload is the first read off the conduit.
        let (read, store) = capture::<(ApiStatus, Vec<u8>)>();
        harness.manager.read(conduit_handle, move |status, bytes| {
            store((status, bytes));
        });
        harness.wait();
        let (status, bytes) = read.lock().unwrap().take().unwrap();
        assert_eq!(status, ApiStatus::Ok);
        assert_eq!(bytes, b"knock");
    }

    #[test]
    fn test_packages_delivered_in_arrival_order() {
        let harness = send_receive_harness();

        let opts = ReceiveOptions {
            recv_channel: "recvChannel".into(),
            recv_role: "recvRole".into(),
            send_channel: String::new(),
            send_role: String::new(),
            alt_channel: String::new(),
            multi_channel: false,
            timeout_ms: 0,
        };

        let (receiver, store) = capture::<(ApiStatus, LinkAddress, OpHandle)>();
        harness
            .manager
            .get_receiver(opts, move |status, address, handle| {
                store((status, address, handle));
            });
        harness.wait();

        harness.channel_available("recvChannel", "recvRole");
        harness.link_created("recvChannel", "recvLinkId", "recvAddr");
        harness.conn_open("recvLinkId", "recvConnId");
        let (_, _, api_handle) = receiver.lock().unwrap().take().unwrap();

        harness.deliver(b"one".to_vec(), "recvConnId");
        harness.deliver(b"two".to_vec(), "recvConnId");
        harness.deliver(b"three".to_vec(), "recvConnId");

        for expected in [&b"one"[..], &b"two"[..], &b"three"[..]].iter() {
            let (read, store) = capture::<(ApiStatus, Vec<u8>)>();
            harness.manager.receive(api_handle, move |status, bytes| {
                store((status, bytes));
            });
            harness.wait();

            let (status, bytes) = read.lock().unwrap().take().unwrap();
            assert_eq!(status, ApiStatus::Ok);
            assert_eq!(bytes, *expected);
        }
    }
}
