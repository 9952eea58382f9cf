use clap::{App, Arg};
use plexus::channel_mgr::{ChannelRole, LinkSide};
use plexus::logging;
use plexus::support::{
    ChannelId, ConnId, LinkAddress, LinkId, LinkKind, OpHandle, ReceiveOptions, SdkResponse,
    SendOptions,
};
use plexus::{ChannelPlugin, Courier, EventSink, PluginHandle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// Smoke driver: two runtimes wired back-to-back through an in-memory
// channel. Exercises the full request/response path and a dialed conduit
// without touching a real transport.

const CHANNEL: &str = "loopback";
const ROLE: &str = "default";

#[derive(Default)]
struct NetState {
    next_id: u64,
    // link id -> advertised address
    link_addresses: HashMap<LinkId, LinkAddress>,
    // send connection -> target address
    send_conns: HashMap<ConnId, LinkAddress>,
    // address -> receiving (side, connection) endpoints
    recv_conns: HashMap<LinkAddress, Vec<(usize, ConnId)>>,
    sinks: Vec<Option<Arc<dyn EventSink>>>,
}

/// The shared in-memory "network" both plugin instances deliver through.
struct Network {
    state: Mutex<NetState>,
}

impl Network {
    fn new(sides: usize) -> Arc<Network> {
        let mut state = NetState::default();
        state.sinks.resize_with(sides, || None);
        Arc::new(Network {
            state: Mutex::new(state),
        })
    }

    fn set_sink(&self, side: usize, sink: Arc<dyn EventSink>) {
        self.state.lock().unwrap().sinks[side] = Some(sink);
    }
}

struct LoopbackPlugin {
    side: usize,
    network: Arc<Network>,
}

impl LoopbackPlugin {
    fn sink(&self, side: usize) -> Arc<dyn EventSink> {
        self.network.state.lock().unwrap().sinks[side]
            .clone()
            .expect("Side has no sink wired")
    }
}

impl ChannelPlugin for LoopbackPlugin {
    fn activate_channel(&self, handle: OpHandle, channel_id: &ChannelId, role: &str) -> SdkResponse {
        self.sink(self.side).on_channel_status_changed(
            handle,
            channel_id,
            plexus::support::ChannelStatus::Available,
            plexus::support::ChannelProps { role: role.into() },
        );
        SdkResponse::ok()
    }

    fn create_link(&self, handle: OpHandle, _channel_id: &ChannelId) -> SdkResponse {
        let (link_id, address) = {
            let mut state = self.network.state.lock().unwrap();
            state.next_id += 1;
            let link_id = format!("lb-link-{}", state.next_id);
            // Addresses are JSON like any real channel's.
            let address = serde_json::json!({ "mailbox": state.next_id }).to_string();
            state.link_addresses.insert(link_id.clone(), address.clone());
            (link_id, address)
        };

        self.sink(self.side).on_link_status_changed(
            handle,
            &link_id,
            plexus::support::LinkStatus::Created,
            plexus::support::LinkProps {
                link_address: address,
            },
        );
        SdkResponse::ok()
    }

    fn load_link_address(
        &self,
        handle: OpHandle,
        _channel_id: &ChannelId,
        address: &LinkAddress,
    ) -> SdkResponse {
        let link_id = {
            let mut state = self.network.state.lock().unwrap();
            state.next_id += 1;
            let link_id = format!("lb-link-{}", state.next_id);
            state.link_addresses.insert(link_id.clone(), address.clone());
            link_id
        };

        self.sink(self.side).on_link_status_changed(
            handle,
            &link_id,
            plexus::support::LinkStatus::Loaded,
            plexus::support::LinkProps {
                link_address: address.clone(),
            },
        );
        SdkResponse::ok()
    }

    fn load_link_addresses(
        &self,
        _handle: OpHandle,
        _channel_id: &ChannelId,
        _addresses: &[LinkAddress],
    ) -> SdkResponse {
        SdkResponse::new(plexus::support::SdkStatus::Invalid)
    }

    fn create_link_from_address(
        &self,
        handle: OpHandle,
        channel_id: &ChannelId,
        address: &LinkAddress,
    ) -> SdkResponse {
        // Loopback addresses are synthetic; treat this as a plain load.
        self.load_link_address(handle, channel_id, address)
    }

    fn create_bootstrap_link(
        &self,
        _handle: OpHandle,
        _channel_id: &ChannelId,
        _passphrase: &str,
    ) -> SdkResponse {
        SdkResponse::new(plexus::support::SdkStatus::Invalid)
    }

    fn open_connection(
        &self,
        handle: OpHandle,
        kind: LinkKind,
        link_id: &LinkId,
        _hints: &str,
        _send_timeout: u64,
    ) -> SdkResponse {
        let conn_id = {
            let mut state = self.network.state.lock().unwrap();
            let address = match state.link_addresses.get(link_id) {
                Some(address) => address.clone(),
                None => return SdkResponse::new(plexus::support::SdkStatus::InvalidArgument),
            };

            state.next_id += 1;
            let conn_id = format!("lb-conn-{}", state.next_id);
            match kind {
                LinkKind::Send => {
                    state.send_conns.insert(conn_id.clone(), address);
                }
                _ => {
                    state
                        .recv_conns
                        .entry(address)
                        .or_default()
                        .push((self.side, conn_id.clone()));
                }
            }
            conn_id
        };

        self.sink(self.side).on_connection_status_changed(
            handle,
            &conn_id,
            plexus::support::ConnectionStatus::Open,
            plexus::support::LinkProps::default(),
        );
        SdkResponse::ok()
    }

    fn send_package(
        &self,
        handle: OpHandle,
        conn_id: &ConnId,
        package: Vec<u8>,
        _deadline: f64,
        _batch_id: u64,
    ) -> SdkResponse {
        let targets = {
            let state = self.network.state.lock().unwrap();
            let address = match state.send_conns.get(conn_id) {
                Some(address) => address.clone(),
                None => return SdkResponse::new(plexus::support::SdkStatus::InvalidArgument),
            };
            state
                .recv_conns
                .get(&address)
                .cloned()
                .unwrap_or_default()
        };

        for (side, recv_conn) in targets {
            self.sink(side)
                .receive_enc_pkg(package.clone(), &[recv_conn]);
        }

        self.sink(self.side)
            .on_package_status_changed(handle, plexus::support::PackageStatus::Sent);
        SdkResponse::ok()
    }

    fn close_connection(&self, handle: OpHandle, conn_id: &ConnId) -> SdkResponse {
        {
            let mut state = self.network.state.lock().unwrap();
            state.send_conns.remove(conn_id);
            for endpoints in state.recv_conns.values_mut() {
                endpoints.retain(|(_, conn)| conn != conn_id);
            }
        }

        self.sink(self.side).on_connection_status_changed(
            handle,
            conn_id,
            plexus::support::ConnectionStatus::Closed,
            plexus::support::LinkProps::default(),
        );
        SdkResponse::ok()
    }

    fn destroy_link(&self, handle: OpHandle, link_id: &LinkId) -> SdkResponse {
        self.network
            .state
            .lock()
            .unwrap()
            .link_addresses
            .remove(link_id);

        self.sink(self.side).on_link_status_changed(
            handle,
            link_id,
            plexus::support::LinkStatus::Destroyed,
            plexus::support::LinkProps::default(),
        );
        SdkResponse::ok()
    }

    fn deactivate_channel(&self, _handle: OpHandle, _channel_id: &ChannelId) -> SdkResponse {
        SdkResponse::ok()
    }
}

fn courier(side: usize, network: &Arc<Network>, log: &logging::Logger) -> Courier {
    let plugin = Arc::new(LoopbackPlugin {
        side,
        network: network.clone(),
    });
    let registration = PluginHandle::new(
        CHANNEL,
        vec![ChannelRole::new(ROLE, LinkSide::Both)],
        plugin,
    );

    let courier = Courier::new(vec![registration], log);
    network.set_sink(side, courier.manager().event_sink());
    courier
}

fn main() {
    let matches = App::new("Loopback Driver")
        .version("1.0")
        .about("Round-trips messages through two runtimes over an in-memory channel.")
        .arg(
            Arg::with_name("MESSAGE")
                .help("Message to round-trip")
                .required(false),
        )
        .get_matches();

    let message = matches.value_of("MESSAGE").unwrap_or("hello plexus");
    let log = logging::init();

    let network = Network::new(2);
    let alice = courier(0, &network, &log);
    let bob = courier(1, &network, &log);

    // Request/response: alice answers one message, bob round-trips one.
    let recv_opts = ReceiveOptions {
        recv_channel: CHANNEL.into(),
        recv_role: ROLE.into(),
        send_channel: CHANNEL.into(),
        send_role: ROLE.into(),
        ..Default::default()
    };

    let (status, address, replier) = alice.receive_respond(recv_opts);
    println!("alice listening: status={:?} address={}", status, address);

    let responder = thread::spawn(move || {
        let (status, bytes, reply) = replier.receive();
        println!(
            "alice received: status={:?} message={}",
            status,
            String::from_utf8_lossy(&bytes)
        );
        let status = reply.respond_str(&format!("pong: {}", String::from_utf8_lossy(&bytes)));
        println!("alice replied: status={:?}", status);
    });

    let send_opts = SendOptions {
        send_channel: CHANNEL.into(),
        send_role: ROLE.into(),
        send_address: address,
        recv_channel: CHANNEL.into(),
        recv_role: ROLE.into(),
        ..Default::default()
    };

    let (status, response) = bob.send_receive(send_opts.clone(), message.as_bytes().to_vec());
    println!(
        "bob round-trip: status={:?} response={}",
        status,
        String::from_utf8_lossy(&response)
    );
    responder.join().unwrap();

    // Conduit: alice listens, bob dials, one exchange each way.
    let listen_opts = ReceiveOptions {
        recv_channel: CHANNEL.into(),
        recv_role: ROLE.into(),
        send_channel: CHANNEL.into(),
        send_role: ROLE.into(),
        ..Default::default()
    };

    let (status, listen_address, acceptor) = alice.listen(listen_opts);
    println!("alice accepting: status={:?} address={}", status, listen_address);

    let accepting = thread::spawn(move || {
        let (status, conduit) = acceptor.accept();
        println!("alice accepted: status={:?}", status);

        let (status, bytes) = conduit.read(Some(Duration::from_secs(5)));
        println!(
            "alice read: status={:?} message={}",
            status,
            String::from_utf8_lossy(&bytes)
        );

        let status = conduit.write_str("right back at you");
        println!("alice wrote: status={:?}", status);
    });

    let mut dial_opts = send_opts;
    dial_opts.send_address = listen_address;

    let (status, conduit) = bob.dial(dial_opts, b"opening move".to_vec());
    println!("bob dialed: status={:?}", status);

    let status = conduit.write_str("over the conduit");
    println!("bob wrote: status={:?}", status);

    let (status, bytes) = conduit.read(Some(Duration::from_secs(5)));
    println!(
        "bob read: status={:?} message={}",
        status,
        String::from_utf8_lossy(&bytes)
    );

    accepting.join().unwrap();

    let status = conduit.close();
    println!("bob closed conduit: status={:?}", status);

    alice.shutdown();
    bob.shutdown();
}
