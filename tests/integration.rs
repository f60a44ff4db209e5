//! Integration tests for the tunnel and the app monitor.
//!
//! The tunnel runs over an in-memory device; synthesized answers are decoded
//! with an independent DNS implementation.

use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use parking_lot::Mutex;
use pnet::packet::Packet;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::udp::{MutableUdpPacket, UdpPacket};

use focuslock::blocklist::{BlocklistStore, JsonFileStore};
use focuslock::commands::{BlockerCommands, HeadlessPlatform};
use focuslock::config::{AppBlockerSettings, TunnelSettings};
use focuslock::dns::DnsForwarder;
use focuslock::lock::LockGate;
use focuslock::monitor::{Decision, ForegroundMonitor};
use focuslock::network::TunnelDevice;
use focuslock::tunnel::{TunnelController, TunnelState};

const APP_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const TUNNEL_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// In-memory device shared between the test and the worker.
#[derive(Clone, Default)]
struct TestDevice {
    inbound: Arc<Mutex<VecDeque<Vec<u8>>>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TunnelDevice for TestDevice {
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(frame) = self.inbound.lock().pop_front() else {
            thread::sleep(Duration::from_millis(1));
            return Ok(0);
        };
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.written.lock().push(frame.to_vec());
        Ok(())
    }
}

/// Answers nothing; counts calls.
#[derive(Clone, Default)]
struct CountingForwarder {
    calls: Arc<AtomicUsize>,
}

impl DnsForwarder for CountingForwarder {
    fn forward(&self, _query: &[u8]) -> focuslock::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(focuslock::error::NetworkError::ForwardTimeout.into())
    }
}

fn dns_query(domain: &str, id: u16) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
    message.to_bytes().unwrap()
}

/// IPv4/UDP frame from the app to the tunnel's DNS address.
fn query_frame(domain: &str, src_port: u16, id: u16) -> Vec<u8> {
    let dns = dns_query(domain, id);
    let total = 20 + 8 + dns.len();
    let mut frame = vec![0u8; total];
    {
        let mut udp = MutableUdpPacket::new(&mut frame[20..]).unwrap();
        udp.set_source(src_port);
        udp.set_destination(53);
        udp.set_length((8 + dns.len()) as u16);
        udp.set_payload(&dns);
    }
    {
        let mut ip = MutableIpv4Packet::new(&mut frame).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(total as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source(APP_ADDR);
        ip.set_destination(TUNNEL_ADDR);
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }
    frame
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn controller(
    device: TestDevice,
    forwarder: CountingForwarder,
    store: BlocklistStore,
) -> Arc<TunnelController> {
    let provider = move |_: &TunnelSettings| -> focuslock::Result<Box<dyn TunnelDevice>> {
        Ok(Box::new(device.clone()))
    };
    Arc::new(TunnelController::new(
        Arc::new(provider),
        Arc::new(forwarder),
        store,
        TunnelSettings::default(),
    ))
}

#[test]
fn should_answer_blocked_subdomain_with_localhost() {
    let device = TestDevice::default();
    let forwarder = CountingForwarder::default();
    let store = BlocklistStore::in_memory();
    store.save_domains(&["example.com"]).unwrap();
    let tunnel = controller(device.clone(), forwarder.clone(), store);

    tunnel.start().unwrap();
    assert_eq!(tunnel.status().blocked_count, 0);

    device
        .inbound
        .lock()
        .push_back(query_frame("ads.example.com", 40123, 0xBEEF));
    assert!(wait_until(|| device.written.lock().len() == 1));
    assert_eq!(tunnel.status().blocked_count, 1);
    assert_eq!(forwarder.calls.load(Ordering::SeqCst), 0);

    let reply = device.written.lock()[0].clone();

    let ip = Ipv4Packet::new(&reply).unwrap();
    assert_eq!(ip.get_source(), TUNNEL_ADDR);
    assert_eq!(ip.get_destination(), APP_ADDR);
    assert_eq!(usize::from(ip.get_total_length()), reply.len());
    assert_eq!(ip.get_checksum(), ipv4::checksum(&ip));

    let udp = UdpPacket::new(ip.payload()).unwrap();
    assert_eq!(udp.get_source(), 53);
    assert_eq!(udp.get_destination(), 40123);

    let message = Message::from_bytes(udp.payload()).unwrap();
    assert_eq!(message.id(), 0xBEEF);
    assert_eq!(message.message_type(), MessageType::Response);
    assert!(message.authoritative());
    assert!(message.recursion_available());
    assert_eq!(message.queries().len(), 1);
    assert_eq!(message.answers().len(), 1);

    let answer = &message.answers()[0];
    assert_eq!(answer.name(), &Name::from_str("ads.example.com").unwrap());
    assert_eq!(answer.ttl(), 300);
    let a = answer.data().as_a().expect("A record");
    assert_eq!(a.0, Ipv4Addr::LOCALHOST);

    tunnel.stop();
    tunnel.stop();
    assert_eq!(tunnel.state(), TunnelState::Stopped);
}

#[test]
fn should_block_doh_endpoint_with_empty_list() {
    let device = TestDevice::default();
    let forwarder = CountingForwarder::default();
    let tunnel = controller(device.clone(), forwarder.clone(), BlocklistStore::in_memory());

    tunnel.start().unwrap();
    assert_eq!(tunnel.status().domains_loaded, 0);

    device
        .inbound
        .lock()
        .push_back(query_frame("cloudflare-dns.com", 40000, 1));
    device
        .inbound
        .lock()
        .push_back(query_frame("example.org", 40001, 2));

    assert!(wait_until(|| forwarder.calls.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| tunnel.counters().dropped == 1));
    assert_eq!(tunnel.status().blocked_count, 1);
    assert_eq!(device.written.lock().len(), 1);
    tunnel.stop();
}

#[test]
fn should_freeze_domain_list_per_session() {
    let device = TestDevice::default();
    let forwarder = CountingForwarder::default();
    let store = BlocklistStore::in_memory();
    store.save_domains(&["example.com"]).unwrap();
    let tunnel = controller(device.clone(), forwarder.clone(), store.clone());
    tunnel.start().unwrap();

    store.save_domains(&["example.com", "video.example"]).unwrap();
    device
        .inbound
        .lock()
        .push_back(query_frame("video.example", 40000, 1));
    assert!(wait_until(|| forwarder.calls.load(Ordering::SeqCst) == 1));
    assert_eq!(tunnel.status().blocked_count, 0);

    tunnel.stop();
    tunnel.start().unwrap();
    assert_eq!(tunnel.status().domains_loaded, 2);
    device
        .inbound
        .lock()
        .push_back(query_frame("video.example", 40000, 2));
    assert!(wait_until(|| tunnel.status().blocked_count == 1));
    tunnel.stop();
}

#[test]
fn should_redirect_blocked_app_only_while_locked() {
    let store = BlocklistStore::in_memory();
    store.save_blocked_apps(&["com.example.game"]).unwrap();
    let gate = LockGate::new(store.clone());

    let redirected = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&redirected);
    let redirector = move |package: &str| sink.lock().push(package.to_string());
    let monitor = ForegroundMonitor::new(
        store,
        gate.clone(),
        Arc::new(redirector),
        &AppBlockerSettings::default(),
    );

    let t0 = Instant::now();
    assert_eq!(
        monitor.on_foreground_changed_at("com.example.game", t0),
        Decision::Unlocked
    );
    assert!(redirected.lock().is_empty());

    gate.set_expiry_at(Utc::now() + TimeDelta::hours(1)).unwrap();
    assert_eq!(
        monitor.on_foreground_changed_at("com.example.game", t0),
        Decision::Redirected
    );
    assert_eq!(
        monitor.on_foreground_changed_at("com.example.game", t0 + Duration::from_millis(500)),
        Decision::Debounced
    );
    assert_eq!(redirected.lock().len(), 1);

    assert_eq!(
        monitor.on_foreground_changed_at("com.example.game", t0 + Duration::from_millis(1100)),
        Decision::Redirected
    );
    assert_eq!(
        redirected.lock().as_slice(),
        ["com.example.game", "com.example.game"]
    );
}

#[test]
fn should_restart_after_boot_from_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let store = BlocklistStore::new(Arc::new(JsonFileStore::open(&path).unwrap()));
        store.save_domains(&["example.com"]).unwrap();
        LockGate::new(store).extend(2).unwrap();
    }

    let store = BlocklistStore::new(Arc::new(JsonFileStore::open(&path).unwrap()));
    let gate = LockGate::new(store.clone());
    assert!(gate.is_locked());

    let tunnel = controller(TestDevice::default(), CountingForwarder::default(), store.clone());
    let commands = BlockerCommands::new(store, gate, tunnel, Arc::new(HeadlessPlatform));

    assert!(commands.on_boot().unwrap());
    let status = commands.vpn_status().unwrap();
    assert!(status.is_running);
    assert_eq!(status.domains_loaded, 1);

    commands.stop_vpn_blocker().unwrap();
    assert!(!commands.vpn_status().unwrap().is_running);
}
