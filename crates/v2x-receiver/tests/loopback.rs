use std::io::Write;
use std::net::{Shutdown, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use v2x_core::config::ReceiverConfig;
use v2x_core::{MessageClass, MessageFilter, Protocol, Store};
use v2x_receiver::framing::write_frame;
use v2x_receiver::Receiver;

fn loopback_config() -> ReceiverConfig {
    ReceiverConfig {
        bind_host: "127.0.0.1".to_string(),
        udp_port: 0,
        tcp_port: 0,
        ..ReceiverConfig::default()
    }
}

fn message(id: &str, vehicle: &str, class: &str) -> Vec<u8> {
    let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
    serde_json::to_vec(&serde_json::json!({
        "message_id": id,
        "send_timestamp": now,
        "vehicle_id": vehicle,
        "message_type": class,
        "speed": 20.0,
        "heading": 90.0,
    }))
    .expect("encode")
}

fn wait_for_count(store: &Store, want: u64) -> u64 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let count = store.message_count().expect("count");
        if count >= want || Instant::now() >= deadline {
            return count;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn udp_datagrams_are_stored_with_gaps() {
    let store = Arc::new(Store::open_in_memory().expect("store"));
    let receiver = Receiver::new(store.clone(), loopback_config());
    let running = receiver.start(&[Protocol::Udp]).expect("start");
    let addr = running.udp_addr().expect("udp addr");

    let sender = UdpSocket::bind("127.0.0.1:0").expect("sender");
    for seq in [1u64, 2, 5] {
        let bytes = message(&format!("TEL_VEH_001_{}", seq), "VEH_001", "telemetry");
        sender.send_to(&bytes, addr).expect("send");
        // Preserve ordering on the loopback path.
        thread::sleep(Duration::from_millis(20));
    }
    sender.send_to(b"garbage", addr).expect("send garbage");

    assert_eq!(wait_for_count(&store, 3), 3);
    thread::sleep(Duration::from_millis(100));
    running.stop_and_join();

    let records = store
        .messages(&MessageFilter::protocol(Protocol::Udp))
        .expect("query");
    let gaps: Vec<u64> = records.iter().map(|r| r.sequence_gap).collect();
    assert_eq!(gaps, vec![0, 0, 2]);
    assert!(records.iter().all(|r| r.message_class == MessageClass::Telemetry));
    assert_eq!(receiver.ingestor().snapshot().dropped, 1);
}

#[test]
fn tcp_frames_are_split_and_truncated_tail_is_discarded() {
    let store = Arc::new(Store::open_in_memory().expect("store"));
    let receiver = Receiver::new(store.clone(), loopback_config());
    let running = receiver.start(&[Protocol::Tcp]).expect("start");
    let addr = running.tcp_addr().expect("tcp addr");

    let mut stream = TcpStream::connect(addr).expect("connect");
    let mut buf = Vec::new();
    write_frame(&mut buf, &message("SAF_VEH_002_1", "VEH_002", "safety")).expect("frame");
    write_frame(&mut buf, &message("SAF_VEH_002_2", "VEH_002", "safety")).expect("frame");
    // Two frames in one write, sent in awkward slices.
    for chunk in buf.chunks(7) {
        stream.write_all(chunk).expect("write");
    }

    let mut partial = Vec::new();
    write_frame(&mut partial, &message("SAF_VEH_002_3", "VEH_002", "safety")).expect("frame");
    partial.truncate(partial.len() / 2);
    stream.write_all(&partial).expect("write partial");
    stream.shutdown(Shutdown::Write).expect("shutdown");

    assert_eq!(wait_for_count(&store, 2), 2);
    thread::sleep(Duration::from_millis(300));
    running.stop_and_join();

    let records = store
        .messages(&MessageFilter::class(MessageClass::Safety))
        .expect("query");
    let ids: Vec<&str> = records.iter().map(|r| r.message_id.as_str()).collect();
    assert_eq!(ids, vec!["SAF_VEH_002_1", "SAF_VEH_002_2"]);
    assert!(records.iter().all(|r| r.protocol == Protocol::Tcp));
}

#[test]
fn empty_tcp_connection_stores_nothing() {
    let store = Arc::new(Store::open_in_memory().expect("store"));
    let receiver = Receiver::new(store.clone(), loopback_config());
    let running = receiver.start(&[Protocol::Tcp]).expect("start");
    let addr = running.tcp_addr().expect("tcp addr");

    let stream = TcpStream::connect(addr).expect("connect");
    drop(stream);
    thread::sleep(Duration::from_millis(300));
    running.stop_and_join();
    assert_eq!(store.message_count().expect("count"), 0);
}
