// Licensed under the MIT license.

//! End-to-end scenarios driven through the public
//! [`espat::Engine`] API against a scripted in-memory transport — an
//! event-channel harness standing in for the real network.

use espat::config::Config;
use espat::conn::ConnType;
use espat::engine::Engine;
use espat::error::Error;
use espat::message::Event;
use espat::transport::Transport;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A [`Transport`] that records every byte written and lets the test feed
/// scripted device responses back in on demand via
/// [`Engine::process_input`].
#[derive(Clone)]
struct RecordingTransport {
    written: Arc<Mutex<Vec<u8>>>,
}

impl RecordingTransport {
    fn new() -> Self {
        RecordingTransport { written: Arc::new(Mutex::new(Vec::new())) }
    }

    fn written_so_far(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, bytes: &[u8]) -> usize {
        self.written.lock().unwrap().extend_from_slice(bytes);
        bytes.len()
    }
}

/// Spin-waits until `written` contains at least `n` bytes, or panics after a
/// generous timeout — the producer thread runs asynchronously, so tests must
/// wait for each sub-command to actually reach the wire before feeding the
/// next scripted response (same pattern as `dispatcher.rs`'s internal tests).
fn wait_for_len(transport: &RecordingTransport, n: usize, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while transport.written.lock().unwrap().len() < n {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    String::from_utf8_lossy(haystack).matches(std::str::from_utf8(needle).unwrap()).count()
}

fn new_engine() -> (Engine<RecordingTransport>, RecordingTransport, mpsc::Receiver<Event>) {
    let transport = RecordingTransport::new();
    let (tx, rx) = mpsc::channel();
    let engine = Engine::new(Config::default(), transport.clone(), move |ev| {
        let _ = tx.send(ev);
    })
    .unwrap();
    (engine, transport, rx)
}

fn recv_event(rx: &mpsc::Receiver<Event>) -> Event {
    rx.recv_timeout(Duration::from_secs(2)).expect("expected an event")
}

/// Scenario 1: happy-path client TCP send.
#[test]
fn happy_path_client_tcp_send() {
    let (engine, transport, rx) = new_engine();

    let t2 = transport.clone();
    let engine2 = engine.clone();
    let connect = std::thread::spawn(move || engine2.connect(ConnType::Tcp, "example.com", 80, 0, 0));

    wait_for_len(&transport, "AT+CIPSTATUS\r\n".len(), "pre-check CIPSTATUS");
    engine.process_input(b"OK\r\n");

    let after_precheck = transport.written_so_far().len();
    wait_for_len(&transport, after_precheck + 1, "CIPSTARTEX");
    engine.process_input(b"+LINK_CONN:0,0,\"TCP\",0,\"93.184.216.34\",80,54321\r\nOK\r\n");

    match recv_event(&rx) {
        Event::ConnActive { conn, remote } => {
            assert_eq!(conn, 0);
            assert_eq!(remote, Some(("93.184.216.34".parse().unwrap(), 80)));
        }
        other => panic!("expected ConnActive, got {}", debug_kind(&other)),
    }

    let after_link = transport.written_so_far().len();
    wait_for_len(&transport, after_link + 1, "verify CIPSTATUS");
    engine.process_input(b"OK\r\n");

    let handle = connect.join().unwrap().expect("connect should succeed");
    assert_eq!(handle.number, 0);

    let engine3 = engine.clone();
    let t3 = transport.clone();
    let send = std::thread::spawn(move || engine3.send(handle, b"HELLO", None));

    let before_send = t3.written_so_far().len();
    wait_for_len(&t3, before_send + 1, "CIPSEND");
    assert!(transport.written_so_far().ends_with(b"AT+CIPSEND=0,5\r\n"));
    engine.process_input(b"\r\nOK\r\n\n> ");

    wait_for_len(&transport, before_send + "AT+CIPSEND=0,5\r\n".len() + 5, "bulk payload bytes");
    assert!(transport.written_so_far().ends_with(b"HELLO"));
    engine.process_input(b"\r\nSEND OK\r\n");

    let sent = send.join().unwrap().unwrap();
    assert_eq!(sent, 5);

    match recv_event(&rx) {
        Event::ConnSend { conn: 0, sent: 5, result: Ok(()) } => {}
        other => panic!("expected ConnSend, got {}", debug_kind(&other)),
    }
}

/// Scenario 2: `+IPD` payload split across two transport reads.
/// No request is outstanding; the data arrives unsolicited once a
/// connection is active, so this drives the parser through `Engine` with a
/// connection pre-seeded by a `+LINK_CONN:` line.
#[test]
fn ipd_split_across_reads_produces_one_event() {
    let (engine, _transport, rx) = new_engine();

    engine.process_input(b"+LINK_CONN:0,0,\"TCP\",1,\"1.2.3.4\",1000,0\r\n");
    match recv_event(&rx) {
        Event::ConnActive { conn: 0, .. } => {}
        other => panic!("expected ConnActive, got {}", debug_kind(&other)),
    }

    engine.process_input(b"+IPD,0,10,\"1.2.3.4\",1000:01234");
    engine.process_input(b"56789");

    match recv_event(&rx) {
        Event::ConnRecv { conn, pbuf } => {
            assert_eq!(conn, 0);
            assert_eq!(pbuf.length(), 10);
            let mut out = vec![0u8; 10];
            pbuf.copy(&mut out, 10, 0);
            assert_eq!(&out, b"0123456789");
            assert_eq!(pbuf.ip(), Some("1.2.3.4".parse().unwrap()));
            assert_eq!(pbuf.port(), 1000);
        }
        other => panic!("expected ConnRecv, got {}", debug_kind(&other)),
    }
}

/// Scenario 3: a send submitted against a stale handle (the slot closed and
/// was reused before dispatch) fails fast with no bytes on the wire.
#[test]
fn stale_send_after_reuse_fails_without_emitting() {
    let (engine, transport, rx) = new_engine();

    engine.process_input(b"+LINK_CONN:0,0,\"TCP\",1,\"1.2.3.4\",1000,0\r\n");
    match recv_event(&rx) {
        Event::ConnActive { conn: 0, .. } => {}
        other => panic!("expected ConnActive, got {}", debug_kind(&other)),
    }
    // Captured before the slot is torn down and reused below, so by the time
    // `send` runs the validation id embedded here no longer matches.
    let stale_handle = espat::conn::ConnHandle { number: 0, validation_id: 1 };

    engine.process_input(b"0,CLOSED\r\n");
    match recv_event(&rx) {
        Event::ConnClosed { conn: 0, .. } => {}
        other => panic!("expected ConnClosed, got {}", debug_kind(&other)),
    }

    engine.process_input(b"+LINK_CONN:0,0,\"TCP\",1,\"1.2.3.4\",1000,0\r\n");
    match recv_event(&rx) {
        Event::ConnActive { conn: 0, .. } => {}
        other => panic!("expected ConnActive, got {}", debug_kind(&other)),
    }

    let before = transport.written_so_far().len();
    let result = engine.send(stale_handle, b"late", None);
    assert_eq!(result, Err(Error::Closed));
    assert_eq!(transport.written_so_far().len(), before, "no bytes should be emitted for a stale send");

    match recv_event(&rx) {
        Event::ConnSend { sent: 0, result: Err(Error::Closed), .. } => {}
        other => panic!("expected ConnSend{{Closed}}, got {}", debug_kind(&other)),
    }
}

/// Scenario 4: `SEND FAIL` twice then `SEND OK` on the third attempt retries
/// transparently and reports the aggregate success.
#[test]
fn send_fail_retries_then_succeeds() {
    let (engine, transport, rx) = new_engine();

    engine.process_input(b"+LINK_CONN:0,0,\"TCP\",1,\"1.2.3.4\",1000,0\r\n");
    match recv_event(&rx) {
        Event::ConnActive { conn: 0, .. } => {}
        other => panic!("expected ConnActive, got {}", debug_kind(&other)),
    }
    let handle = espat::conn::ConnHandle { number: 0, validation_id: 1 };

    let data = vec![0xABu8; 100];
    let engine2 = engine.clone();
    let send = std::thread::spawn(move || engine2.send(handle, &data, None));

    for attempt in 0..3 {
        let before = transport.written_so_far().len();
        wait_for_len(&transport, before + 1, "CIPSEND attempt");
        engine.process_input(b"\r\nOK\r\n\n> ");
        wait_for_len(&transport, before + "AT+CIPSEND=0,100\r\n".len() + 100, "bulk payload bytes");
        if attempt < 2 {
            engine.process_input(b"\r\nSEND FAIL\r\n");
        } else {
            engine.process_input(b"\r\nSEND OK\r\n");
        }
    }

    let sent = send.join().unwrap().unwrap();
    assert_eq!(sent, 100);
    assert_eq!(count_occurrences(&transport.written_so_far(), b"AT+CIPSEND="), 3);

    match recv_event(&rx) {
        Event::ConnSend { conn: 0, sent: 100, result: Ok(()) } => {}
        other => panic!("expected ConnSend, got {}", debug_kind(&other)),
    }
}

/// Scenario 5: an unsolicited `ready` mid-session closes every active
/// connection, raises `ResetDetected`, and queues a reset sub-command
/// sequence.
#[test]
fn unsolicited_ready_raises_reset_detected_and_closes_connections() {
    let (engine, _transport, rx) = new_engine();

    engine.process_input(b"+LINK_CONN:0,0,\"TCP\",1,\"1.2.3.4\",1000,0\r\n");
    match recv_event(&rx) {
        Event::ConnActive { conn: 0, .. } => {}
        other => panic!("expected ConnActive, got {}", debug_kind(&other)),
    }

    engine.process_input(b"ready\r\n");

    let mut saw_reset_detected = false;
    let mut saw_closed = false;
    for _ in 0..4 {
        match recv_event(&rx) {
            Event::ResetDetected { forced: false } => saw_reset_detected = true,
            Event::ConnClosed { conn: 0, forced: false, .. } => saw_closed = true,
            _ => {}
        }
        if saw_reset_detected && saw_closed {
            break;
        }
    }
    assert!(saw_reset_detected, "expected ResetDetected event");
    assert!(saw_closed, "expected ConnClosed event for the previously active slot");
    assert!(!engine.is_active(0));
}

/// Scenario 6: DNS resolve via `CIPDOMAIN`.
#[test]
fn dns_resolve_reports_ip() {
    let (engine, transport, _rx) = new_engine();

    let engine2 = engine.clone();
    let dns = std::thread::spawn(move || engine2.dns_get_by_hostname("example.com"));

    wait_for_len(&transport, "AT+CIPDOMAIN=\"example.com\"\r\n".len(), "CIPDOMAIN emission");
    engine.process_input(b"+CIPDOMAIN:93.184.216.34\r\nOK\r\n");

    let ip = dns.join().unwrap().unwrap();
    assert_eq!(ip, Some("93.184.216.34".parse().unwrap()));
}

fn debug_kind(ev: &Event) -> &'static str {
    match ev {
        Event::Reset { .. } => "Reset",
        Event::Restore { .. } => "Restore",
        Event::ResetDetected { .. } => "ResetDetected",
        Event::StaJoinAp { .. } => "StaJoinAp",
        Event::StaListAp { .. } => "StaListAp",
        Event::StaInfoAp { .. } => "StaInfoAp",
        Event::Ping { .. } => "Ping",
        Event::DnsHostByName { .. } => "DnsHostByName",
        Event::SntpTime { .. } => "SntpTime",
        Event::ConnActive { .. } => "ConnActive",
        Event::ConnError { .. } => "ConnError",
        Event::ConnSend { .. } => "ConnSend",
        Event::ConnClosed { .. } => "ConnClosed",
        Event::ConnRecv { .. } => "ConnRecv",
        Event::Server { .. } => "Server",
        Event::StaConnected { .. } => "StaConnected",
        Event::StaDisconnected { .. } => "StaDisconnected",
        Event::DistStaIp { .. } => "DistStaIp",
        Event::WifiConnected => "WifiConnected",
        Event::WifiDisconnected => "WifiDisconnected",
        Event::WifiGotIp => "WifiGotIp",
        Event::StationList { .. } => "StationList",
        Event::Poll { .. } => "Poll",
    }
}
