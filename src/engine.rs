// Licensed under the MIT license.

//! The top-level engine: wires the command dispatcher (`crate::dispatcher`),
//! the byte-stream parser (`crate::parser`) and the connection table
//! (`crate::conn`) into the two long-lived tasks: a producer task that
//! drains the request mailbox and a parser task that drains the serial
//! input, plus the 500 ms connection poll timer
//! and the event-delivery thread that calls the host's callback with no
//! engine lock held.
//!
//! A thin public-facing handle (here, [`Engine`] itself) backed by a
//! shared, `Arc`-owned core (`crate::state::Shared`) that background
//! threads also hold.

use crate::config::Config;
use crate::conn::{ApInfo, ConnHandle, ConnType};
use crate::dispatcher::run_request;
use crate::error::{Error, Result};
use crate::message::{Completion, DefaultCmd, Event, Request, RequestPayload};
use crate::os::{Mailbox, MailboxSender, Os, Semaphore, StdOs};
use crate::parser::Parser;
use crate::ringbuf::RingBuffer;
use crate::state::Shared;
use crate::transport::Transport;
use eui48::MacAddress;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

thread_local! {
    /// Set for the duration of a host callback invocation so a recursive
    /// blocking `submit()` from within that callback can be rejected with
    /// [`Error::BlockingNotAllowed`] instead of deadlocking on the recursive
    /// lock.
    static IN_CALLBACK: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

/// Capacity of the producer mailbox; a `submit()` with `blocking=false`
/// that finds it full fails fast with [`Error::NoMem`] rather than blocking.
const PRODUCER_MAILBOX_CAPACITY: usize = 64;
const EVENT_MAILBOX_CAPACITY: usize = 256;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const PULL_MODE_CHUNK: usize = 512;

/// The engine's public handle. Cheap to clone (everything behind it is
/// `Arc`-owned); cloning it is how multiple application threads share one
/// device session and call the public API concurrently.
pub struct Engine<T: Transport + 'static, O: Os = StdOs> {
    shared: Arc<Shared<O::Sem, T>>,
    os: O,
    producer: MailboxSender<Arc<Request<O::Sem>>>,
    ring: Option<Arc<Mutex<RingBuffer>>>,
    /// Push-mode parser state, persisted across `process_input` calls so a
    /// line or IPD payload split across two calls is not lost.
    push_parser: Arc<Mutex<Parser>>,
}

impl<T: Transport + 'static, O: Os> Clone for Engine<T, O> {
    fn clone(&self) -> Self {
        Engine {
            shared: self.shared.clone(),
            os: self.os.clone(),
            producer: self.producer.clone(),
            ring: self.ring.clone(),
            push_parser: self.push_parser.clone(),
        }
    }
}

impl<T: Transport + 'static> Engine<T, StdOs> {
    /// Builds an engine with the default, `std`-backed [`Os`].
    pub fn new(config: Config, transport: T, on_event: impl Fn(Event) + Send + 'static) -> Result<Self> {
        Engine::with_os(config, transport, StdOs, on_event)
    }
}

impl<T: Transport + 'static, O: Os> Engine<T, O> {
    /// Builds an engine over a caller-supplied [`Os`] implementation.
    pub fn with_os(config: Config, transport: T, os: O, on_event: impl Fn(Event) + Send + 'static) -> Result<Self> {
        config.validate()?;
        let input_use_process = config.input_use_process;
        let cmd_sem = os.new_semaphore(0);
        let events: Mailbox<Event> = Mailbox::new(EVENT_MAILBOX_CAPACITY);
        let events_sender = events.sender();
        let shared = Arc::new(Shared::new(config, transport, cmd_sem, events_sender));
        let producer: Mailbox<Arc<Request<O::Sem>>> = Mailbox::new(PRODUCER_MAILBOX_CAPACITY);
        let producer_tx = producer.sender();

        spawn_event_thread(&os, events, on_event);
        spawn_producer_thread(&os, shared.clone(), producer);
        spawn_poll_thread(&os, shared.clone());

        let ring = if input_use_process {
            None
        } else {
            let ring = Arc::new(Mutex::new(RingBuffer::new(4096)));
            spawn_parser_thread(&os, shared.clone(), ring.clone());
            Some(ring)
        };

        Ok(Engine { shared, os, producer: producer_tx, ring, push_parser: Arc::new(Mutex::new(Parser::new())) })
    }

    /// Submits a fully-formed request.
    fn submit(&self, default_cmd: DefaultCmd, payload: RequestPayload, blocking: bool) -> Result<Arc<Request<O::Sem>>> {
        if blocking && IN_CALLBACK.with(|f| f.get()) {
            return Err(Error::BlockingNotAllowed);
        }
        let completion = if blocking {
            Completion::Blocking(self.os.new_semaphore(0))
        } else {
            Completion::FireAndForget
        };
        let req = Arc::new(Request::new(default_cmd, payload, completion));

        if blocking {
            self.producer.put(req.clone());
        } else {
            self.producer.try_put(req.clone()).map_err(|_| Error::NoMem)?;
        }

        if blocking {
            if let Completion::Blocking(sem) = &req.completion {
                // `run_request` always eventually calls `Request::complete`,
                // bounded by its own per-step timeouts, so an unbounded wait
                // here cannot hang.
                sem.wait(0);
            }
        }
        Ok(req)
    }

    fn submit_blocking(&self, default_cmd: DefaultCmd, payload: RequestPayload) -> Result<Arc<Request<O::Sem>>> {
        let req = self.submit(default_cmd, payload, true)?;
        req.take_result()?;
        Ok(req)
    }

    // ---- Reset / device lifecycle ------------------------------------

    pub fn reset(&self) -> Result<()> {
        self.submit_blocking(DefaultCmd::Reset, RequestPayload::None).map(|_| ())
    }

    pub fn reset_nonblocking(&self) -> Result<()> {
        self.submit(DefaultCmd::Reset, RequestPayload::None, false).map(|_| ())
    }

    pub fn restore(&self) -> Result<()> {
        self.submit_blocking(DefaultCmd::Restore, RequestPayload::None).map(|_| ())
    }

    // ---- Station Wi-Fi -------------------------------------------------

    pub fn join_ap(&self, ssid: &str, password: &str) -> Result<()> {
        self.submit_blocking(
            DefaultCmd::JoinAp,
            RequestPayload::JoinAp { ssid: ssid.to_string(), password: password.to_string() },
        )
        .map(|_| ())
    }

    pub fn quit_ap(&self) -> Result<()> {
        self.submit_blocking(DefaultCmd::QuitAp, RequestPayload::None).map(|_| ())
    }

    pub fn list_ap(&self, ssid_filter: Option<&str>) -> Result<Vec<ApInfo>> {
        let req = self.submit_blocking(
            DefaultCmd::ListAp,
            RequestPayload::ListAp { ssid_filter: ssid_filter.map(str::to_string) },
        )?;
        Ok(std::mem::take(&mut req.outputs.lock().unwrap().ap_list))
    }

    pub fn ap_info(&self) -> Result<Option<ApInfo>> {
        let req = self.submit_blocking(DefaultCmd::ApInfo, RequestPayload::None)?;
        Ok(req.outputs.lock().unwrap().ap_info.clone())
    }

    pub fn soft_ap_config(&self, ssid: &str, password: &str, channel: u8, ecn: u8) -> Result<()> {
        self.submit_blocking(
            DefaultCmd::SoftApConfig,
            RequestPayload::SoftApConfig { ssid: ssid.to_string(), password: password.to_string(), channel, ecn },
        )
        .map(|_| ())
    }

    pub fn list_stations(&self) -> Result<Vec<(IpAddr, MacAddress)>> {
        let req = self.submit_blocking(DefaultCmd::ListStations, RequestPayload::None)?;
        Ok(std::mem::take(&mut req.outputs.lock().unwrap().stations))
    }

    /// Reads (`name = None`) or sets (`name = Some(..)`) the device hostname.
    pub fn hostname(&self, name: Option<&str>) -> Result<Option<String>> {
        let req = self.submit_blocking(DefaultCmd::Hostname, RequestPayload::Hostname(name.map(str::to_string)))?;
        Ok(req.outputs.lock().unwrap().hostname.clone())
    }

    // ---- Network queries -------------------------------------------------

    pub fn ping(&self, host: &str) -> Result<Option<u32>> {
        let req = self.submit_blocking(DefaultCmd::Ping, RequestPayload::Ping(host.to_string()))?;
        Ok(req.outputs.lock().unwrap().ping_ms)
    }

    pub fn dns_get_by_hostname(&self, host: &str) -> Result<Option<IpAddr>> {
        let req = self.submit_blocking(DefaultCmd::Dns, RequestPayload::Dns(host.to_string()))?;
        Ok(req.outputs.lock().unwrap().dns_ip)
    }

    pub fn sntp_config(&self, enable: bool, timezone: i8) -> Result<()> {
        self.submit_blocking(DefaultCmd::SntpConfig, RequestPayload::SntpConfig { enable, timezone }).map(|_| ())
    }

    pub fn sntp_query(&self) -> Result<Option<String>> {
        let req = self.submit_blocking(DefaultCmd::SntpQuery, RequestPayload::None)?;
        Ok(req.outputs.lock().unwrap().sntp_time.clone())
    }

    // ---- Connections -------------------------------------------------

    /// Opens a client connection.
    /// `local_port` is only meaningful for `Udp`/`UdpV6`.
    pub fn connect(&self, conn_type: ConnType, host: &str, port: u16, local_port: u16, keepalive: u16) -> Result<ConnHandle> {
        let req = self.submit_blocking(
            DefaultCmd::ConnOpen,
            RequestPayload::ConnOpen { conn_type, host: host.to_string(), port, local_port, keepalive },
        )?;
        req.outputs.lock().unwrap().conn_handle.ok_or(Error::ConnFail)
    }

    /// Sends `data` on `handle`, chunked to `conn_max_data_len` segments with
    /// retry on `SEND FAIL`. Fails fast
    /// with [`Error::Closed`] if `handle`'s validation id no longer matches
    /// the slot, e.g. the slot was closed and reused between submit and
    /// dispatch.
    pub fn send(&self, handle: ConnHandle, data: &[u8], dst: Option<(IpAddr, u16)>) -> Result<usize> {
        let req =
            self.submit_blocking(DefaultCmd::ConnSend, RequestPayload::ConnSend { handle, data: data.to_vec(), dst })?;
        Ok(req.outputs.lock().unwrap().sent)
    }

    pub fn close(&self, handle: ConnHandle) -> Result<()> {
        self.submit_blocking(DefaultCmd::ConnClose, RequestPayload::ConnClose { handle }).map(|_| ())
    }

    pub fn server_start(&self, port: u16, max_conn: u8, timeout_s: u16) -> Result<()> {
        self.submit_blocking(DefaultCmd::ServerStart, RequestPayload::ServerStart { port, max_conn, timeout_s })
            .map(|_| ())
    }

    pub fn server_stop(&self) -> Result<()> {
        self.submit_blocking(DefaultCmd::ServerStop, RequestPayload::ServerStop).map(|_| ())
    }

    /// Pulls up to `len` bytes via the manual-receive cycle
    /// (`CIPRECVLEN?`/`CIPRECVDATA`). Only meaningful when
    /// [`Config::manual_tcp_receive`] is enabled.
    pub fn manual_recv(&self, handle: ConnHandle, len: usize) -> Result<usize> {
        let req = self.submit_blocking(DefaultCmd::ManualRecv, RequestPayload::ManualRecv { handle, len })?;
        Ok(req.outputs.lock().unwrap().sent)
    }

    /// Emits an already-formatted `AT<suffix>` passthrough command.
    pub fn passthrough(&self, suffix: &str) -> Result<()> {
        self.submit_blocking(DefaultCmd::Passthrough, RequestPayload::Passthrough(suffix.to_string())).map(|_| ())
    }

    // ---- Connection table introspection -------------------------------

    pub fn is_active(&self, conn: u8) -> bool {
        self.shared.conns.lock().unwrap().is_active(conn)
    }

    pub fn is_closed(&self, conn: u8) -> bool {
        self.shared.conns.lock().unwrap().is_closed(conn)
    }

    pub fn is_client(&self, conn: u8) -> bool {
        self.shared.conns.lock().unwrap().is_client(conn)
    }

    pub fn is_server(&self, conn: u8) -> bool {
        self.shared.conns.lock().unwrap().is_server(conn)
    }

    pub fn set_arg(&self, conn: u8, arg: Arc<dyn std::any::Any + Send + Sync>) {
        self.shared.conns.lock().unwrap().set_arg(conn, arg);
    }

    pub fn get_arg(&self, conn: u8) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.shared.conns.lock().unwrap().get_arg(conn)
    }

    // ---- Byte stream input ---------------------------------------------

    /// Feeds raw bytes straight into the parser on the calling thread.
    /// Only valid when [`Config::input_use_process`] is `true`.
    pub fn process_input(&self, bytes: &[u8]) {
        debug_assert!(self.ring.is_none(), "process_input used in pull mode; call feed_input instead");
        self.push_parser.lock().unwrap().feed(&self.shared, bytes);
    }

    /// Writes raw bytes into the pull-mode ring buffer; the background
    /// parser thread drains them. Returns the number
    /// of bytes actually accepted (the ring buffer may be momentarily full).
    pub fn feed_input(&self, bytes: &[u8]) -> usize {
        match &self.ring {
            Some(ring) => ring.lock().unwrap().write(bytes),
            None => {
                debug_assert!(false, "feed_input used in push mode; call process_input instead");
                0
            }
        }
    }
}

fn spawn_event_thread<O: Os>(os: &O, events: Mailbox<Event>, on_event: impl Fn(Event) + Send + 'static) {
    os.spawn("espat-events", move || loop {
        match events.get(0) {
            Some(event) => {
                IN_CALLBACK.with(|f| f.set(true));
                on_event(event);
                IN_CALLBACK.with(|f| f.set(false));
            }
            None => break,
        }
    });
}

fn spawn_producer_thread<S: Semaphore + 'static, T: Transport + 'static>(
    os: &impl Os,
    shared: Arc<Shared<S, T>>,
    producer: Mailbox<Arc<Request<S>>>,
) {
    os.spawn("espat-producer", move || loop {
        let cmd_timeout_ms = shared.config.cmd_timeout_ms;
        if shared.needs_reinit.swap(false, Ordering::SeqCst) {
            let reinit = Arc::new(Request::new(DefaultCmd::Reset, RequestPayload::None, Completion::FireAndForget));
            run_request(&shared, reinit, cmd_timeout_ms);
            continue;
        }
        match producer.get(200) {
            Some(req) => run_request(&shared, req, cmd_timeout_ms),
            None => continue,
        }
    });
}

fn spawn_poll_thread<S: Semaphore + 'static, T: Transport + 'static>(os: &impl Os, shared: Arc<Shared<S, T>>) {
    os.spawn("espat-poll", move || loop {
        std::thread::sleep(POLL_INTERVAL);
        let active: Vec<u8> = shared.conns.lock().unwrap().active_slots().map(|s| s.number).collect();
        for conn in active {
            shared.publish(Event::Poll { conn });
        }
    });
}

fn spawn_parser_thread<S: Semaphore + 'static, T: Transport + 'static>(
    os: &impl Os,
    shared: Arc<Shared<S, T>>,
    ring: Arc<Mutex<RingBuffer>>,
) {
    os.spawn("espat-parser", move || {
        let mut parser = Parser::new();
        let mut chunk = vec![0u8; PULL_MODE_CHUNK];
        loop {
            let n = ring.lock().unwrap().read(&mut chunk);
            if n == 0 {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            parser.feed(&shared, &chunk[..n]);
        }
    });
}
