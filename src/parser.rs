// Licensed under the MIT license.

//! The byte-stream response parser: a two-mode FSM that
//! turns an arbitrary-boundary byte stream into line-terminated textual
//! responses, the `+IPD`/`+CIPRECVDATA` binary payload markers, and the
//! mid-line `\n> ` prompt. [`Parser::feed`] is the single entry point, fed
//! either by the transport's push callback or by a pull-mode consumer
//! draining the [`RingBuffer`](crate::ringbuf::RingBuffer).

use crate::conn::ConnType;
use crate::error::Error;
use crate::message::{DefaultCmd, TerminalOutcome};
use crate::os::Semaphore;
use crate::pbuf::Pbuf;
use crate::state::{DeviceVariant, Shared};
use crate::transport::Transport;
use std::net::IpAddr;
use std::sync::atomic::Ordering;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Line,
    Ipd,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PromptWatch {
    Idle,
    SawNewline,
    SawGt,
}

struct IpdState {
    conn: u8,
    rem_len: usize,
    ip: Option<IpAddr>,
    port: u16,
    buf: Vec<u8>,
    /// `true` if this payload was framed by `+CIPRECVDATA:` (resolving an
    /// outstanding `CipRecvData` sub-command step), `false` for an
    /// unsolicited auto-receive `+IPD`.
    is_manual_recv: bool,
}

/// Maximum accumulated line length before the buffer is forcibly reset,
/// guarding against an unterminated stream of garbage bytes growing
/// without bound.
const MAX_LINE: usize = 512;

pub struct Parser {
    mode: Mode,
    line: Vec<u8>,
    ipd: Option<IpdState>,
    prompt: PromptWatch,
}

impl Parser {
    pub fn new() -> Self {
        Parser { mode: Mode::Line, line: Vec::with_capacity(128), ipd: None, prompt: PromptWatch::Idle }
    }

    /// Consumes `bytes`, running the FSM and dispatching side effects
    /// (connection table updates, request outputs, events) against
    /// `shared` as it goes.
    pub fn feed<S: Semaphore, T: Transport>(&mut self, shared: &Shared<S, T>, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            match self.mode {
                Mode::Line => {
                    let b = bytes[0];
                    bytes = &bytes[1..];
                    self.push_line_byte(shared, b);
                }
                Mode::Ipd => {
                    let ipd = self.ipd.as_mut().expect("Ipd mode without context");
                    let n = ipd.rem_len.min(bytes.len());
                    if n > 0 {
                        ipd.buf.extend_from_slice(&bytes[..n]);
                        ipd.rem_len -= n;
                        bytes = &bytes[n..];
                    }
                    if ipd.rem_len == 0 {
                        self.finish_ipd(shared);
                    }
                }
            }
        }
    }

    fn push_line_byte<S: Semaphore, T: Transport>(&mut self, shared: &Shared<S, T>, b: u8) {
        // Prompt detection watches the raw byte stream directly, not the
        // line buffer, since "\n> " is mid-line.
        match (self.prompt, b) {
            (PromptWatch::Idle, b'\n') => self.prompt = PromptWatch::SawNewline,
            (PromptWatch::SawNewline, b'>') => self.prompt = PromptWatch::SawGt,
            (PromptWatch::SawGt, b' ') => {
                self.prompt = PromptWatch::Idle;
                self.on_prompt(shared);
                return;
            }
            (_, b'\n') => self.prompt = PromptWatch::SawNewline,
            _ => self.prompt = PromptWatch::Idle,
        }

        if b == b'\n' {
            self.dispatch_line(shared);
            self.line.clear();
            return;
        }

        self.line.push(b);
        if self.line.len() > MAX_LINE {
            self.line.clear();
        }

        if b == b':' && self.line.starts_with(b"+IPD") {
            let prefix = self.take_line_as_str();
            self.begin_ipd(shared, &prefix);
            return;
        }

        if b == b',' && self.line.starts_with(b"+CIPRECVDATA") && self.line.iter().filter(|&&c| c == b',').count() == 3
        {
            let prefix = self.take_line_as_str();
            self.begin_manual_recv(shared, &prefix);
        }
    }

    fn take_line_as_str(&mut self) -> String {
        let s = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        s
    }

    fn dispatch_line<S: Semaphore, T: Transport>(&mut self, shared: &Shared<S, T>) {
        let raw = String::from_utf8_lossy(&self.line).into_owned();
        let line = raw.trim_end_matches(['\r', '\n']).trim();
        if line.is_empty() {
            return;
        }
        handle_line(shared, line);
    }

    fn on_prompt<S: Semaphore, T: Transport>(&mut self, shared: &Shared<S, T>) {
        complete_step(shared, TerminalOutcome::Prompt);
    }

    fn begin_ipd<S: Semaphore, T: Transport>(&mut self, shared: &Shared<S, T>, prefix: &str) {
        match parse_ipd_prefix(prefix) {
            Some((conn, len, ip, port)) => {
                self.mode = Mode::Ipd;
                self.ipd = Some(IpdState {
                    conn,
                    rem_len: len as usize,
                    ip,
                    port,
                    buf: Vec::with_capacity(len as usize),
                    is_manual_recv: false,
                });
                let mut conns = shared.conns.lock().unwrap();
                if let Some(slot) = conns.get_mut(conn) {
                    slot.data_received = true;
                }
            }
            None => log::warn!("malformed +IPD prefix: {:?}", prefix),
        }
    }

    fn begin_manual_recv<S: Semaphore, T: Transport>(&mut self, shared: &Shared<S, T>, prefix: &str) {
        match parse_recvdata_prefix(prefix) {
            Some((len, ip, port)) => {
                let conn = {
                    let outstanding = shared.outstanding.lock().unwrap();
                    outstanding
                        .as_ref()
                        .and_then(|r| match &r.payload {
                            crate::message::RequestPayload::ManualRecv { handle, .. } => Some(handle.number),
                            _ => None,
                        })
                        .unwrap_or(0)
                };
                self.mode = Mode::Ipd;
                self.ipd = Some(IpdState {
                    conn,
                    rem_len: len as usize,
                    ip: Some(ip),
                    port,
                    buf: Vec::with_capacity(len as usize),
                    is_manual_recv: true,
                });
            }
            None => log::warn!("malformed +CIPRECVDATA prefix: {:?}", prefix),
        }
    }

    fn finish_ipd<S: Semaphore, T: Transport>(&mut self, shared: &Shared<S, T>) {
        let ipd = self.ipd.take().expect("finish_ipd without context");
        self.mode = Mode::Line;

        let still_active = {
            let conns = shared.conns.lock().unwrap();
            conns.get(ipd.conn).map(|s| s.active && !s.in_closing).unwrap_or(false)
        };

        if still_active {
            let pbuf = Pbuf::from_slice(&ipd.buf);
            if let Some(ip) = ipd.ip {
                pbuf.set_ip(ip, ipd.port);
            }
            {
                let mut conns = shared.conns.lock().unwrap();
                if let Some(slot) = conns.get_mut(ipd.conn) {
                    slot.total_recved += ipd.buf.len() as u64;
                }
            }
            shared.publish(crate::message::Event::ConnRecv { conn: ipd.conn, pbuf });
        }

        // Only manual-receive framing (`+CIPRECVDATA`) resolves an
        // outstanding `CipRecvData` sub-command step; an auto-receive
        // `+IPD` is unsolicited and must not touch `cmd_sem` or whatever
        // command happens to be in flight.
        if ipd.is_manual_recv {
            if let Some(req) = shared.outstanding.lock().unwrap().as_ref() {
                let mut outputs = req.outputs.lock().unwrap();
                outputs.sent += ipd.buf.len();
            }
            complete_step(shared, TerminalOutcome::Ok);
        }
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Records `outcome` against the currently outstanding request (if any)
/// and wakes the producer task, which waits on this semaphore for the
/// terminal response.
fn complete_step<S: Semaphore, T: Transport>(shared: &Shared<S, T>, outcome: TerminalOutcome) {
    if let Some(req) = shared.outstanding.lock().unwrap().as_ref() {
        req.set_outcome(outcome);
    }
    shared.cmd_sem.release();
}

fn fields_after<'a>(line: &'a str, prefix: &str) -> Option<Vec<&'a str>> {
    line.strip_prefix(prefix).map(|rest| rest.split(',').collect())
}

fn unquote(s: &str) -> &str {
    s.trim().trim_matches('"')
}

fn parse_ipd_prefix(prefix: &str) -> Option<(u8, u32, Option<IpAddr>, u16)> {
    let body = prefix.strip_prefix("+IPD,")?.trim_end_matches(':');
    let parts: Vec<&str> = body.split(',').collect();
    if parts.len() < 2 {
        return None;
    }
    let conn: u8 = parts[0].parse().ok()?;
    let len: u32 = parts[1].parse().ok()?;
    if parts.len() >= 4 {
        let ip: IpAddr = unquote(parts[2]).parse().ok()?;
        let port: u16 = parts[3].parse().ok()?;
        Some((conn, len, Some(ip), port))
    } else {
        Some((conn, len, None, 0))
    }
}

fn parse_recvdata_prefix(prefix: &str) -> Option<(u32, IpAddr, u16)> {
    let body = prefix.strip_prefix("+CIPRECVDATA:")?.trim_end_matches(',');
    let parts: Vec<&str> = body.split(',').collect();
    if parts.len() < 3 {
        return None;
    }
    let len: u32 = parts[0].parse().ok()?;
    let ip: IpAddr = unquote(parts[1]).parse().ok()?;
    let port: u16 = parts[2].parse().ok()?;
    Some((len, ip, port))
}

/// The line-parse dispatch table. Malformed lines are
/// logged and discarded; they never propagate to the host.
fn handle_line<S: Semaphore, T: Transport>(shared: &Shared<S, T>, line: &str) {
    let current_cmd = shared
        .outstanding
        .lock()
        .unwrap()
        .as_ref()
        .map(|r| r.current_cmd())
        .unwrap_or(crate::message::Cmd::Idle);

    if line == "OK" {
        // The bulk-send OK is an interim ack, not the segment's terminal
        // response; the dispatcher waits for the prompt instead.
        if current_cmd == crate::message::Cmd::CipSend {
            return;
        }
        complete_step(shared, TerminalOutcome::Ok);
        return;
    }
    if line == "ERROR" {
        complete_step(shared, TerminalOutcome::Error);
        return;
    }
    if line == "FAIL" {
        complete_step(shared, TerminalOutcome::Fail);
        return;
    }
    if line == "SEND OK" {
        complete_step(shared, TerminalOutcome::SendOk);
        return;
    }
    if line == "SEND FAIL" {
        complete_step(shared, TerminalOutcome::SendFail);
        return;
    }
    if line == "ready" {
        handle_ready(shared);
        return;
    }
    if line == "WIFI CONNECTED" {
        shared.publish(crate::message::Event::WifiConnected);
        return;
    }
    if line == "WIFI DISCONNECT" {
        shared.publish(crate::message::Event::WifiDisconnected);
        return;
    }
    if line == "WIFI GOT IP" {
        shared.publish(crate::message::Event::WifiGotIp);
        return;
    }
    if let Some(rest) = line.strip_prefix("+LINK_CONN:") {
        handle_link_conn(shared, rest);
        return;
    }
    if let Some((n, suffix)) = parse_conn_lifecycle(line) {
        handle_conn_lifecycle(shared, n, suffix);
        return;
    }
    if let Some(rest) = line.strip_prefix("+STA_CONNECTED:") {
        if let Ok(mac) = crate::format::parse_mac(rest) {
            shared.publish(crate::message::Event::StaConnected { mac });
        }
        return;
    }
    if let Some(rest) = line.strip_prefix("+STA_DISCONNECTED:") {
        if let Ok(mac) = crate::format::parse_mac(rest) {
            shared.publish(crate::message::Event::StaDisconnected { mac });
        }
        return;
    }
    if let Some(rest) = line.strip_prefix("+DIST_STA_IP:") {
        let parts: Vec<&str> = rest.split(',').collect();
        if parts.len() == 2 {
            if let (Ok(mac), Ok(ip)) = (crate::format::parse_mac(parts[0]), unquote(parts[1]).parse()) {
                shared.publish(crate::message::Event::DistStaIp { mac, ip });
            }
        }
        return;
    }
    if let Some(rest) = line.strip_prefix("+CWLAP:") {
        handle_cwlap(shared, rest);
        return;
    }
    if let Some(rest) = line.strip_prefix("+CWLIF:") {
        handle_cwlif(shared, rest);
        return;
    }
    if let Some(rest) = line.strip_prefix("+CWJAP:") {
        if let Ok(code) = rest.trim().parse::<u8>() {
            let result = match code {
                1 => crate::message::JoinApResult::ConnTimeout,
                2 => crate::message::JoinApResult::Pass,
                3 => crate::message::JoinApResult::NoAp,
                _ => crate::message::JoinApResult::ConnFail,
            };
            bind_output(shared, move |o| o.join_result = Some(result));
        }
        return;
    }
    if let Some(rest) = strip_cur_def_prefix(line, "+CIPSTA", "ip=") {
        bind_output(shared, |o| o.station_ip = unquote(&rest).parse().ok());
        return;
    }
    if let Some(rest) = strip_cur_def_prefix(line, "+CIPSTA", "gateway=") {
        bind_output(shared, |o| o.station_gateway = unquote(&rest).parse().ok());
        return;
    }
    if let Some(rest) = strip_cur_def_prefix(line, "+CIPSTA", "netmask=") {
        bind_output(shared, |o| o.station_netmask = unquote(&rest).parse().ok());
        return;
    }
    if let Some(rest) = after_colon_of_any(line, &["+CIPSTAMAC_CUR:", "+CIPSTAMAC_DEF:", "+CIPSTAMAC:"]) {
        if let Ok(mac) = crate::format::parse_mac(rest) {
            bind_output(shared, move |o| o.station_mac = Some(mac));
        }
        return;
    }
    if let Some(rest) = after_colon_of_any(line, &["+CIPAPMAC_CUR:", "+CIPAPMAC_DEF:", "+CIPAPMAC:"]) {
        if let Ok(mac) = crate::format::parse_mac(rest) {
            bind_output(shared, move |o| o.ap_mac = Some(mac));
        }
        return;
    }
    if let Some(rest) = after_colon_of_any(line, &["+CWHOSTNAME:"]) {
        let name = unquote(rest).to_string();
        bind_output(shared, move |o| o.hostname = Some(name.clone()));
        return;
    }
    if let Some(rest) = after_colon_of_any(line, &["+CIPDOMAIN:"]) {
        if let Ok(ip) = unquote(rest).parse::<IpAddr>() {
            bind_output(shared, move |o| o.dns_ip = Some(ip));
        }
        return;
    }
    if let Some(rest) = after_colon_of_any(line, &["+PING:"]) {
        if let Ok(ms) = rest.trim().parse::<u32>() {
            bind_output(shared, move |o| o.ping_ms = Some(ms));
        }
        return;
    }
    if let Some(rest) = after_colon_of_any(line, &["+CIPSNTPTIME:"]) {
        let datetime = rest.trim().to_string();
        bind_output(shared, move |o| o.sntp_time = Some(datetime.clone()));
        return;
    }
    if let Some(rest) = after_colon_of_any(line, &["+CIPRECVLEN:"]) {
        if let Some(len) = rest.split(',').next().and_then(|s| s.trim().parse::<usize>().ok()) {
            bind_output(shared, move |o| o.recv_len = Some(len));
            if let Some(req) = shared.outstanding.lock().unwrap().as_ref() {
                if let crate::message::RequestPayload::ManualRecv { handle, .. } = &req.payload {
                    if let Some(slot) = shared.conns.lock().unwrap().get_mut(handle.number) {
                        slot.tcp_available_bytes = len as u32;
                    }
                }
            }
        }
        return;
    }
    if let Some(rest) = after_colon_of_any(line, &["AT version:"]) {
        *shared.variant.lock().unwrap() = DeviceVariant::from_banner(rest);
        return;
    }
    if let Some(rest) = after_colon_of_any(line, &["ERR CODE:"]) {
        let code = rest.trim().to_string();
        log::warn!("device reported ERR CODE:{}", code);
        if let Some(req) = shared.outstanding.lock().unwrap().as_ref() {
            req.set_err_subcode(code);
        }
        return;
    }

    log::debug!("unrecognised response line: {:?}", line);
}

fn after_colon_of_any<'a>(line: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|p| line.strip_prefix(p))
}

/// Tolerates the `_CUR`/`_DEF` firmware-version suffix variance.
fn strip_cur_def_prefix(line: &str, base: &str, field: &str) -> Option<String> {
    for suffix in ["_CUR:", "_DEF:", ":"] {
        let full = format!("{}{}", base, suffix);
        if let Some(rest) = line.strip_prefix(&full) {
            if let Some(value) = rest.strip_prefix(field) {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn bind_output<S: Semaphore, T: Transport>(shared: &Shared<S, T>, f: impl FnOnce(&mut crate::message::RequestOutputs)) {
    if let Some(req) = shared.outstanding.lock().unwrap().as_ref() {
        f(&mut req.outputs.lock().unwrap());
    }
}

fn handle_cwlap<S: Semaphore, T: Transport>(shared: &Shared<S, T>, rest: &str) {
    let rest = rest.trim_start_matches('(').trim_end_matches(')');
    let parts: Vec<&str> = rest.splitn(5, ',').collect();
    if parts.len() < 5 {
        log::debug!("malformed +CWLAP line: {:?}", rest);
        return;
    }
    let ecn: u8 = match parts[0].parse() {
        Ok(v) => v,
        Err(_) => return,
    };
    let ssid = unquote(parts[1]).to_string();
    let rssi: i32 = match parts[2].parse() {
        Ok(v) => v,
        Err(_) => return,
    };
    let mac = crate::format::parse_mac(parts[3]).ok();
    let channel: u8 = parts[4].split(',').next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let info = crate::conn::ApInfo { ecn, ssid, rssi, mac, channel };
    bind_output(shared, move |o| o.ap_list.push(info));
}

/// `+CWLIF:<ip>,<mac>` — one connected station per AP-mode client.
fn handle_cwlif<S: Semaphore, T: Transport>(shared: &Shared<S, T>, rest: &str) {
    let parts: Vec<&str> = rest.splitn(2, ',').collect();
    if parts.len() != 2 {
        log::debug!("malformed +CWLIF line: {:?}", rest);
        return;
    }
    let ip: IpAddr = match unquote(parts[0]).parse() {
        Ok(v) => v,
        Err(_) => return,
    };
    let mac = match crate::format::parse_mac(parts[1]) {
        Ok(v) => v,
        Err(_) => return,
    };
    bind_output(shared, move |o| o.stations.push((ip, mac)));
}

fn handle_ready<S: Semaphore, T: Transport>(shared: &Shared<S, T>) {
    let expecting_ready = shared
        .outstanding
        .lock()
        .unwrap()
        .as_ref()
        .map(|r| r.current_cmd() == crate::message::Cmd::Rst || r.current_cmd() == crate::message::Cmd::Restore)
        .unwrap_or(false);

    if expecting_ready {
        complete_step(shared, TerminalOutcome::Ready);
        return;
    }

    // Unsolicited `ready` outside a reset/restore command: the device
    // spontaneously reset.
    log::warn!("unsolicited `ready` — device reset detected");
    shared.publish(crate::message::Event::ResetDetected { forced: false });

    let mut conns = shared.conns.lock().unwrap();
    let active: Vec<u8> = conns.active_slots().map(|s| s.number).collect();
    for n in active {
        conns.deactivate(n);
        shared.publish(crate::message::Event::ConnClosed { conn: n, forced: false, result: Err(Error::Closed) });
    }
    drop(conns);

    if let Some(req) = shared.outstanding.lock().unwrap().take() {
        req.complete(Err(Error::Error { details: "unsolicited device reset" }));
    }
    shared.needs_reinit.store(true, Ordering::SeqCst);
    shared.cmd_sem.release();
}

fn handle_link_conn<S: Semaphore, T: Transport>(shared: &Shared<S, T>, rest: &str) {
    let parts: Vec<&str> = rest.split(',').collect();
    if parts.len() < 2 {
        log::debug!("malformed +LINK_CONN line: {:?}", rest);
        return;
    }
    let status: u8 = match parts[0].parse() {
        Ok(v) => v,
        Err(_) => return,
    };
    let n: u8 = match parts[1].parse() {
        Ok(v) => v,
        Err(_) => return,
    };

    if status != 0 {
        let mut conns = shared.conns.lock().unwrap();
        if conns.is_active(n) {
            conns.deactivate(n);
            drop(conns);
            shared.publish(crate::message::Event::ConnClosed { conn: n, forced: true, result: Err(Error::ConnFail) });
        }
        return;
    }

    let conn_type = parts.get(2).and_then(|s| ConnType::from_at_str(s)).unwrap_or(ConnType::Tcp);
    let is_server = parts.get(3).map(|s| *s == "1").unwrap_or(false);
    let ip: Option<IpAddr> = parts.get(4).and_then(|s| unquote(s).parse().ok());
    let port: u16 = parts.get(5).and_then(|s| s.parse().ok()).unwrap_or(0);
    let local_port: u16 = parts.get(6).and_then(|s| s.parse().ok()).unwrap_or(0);

    let handle = {
        let mut conns = shared.conns.lock().unwrap();
        conns.activate(n, conn_type, is_server, ip, port, local_port)
    };
    if let Some(handle) = handle {
        if let Some(req) = shared.outstanding.lock().unwrap().as_ref() {
            if req.default_cmd == DefaultCmd::ConnOpen {
                req.outputs.lock().unwrap().conn_handle = Some(handle);
            }
        }
        shared.publish(crate::message::Event::ConnActive { conn: n, remote: ip.map(|ip| (ip, port)) });
    }
}

fn parse_conn_lifecycle(line: &str) -> Option<(u8, &'static str)> {
    let (num, suffix) = line.split_once(',')?;
    let n: u8 = num.parse().ok()?;
    if suffix == "CLOSED" {
        Some((n, "CLOSED"))
    } else if suffix == "CONNECT FAIL" {
        Some((n, "CONNECT FAIL"))
    } else {
        None
    }
}

fn handle_conn_lifecycle<S: Semaphore, T: Transport>(shared: &Shared<S, T>, n: u8, suffix: &str) {
    let was_active = shared.conns.lock().unwrap().is_active(n);
    if !was_active && suffix == "CLOSED" {
        return;
    }
    let requested_close = shared
        .outstanding
        .lock()
        .unwrap()
        .as_ref()
        .map(|r| match &r.payload {
            crate::message::RequestPayload::ConnClose { handle } => handle.number == n,
            _ => false,
        })
        .unwrap_or(false);

    shared.conns.lock().unwrap().deactivate(n);
    let result = if suffix == "CONNECT FAIL" { Err(Error::ConnFail) } else { Ok(()) };
    shared.publish(crate::message::Event::ConnClosed { conn: n, forced: !requested_close, result });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::os::{Mailbox, StdSemaphore};
    use crate::transport::LoopbackTransport;
    use std::sync::Arc;

    fn new_shared() -> (Shared<StdSemaphore, LoopbackTransport>, Mailbox<crate::message::Event>) {
        let events: Mailbox<crate::message::Event> = Mailbox::new(32);
        let sender = events.sender();
        let shared = Shared::new(Config::default(), LoopbackTransport::new(), Arc::new(StdSemaphore::new(0)), sender);
        (shared, events)
    }

    #[test]
    fn link_conn_activates_slot_and_raises_event() {
        let (shared, events) = new_shared();
        let mut parser = Parser::new();
        parser.feed(&shared, b"+LINK_CONN:0,0,\"TCP\",0,\"93.184.216.34\",80,54321\r\n");
        assert!(shared.conns.lock().unwrap().is_active(0));
        match events.get(0) {
            Some(crate::message::Event::ConnActive { conn, remote }) => {
                assert_eq!(conn, 0);
                assert_eq!(remote, Some(("93.184.216.34".parse().unwrap(), 80)));
            }
            other => panic!("unexpected event: {:?}", other.is_some()),
        }
    }

    #[test]
    fn ipd_split_across_feeds_produces_one_event() {
        let (shared, events) = new_shared();
        shared.conns.lock().unwrap().activate(0, ConnType::Tcp, false, None, 0, 0);
        let mut parser = Parser::new();
        parser.feed(&shared, b"+IPD,0,10,\"1.2.3.4\",1000:01234");
        parser.feed(&shared, b"56789");
        match events.get(0) {
            Some(crate::message::Event::ConnRecv { conn, pbuf }) => {
                assert_eq!(conn, 0);
                assert_eq!(pbuf.length(), 10);
                let mut out = vec![0u8; 10];
                pbuf.copy(&mut out, 10, 0);
                assert_eq!(&out, b"0123456789");
                assert_eq!(pbuf.port(), 1000);
            }
            other => panic!("unexpected event: {:?}", other.is_some()),
        }
    }

    #[test]
    fn cipsend_ok_is_suppressed_then_prompt_releases_sem() {
        let (shared, _events) = new_shared();
        let req = Arc::new(crate::message::Request::new(
            DefaultCmd::ConnSend,
            crate::message::RequestPayload::None,
            crate::message::Completion::FireAndForget,
        ));
        req.set_current_cmd(crate::message::Cmd::CipSend);
        *shared.outstanding.lock().unwrap() = Some(req.clone());
        let mut parser = Parser::new();
        parser.feed(&shared, b"\r\nOK\r\n");
        assert!(req.take_outcome().is_none());
        parser.feed(&shared, b"\n> ");
        assert_eq!(req.take_outcome(), Some(TerminalOutcome::Prompt));
    }

    #[test]
    fn connect_lifecycle_closed_deactivates_and_marks_forced() {
        let (shared, events) = new_shared();
        shared.conns.lock().unwrap().activate(2, ConnType::Tcp, false, None, 0, 0);
        let mut parser = Parser::new();
        parser.feed(&shared, b"2,CLOSED\r\n");
        assert!(!shared.conns.lock().unwrap().is_active(2));
        match events.get(0) {
            Some(crate::message::Event::ConnClosed { conn, forced, .. }) => {
                assert_eq!(conn, 2);
                assert!(forced);
            }
            other => panic!("unexpected event: {:?}", other.is_some()),
        }
    }

    #[test]
    fn cwlap_line_appends_to_outstanding_output() {
        let (shared, _events) = new_shared();
        let req = Arc::new(crate::message::Request::new(
            DefaultCmd::ListAp,
            crate::message::RequestPayload::None,
            crate::message::Completion::FireAndForget,
        ));
        *shared.outstanding.lock().unwrap() = Some(req.clone());
        let mut parser = Parser::new();
        parser.feed(&shared, b"+CWLAP:(3,\"home-ap\",-45,\"aa:bb:cc:dd:ee:ff\",6)\r\n");
        let outputs = req.outputs.lock().unwrap();
        assert_eq!(outputs.ap_list.len(), 1);
        assert_eq!(outputs.ap_list[0].ssid, "home-ap");
        assert_eq!(outputs.ap_list[0].rssi, -45);
    }

    #[test]
    fn unsolicited_ready_closes_connections_and_flags_reinit() {
        let (shared, events) = new_shared();
        shared.conns.lock().unwrap().activate(0, ConnType::Tcp, false, None, 0, 0);
        let mut parser = Parser::new();
        parser.feed(&shared, b"ready\r\n");
        assert!(!shared.conns.lock().unwrap().is_active(0));
        assert!(shared.needs_reinit.load(Ordering::SeqCst));
        let mut saw_reset_detected = false;
        while let Some(ev) = events.get(0) {
            if let crate::message::Event::ResetDetected { forced: false } = ev {
                saw_reset_detected = true;
            }
        }
        assert!(saw_reset_detected);
    }

    #[test]
    fn auto_ipd_does_not_resolve_an_unrelated_outstanding_command() {
        let (shared, _events) = new_shared();
        shared.conns.lock().unwrap().activate(0, ConnType::Tcp, false, None, 0, 0);
        let req = Arc::new(crate::message::Request::new(
            DefaultCmd::Reset,
            crate::message::RequestPayload::None,
            crate::message::Completion::FireAndForget,
        ));
        req.set_current_cmd(crate::message::Cmd::Gmr);
        *shared.outstanding.lock().unwrap() = Some(req.clone());
        let mut parser = Parser::new();
        parser.feed(&shared, b"+IPD,0,5,\"1.2.3.4\",1000:hello");
        assert!(req.take_outcome().is_none());
        assert!(!shared.cmd_sem.wait(1), "unsolicited +IPD must not release cmd_sem");
    }

    #[test]
    fn manual_recv_ipd_resolves_step_and_accounts_bytes() {
        let (shared, _events) = new_shared();
        let handle = shared.conns.lock().unwrap().activate(0, ConnType::Tcp, false, None, 0, 0).unwrap();
        let req = Arc::new(crate::message::Request::new(
            DefaultCmd::ManualRecv,
            crate::message::RequestPayload::ManualRecv { handle, len: 10 },
            crate::message::Completion::FireAndForget,
        ));
        req.set_current_cmd(crate::message::Cmd::CipRecvData);
        *shared.outstanding.lock().unwrap() = Some(req.clone());
        let mut parser = Parser::new();
        parser.feed(&shared, b"+CIPRECVDATA:5,\"1.2.3.4\",1000,hello");
        assert_eq!(req.take_outcome(), Some(TerminalOutcome::Ok));
        assert_eq!(req.outputs.lock().unwrap().sent, 5);
    }

    #[test]
    fn malformed_cwlap_line_is_discarded_not_propagated() {
        let (shared, _events) = new_shared();
        let req = Arc::new(crate::message::Request::new(
            DefaultCmd::ListAp,
            crate::message::RequestPayload::None,
            crate::message::Completion::FireAndForget,
        ));
        *shared.outstanding.lock().unwrap() = Some(req.clone());
        let mut parser = Parser::new();
        parser.feed(&shared, b"+CWLAP:(garbage)\r\n");
        assert!(req.outputs.lock().unwrap().ap_list.is_empty());
    }
}
