// Licensed under the MIT license.

//! The connection table: a fixed-capacity
//! array of slots, each carrying a monotonic validation id that defeats
//! stale send/close requests when a slot index is reused for a new
//! connection.

use eui48::MacAddress;
use std::any::Any;
use std::net::IpAddr;
use std::sync::Arc;

/// Socket family/transport pairing understood by `CIPSTART`/`CIPSTARTEX`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnType {
    Tcp,
    Udp,
    Ssl,
    TcpV6,
    UdpV6,
    SslV6,
}

impl ConnType {
    /// The string literal `CIPSTART`/`CIPSTARTEX` expects for this type.
    pub fn as_at_str(self) -> &'static str {
        match self {
            ConnType::Tcp => "TCP",
            ConnType::Udp => "UDP",
            ConnType::Ssl => "SSL",
            ConnType::TcpV6 => "TCPv6",
            ConnType::UdpV6 => "UDPv6",
            ConnType::SslV6 => "SSLv6",
        }
    }

    pub fn from_at_str(s: &str) -> Option<ConnType> {
        match s.trim_matches('"') {
            "TCP" => Some(ConnType::Tcp),
            "UDP" => Some(ConnType::Udp),
            "SSL" => Some(ConnType::Ssl),
            "TCPv6" => Some(ConnType::TcpV6),
            "UDPv6" => Some(ConnType::UdpV6),
            "SSLv6" => Some(ConnType::SslV6),
            _ => None,
        }
    }

    pub fn is_udp(self) -> bool {
        matches!(self, ConnType::Udp | ConnType::UdpV6)
    }
}

/// One access point result row from `+CWLAP:(…)`.
#[derive(Clone, Debug, PartialEq)]
pub struct ApInfo {
    pub ecn: u8,
    pub ssid: String,
    pub rssi: i32,
    pub mac: Option<MacAddress>,
    pub channel: u8,
}

/// A stable `(slot index, validation id)` pair — the only externally
/// meaningful identity of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnHandle {
    pub number: u8,
    pub validation_id: u16,
}

/// A write-staging buffer for a bulk `CIPSEND`, chunked to
/// `conn_max_data_len` segments as the dispatcher drains it.
#[derive(Default)]
pub struct SendStaging {
    pub data: Vec<u8>,
    pub sent: usize,
    pub dst: Option<(IpAddr, u16)>,
    pub retries: u8,
}

impl SendStaging {
    pub fn remaining(&self) -> usize {
        self.data.len() - self.sent
    }

    pub fn next_chunk(&self, max_len: usize) -> &[u8] {
        let end = (self.sent + max_len).min(self.data.len());
        &self.data[self.sent..end]
    }
}

/// One slot of the connection table.
pub struct ConnSlot {
    pub number: u8,
    pub active: bool,
    pub conn_type: ConnType,
    pub remote_ip: Option<IpAddr>,
    pub remote_port: u16,
    pub local_port: u16,
    pub validation_id: u16,
    pub is_client: bool,
    pub is_server: bool,
    pub in_closing: bool,
    pub data_received: bool,
    pub total_recved: u64,
    pub tcp_not_ack_bytes: u32,
    pub tcp_available_bytes: u32,
    pub send: Option<SendStaging>,
    /// Opaque per-connection user context set and read via `set_arg`/
    /// `get_arg`; a type-erased handle standing in for a raw `void*`.
    pub user_arg: Option<Arc<dyn Any + Send + Sync>>,
}

impl ConnSlot {
    fn new(number: u8) -> Self {
        ConnSlot {
            number,
            active: false,
            conn_type: ConnType::Tcp,
            remote_ip: None,
            remote_port: 0,
            local_port: 0,
            validation_id: 0,
            is_client: false,
            is_server: false,
            in_closing: false,
            data_received: false,
            total_recved: 0,
            tcp_not_ack_bytes: 0,
            tcp_available_bytes: 0,
            send: None,
            user_arg: None,
        }
    }

    pub fn handle(&self) -> ConnHandle {
        ConnHandle { number: self.number, validation_id: self.validation_id }
    }

    /// Bumps the validation id on activation. Wraps to `1`, never `0`.
    fn bump_validation_id(&mut self) {
        self.validation_id = match self.validation_id.checked_add(1) {
            Some(0) | None => 1,
            Some(v) => v,
        };
    }

    fn reset(&mut self) {
        let number = self.number;
        *self = ConnSlot::new(number);
    }
}

/// Owns the slot array; `open`/`close`/`send`/etc. are
/// implemented here, called by the dispatcher once it has decided a
/// `Request` is ready to run against a particular slot.
pub struct ConnTable {
    slots: Vec<ConnSlot>,
}

impl ConnTable {
    pub fn new(max_conns: usize) -> Self {
        let slots = (0..max_conns as u8).map(ConnSlot::new).collect();
        ConnTable { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, n: u8) -> Option<&ConnSlot> {
        self.slots.get(n as usize)
    }

    pub fn get_mut(&mut self, n: u8) -> Option<&mut ConnSlot> {
        self.slots.get_mut(n as usize)
    }

    pub fn is_active(&self, n: u8) -> bool {
        self.get(n).map(|s| s.active).unwrap_or(false)
    }

    pub fn is_closed(&self, n: u8) -> bool {
        !self.is_active(n)
    }

    pub fn is_client(&self, n: u8) -> bool {
        self.get(n).map(|s| s.is_client).unwrap_or(false)
    }

    pub fn is_server(&self, n: u8) -> bool {
        self.get(n).map(|s| s.is_server).unwrap_or(false)
    }

    /// `true` iff `handle` names a slot that is still active with the same
    /// validation id it was issued against.
    pub fn is_current(&self, handle: ConnHandle) -> bool {
        match self.get(handle.number) {
            Some(s) => s.active && s.validation_id == handle.validation_id,
            None => false,
        }
    }

    /// First unused slot, for a client-initiated open that has not yet been
    /// told which index the device assigned (single-connection mode) or to
    /// pre-reserve one in multiplex mode.
    pub fn first_free(&self) -> Option<u8> {
        self.slots.iter().find(|s| !s.active).map(|s| s.number)
    }

    /// Activates (or re-activates) a slot on `+LINK_CONN:`, bumping its
    /// validation id and returning the new handle.
    pub fn activate(
        &mut self,
        n: u8,
        conn_type: ConnType,
        is_server: bool,
        remote_ip: Option<IpAddr>,
        remote_port: u16,
        local_port: u16,
    ) -> Option<ConnHandle> {
        let slot = self.get_mut(n)?;
        slot.reset();
        slot.active = true;
        slot.conn_type = conn_type;
        slot.is_server = is_server;
        slot.is_client = !is_server;
        slot.remote_ip = remote_ip;
        slot.remote_port = remote_port;
        slot.local_port = local_port;
        slot.bump_validation_id();
        Some(slot.handle())
    }

    /// Tears a slot down on `<n>,CLOSED` / `<n>,CONNECT FAIL`. The slot
    /// stays inactive until the next `+LINK_CONN:` reuses it; identity is
    /// preserved only by the (now stale) validation id.
    pub fn deactivate(&mut self, n: u8) {
        if let Some(slot) = self.get_mut(n) {
            slot.active = false;
            slot.in_closing = false;
            slot.send = None;
        }
    }

    pub fn begin_closing(&mut self, n: u8) -> bool {
        match self.get_mut(n) {
            Some(s) if s.active && !s.in_closing => {
                s.in_closing = true;
                true
            }
            _ => false,
        }
    }

    pub fn active_slots(&self) -> impl Iterator<Item = &ConnSlot> {
        self.slots.iter().filter(|s| s.active)
    }

    /// Binds an opaque user context to a slot.
    pub fn set_arg(&mut self, n: u8, arg: Arc<dyn Any + Send + Sync>) {
        if let Some(slot) = self.get_mut(n) {
            slot.user_arg = Some(arg);
        }
    }

    pub fn get_arg(&self, n: u8) -> Option<Arc<dyn Any + Send + Sync>> {
        self.get(n).and_then(|s| s.user_arg.clone())
    }

    pub fn clear_all(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.reset();
        }
    }
}
