// Licensed under the MIT license.

//! Shared engine state: the
//! connection table, the outstanding request pointer, and the producer/
//! parser rendezvous semaphore, all reachable from both long-lived tasks
//! behind one lock apiece — never one lock for everything, so the parser
//! task updating `conns` does not contend with a producer task merely
//! checking `variant`.

use crate::conn::ConnTable;
use crate::config::Config;
use crate::message::{Event, Request};
use crate::os::{MailboxSender, Semaphore};
use crate::transport::Transport;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

/// Device firmware family, detected once from the `GMR` banner. Selects
/// which AT verb names a status query (`CIPSTATUS` vs `CIPSTATE`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceVariant {
    /// ESP8266 / early ESP32 SDKs: status query is `CIPSTATUS`.
    Legacy,
    /// ESP32-C2/C3/C6 and newer SDKs: status query is `CIPSTATE`.
    Modern,
}

impl DeviceVariant {
    /// Looks up the variant from a fragment of the `AT version`/`SDK
    /// version` banner. Unknown banners default to `Legacy` since
    /// `CIPSTATUS` is understood by every firmware generation.
    pub fn from_banner(banner: &str) -> DeviceVariant {
        let upper = banner.to_ascii_uppercase();
        if upper.contains("ESP32-C2") || upper.contains("ESP32-C3") || upper.contains("ESP32-C6") {
            DeviceVariant::Modern
        } else {
            DeviceVariant::Legacy
        }
    }

    pub fn status_query_suffix(self) -> &'static str {
        match self {
            DeviceVariant::Legacy => "+CIPSTATUS",
            DeviceVariant::Modern => "+CIPSTATE?",
        }
    }
}

/// Everything both the producer task and the parser task touch.
pub struct Shared<S: Semaphore, T: Transport> {
    pub conns: Mutex<ConnTable>,
    pub outstanding: Mutex<Option<Arc<Request<S>>>>,
    pub cmd_sem: Arc<S>,
    pub variant: Mutex<DeviceVariant>,
    pub transport: Mutex<T>,
    pub config: Config,
    pub events: MailboxSender<Event>,
    /// Set by the parser when it sees an unsolicited `ready`; the producer
    /// task checks this before pulling its next request and, if set, runs
    /// the reset sub-command sequence before anything else.
    pub needs_reinit: AtomicBool,
}

impl<S: Semaphore, T: Transport> Shared<S, T> {
    pub fn new(config: Config, transport: T, cmd_sem: Arc<S>, events: MailboxSender<Event>) -> Self {
        Shared {
            conns: Mutex::new(ConnTable::new(config.max_conns)),
            outstanding: Mutex::new(None),
            cmd_sem,
            variant: Mutex::new(DeviceVariant::Legacy),
            transport: Mutex::new(transport),
            config,
            events,
            needs_reinit: AtomicBool::new(false),
        }
    }

    /// Writes one AT frame to the transport: `"AT" <suffix> <CR><LF>`,
    /// then a flush hint.
    pub fn emit_at(&self, suffix: &str) {
        let mut transport = self.transport.lock().unwrap();
        let mut line = String::with_capacity(suffix.len() + 4);
        line.push_str("AT");
        line.push_str(suffix);
        line.push_str("\r\n");
        transport.send(line.as_bytes());
        transport.send(&[]);
    }

    /// Writes raw bytes with no framing, used for `CIPSEND` payload
    /// segments once the `\n> ` prompt has been seen.
    pub fn emit_raw(&self, bytes: &[u8]) {
        let mut transport = self.transport.lock().unwrap();
        transport.send(bytes);
        transport.send(&[]);
    }

    pub fn publish(&self, event: Event) {
        self.events.put(event);
    }
}
