// Licensed under the MIT license.

//! The `Request`/`Event` sum types. A
//! `Request` is a discriminated union carrying the default command, the
//! sub-command currently in flight, a step counter, a typed payload and a
//! completion mechanism; `Event` is the uniform per-family completion
//! surface the dispatcher raises to the host callback.
//!
//! Each variant of [`RequestPayload`] carries its own typed fields rather
//! than a single `void*` user argument shared across command kinds.

use crate::conn::{ApInfo, ConnHandle, ConnType};
use crate::error::{Error, Result};
use crate::os::Semaphore;
use eui48::MacAddress;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

/// The user-facing operation a [`Request`] represents — its *default
/// command*.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefaultCmd {
    Reset,
    Restore,
    JoinAp,
    ListAp,
    QuitAp,
    ApInfo,
    SoftApConfig,
    ListStations,
    Hostname,
    Ping,
    Dns,
    SntpConfig,
    SntpQuery,
    ConnOpen,
    ConnSend,
    ConnClose,
    ServerStart,
    ServerStop,
    ManualRecv,
    Passthrough,
}

/// One AT verb emitted on the wire; the *current command* of a `Request`.
/// `Idle` is the sentinel `next()` returns to end a sub-command sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cmd {
    Idle,
    Rst,
    AtE,
    Gmr,
    SysMsgCur,
    Rfpower,
    CwMode,
    CwDhcpQ,
    CipMux,
    CipRecvMode,
    CwLapOpt,
    CipStatusOrState,
    CipApQ,
    CipApMacQ,
    CipDinfo,
    CwJap,
    CipStaQ,
    CipStaMacQ,
    CwQap,
    CwSap,
    CwLif,
    CwHostname,
    CwLap,
    CipStart,
    CipSend,
    CipSendWait,
    CipClose,
    CipServerMaxConn,
    CipServer,
    CipSto,
    CipRecvLen,
    CipRecvData,
    CipDomain,
    Ping,
    CipSntpCfg,
    CipSntpTime,
    Restore,
    Passthrough,
}

/// Outcome of joining an access point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinApResult {
    Ok,
    ConnTimeout,
    Pass,
    NoAp,
    ConnFail,
}

/// Typed, per-command input payload — a sum type in place of a single
/// `void*` user argument.
pub enum RequestPayload {
    None,
    JoinAp { ssid: String, password: String },
    ListAp { ssid_filter: Option<String> },
    SoftApConfig { ssid: String, password: String, channel: u8, ecn: u8 },
    Hostname(Option<String>),
    Ping(String),
    Dns(String),
    SntpConfig { enable: bool, timezone: i8 },
    ConnOpen { conn_type: ConnType, host: String, port: u16, local_port: u16, keepalive: u16 },
    ConnSend { handle: ConnHandle, data: Vec<u8>, dst: Option<(IpAddr, u16)> },
    ConnClose { handle: ConnHandle },
    ServerStart { port: u16, max_conn: u8, timeout_s: u16 },
    ServerStop,
    ManualRecv { handle: ConnHandle, len: usize },
    Passthrough(String),
}

/// Output slots a sub-command sequence fills in as terminal/unsolicited
/// lines arrive and matching getter lines bind their values in.
#[derive(Default)]
pub struct RequestOutputs {
    pub ap_list: Vec<ApInfo>,
    pub ap_info: Option<ApInfo>,
    pub station_ip: Option<IpAddr>,
    pub station_gateway: Option<IpAddr>,
    pub station_netmask: Option<IpAddr>,
    pub station_mac: Option<MacAddress>,
    pub ap_mac: Option<MacAddress>,
    pub hostname: Option<String>,
    pub dns_ip: Option<IpAddr>,
    pub ping_ms: Option<u32>,
    pub sntp_time: Option<String>,
    pub recv_len: Option<usize>,
    pub sent: usize,
    pub conn_handle: Option<ConnHandle>,
    pub join_result: Option<JoinApResult>,
    /// `+CWLIF:<ip>,<mac>` rows of AP-mode connected stations.
    pub stations: Vec<(IpAddr, MacAddress)>,
}

/// How the caller wants to be notified of completion: a per-request
/// completion semaphore to block on, or a flag marking fire-and-forget.
pub enum Completion<S: Semaphore> {
    Blocking(Arc<S>),
    FireAndForget,
}

/// What the parser observed for the request currently in flight, read back
/// by the producer task after it wakes from the shared `cmd_sem`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalOutcome {
    Ok,
    Error,
    Fail,
    Ready,
    Prompt,
    SendOk,
    SendFail,
}

/// A queued unit of work. Owned by the caller
/// until enqueued, then by the producer task until completion.
pub struct Request<S: Semaphore> {
    pub default_cmd: DefaultCmd,
    pub current_cmd: Mutex<Cmd>,
    pub step: Mutex<u32>,
    pub payload: RequestPayload,
    pub outputs: Mutex<RequestOutputs>,
    pub completion: Completion<S>,
    pub result: Mutex<Option<Result<()>>>,
    pub last_outcome: Mutex<Option<TerminalOutcome>>,
    /// The hex subcode of the most recent unsolicited `ERR CODE:` line seen
    /// while this request was outstanding. `ERR CODE:0x01090000` maps to
    /// [`crate::error::Error::CommandNotSupported`].
    pub err_subcode: Mutex<Option<String>>,
}

impl<S: Semaphore> Request<S> {
    pub fn new(default_cmd: DefaultCmd, payload: RequestPayload, completion: Completion<S>) -> Self {
        Request {
            default_cmd,
            current_cmd: Mutex::new(Cmd::Idle),
            step: Mutex::new(0),
            payload,
            outputs: Mutex::new(RequestOutputs::default()),
            completion,
            result: Mutex::new(None),
            last_outcome: Mutex::new(None),
            err_subcode: Mutex::new(None),
        }
    }

    pub fn set_err_subcode(&self, code: String) {
        *self.err_subcode.lock().unwrap() = Some(code);
    }

    pub fn take_err_subcode(&self) -> Option<String> {
        self.err_subcode.lock().unwrap().take()
    }

    /// Records what the parser observed for the terminal response it just
    /// read, called from the parser task before it releases `cmd_sem`.
    pub fn set_outcome(&self, outcome: TerminalOutcome) {
        *self.last_outcome.lock().unwrap() = Some(outcome);
    }

    /// Consumes the recorded outcome; the producer task calls this exactly
    /// once per sub-command step after waking from `cmd_sem`.
    pub fn take_outcome(&self) -> Option<TerminalOutcome> {
        self.last_outcome.lock().unwrap().take()
    }

    pub fn current_cmd(&self) -> Cmd {
        *self.current_cmd.lock().unwrap()
    }

    pub fn set_current_cmd(&self, cmd: Cmd) {
        *self.current_cmd.lock().unwrap() = cmd;
    }

    pub fn step(&self) -> u32 {
        *self.step.lock().unwrap()
    }

    pub fn advance_step(&self) -> u32 {
        let mut step = self.step.lock().unwrap();
        *step += 1;
        *step
    }

    /// Records the terminal result and wakes a blocking waiter, if any.
    pub fn complete(&self, result: Result<()>) {
        *self.result.lock().unwrap() = Some(result);
        if let Completion::Blocking(sem) = &self.completion {
            sem.release();
        }
    }

    pub fn take_result(&self) -> Result<()> {
        self.result.lock().unwrap().clone().unwrap_or(Err(Error::Error { details: "no result recorded" }))
    }
}

/// The uniform per-family completion surface.
#[derive(Clone)]
pub enum Event {
    Reset { result: Result<()> },
    Restore { result: Result<()> },
    ResetDetected { forced: bool },
    StaJoinAp { result: JoinApResult },
    StaListAp { list: Vec<ApInfo>, result: Result<()> },
    StaInfoAp { info: Option<ApInfo>, result: Result<()> },
    Ping { host: String, time_ms: Option<u32>, result: Result<()> },
    DnsHostByName { host: String, ip: Option<IpAddr>, result: Result<()> },
    SntpTime { datetime: Option<String>, result: Result<()> },
    ConnActive { conn: u8, remote: Option<(IpAddr, u16)> },
    ConnError { host: String, port: u16, conn_type: ConnType, err: Error },
    ConnSend { conn: u8, sent: usize, result: Result<()> },
    ConnClosed { conn: u8, forced: bool, result: Result<()> },
    ConnRecv { conn: u8, pbuf: crate::pbuf::Pbuf },
    Server { enabled: bool, port: u16, result: Result<()> },
    StaConnected { mac: MacAddress },
    StaDisconnected { mac: MacAddress },
    DistStaIp { mac: MacAddress, ip: IpAddr },
    WifiConnected,
    WifiDisconnected,
    WifiGotIp,
    /// Connected-station list (`CWLIF`), an extra command family beyond
    /// the core per-family completion table.
    StationList { list: Vec<(IpAddr, MacAddress)>, result: Result<()> },
    /// Raised every 500 ms for each active connection slot by the poll
    /// timer.
    Poll { conn: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::StdSemaphore;

    #[test]
    fn fire_and_forget_complete_does_not_panic_without_semaphore() {
        let req: Request<StdSemaphore> =
            Request::new(DefaultCmd::Reset, RequestPayload::None, Completion::FireAndForget);
        req.complete(Ok(()));
        assert!(req.take_result().is_ok());
    }

    #[test]
    fn blocking_complete_releases_semaphore() {
        let sem = Arc::new(StdSemaphore::new(0));
        let req: Request<StdSemaphore> =
            Request::new(DefaultCmd::Reset, RequestPayload::None, Completion::Blocking(sem.clone()));
        req.complete(Err(Error::Timeout));
        assert!(sem.wait(0));
        assert_eq!(req.take_result(), Err(Error::Timeout));
    }

    #[test]
    fn step_counter_advances() {
        let req: Request<StdSemaphore> =
            Request::new(DefaultCmd::JoinAp, RequestPayload::None, Completion::FireAndForget);
        assert_eq!(req.step(), 0);
        assert_eq!(req.advance_step(), 1);
        assert_eq!(req.advance_step(), 2);
    }
}
