// Licensed under the MIT license.

//! The serial transport contract and
//! the implementations that ship with the crate: [`LoopbackTransport`] (an
//! in-memory fake used by the test suite and as a usage example) and, behind
//! the `serial` feature, a termios-backed real serial port.

#[cfg(feature = "serial")]
pub mod serial;

/// Hardware reset line pulse level, for transports that wire one up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetLevel {
    Low,
    High,
}

/// Required of the host integrator. `send` is blocking and
/// best-effort; `reset` and `set_baudrate` are optional (most transports
/// have no reset line or fixed baud) and default to "unsupported".
pub trait Transport: Send {
    /// Writes `bytes` to the wire, returning the number of bytes actually
    /// written. Called with an empty slice as a flush hint.
    fn send(&mut self, bytes: &[u8]) -> usize;

    /// Pulses a hardware reset line, if wired up.
    fn reset(&mut self, _level: ResetLevel) -> bool {
        false
    }

    /// Reconfigures the link speed, used by the reset sub-command sequence
    /// after `AT+UART_CUR=...`.
    fn set_baudrate(&mut self, _baud: u32) -> bool {
        false
    }
}

/// An in-memory [`Transport`] that records everything written to it and lets
/// a test script queue up device responses on demand. Used by the
/// integration tests to replay end-to-end scenarios and doubles as a
/// runnable usage example.
pub struct LoopbackTransport {
    pub written: Vec<u8>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        LoopbackTransport { written: Vec::new() }
    }

    /// Drains and returns everything written since the last call.
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, bytes: &[u8]) -> usize {
        self.written.extend_from_slice(bytes);
        bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_records_writes() {
        let mut t = LoopbackTransport::new();
        t.send(b"AT+RST\r\n");
        t.send(b"AT+GMR\r\n");
        assert_eq!(t.take_written(), b"AT+RST\r\nAT+GMR\r\n");
        assert!(t.written.is_empty());
    }
}
