// Licensed under the MIT license.

//! A termios-backed [`Transport`] over a real serial device (Linux/Unix
//! only), gated behind the `serial` feature. Grounded on the raw-`libc`
//! termios pattern used for AT-command modems elsewhere in the retrieval
//! pack (`gawd-ai-sctl/server/src/modem.rs`): open the device non-blocking,
//! configure raw mode with `cfmakeraw`, then clear `O_NONBLOCK` so reads
//! block with a `VTIME` idle timeout.

use super::{ResetLevel, Transport};
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;

/// An open serial port, configured for raw 8N1 framing at the baud rate
/// requested by [`open`](SerialTransport::open) (`Config::at_port_baudrate`).
pub struct SerialTransport {
    fd: RawFd,
}

impl SerialTransport {
    /// Opens `path` (e.g. `/dev/ttyUSB0`) and configures termios for raw,
    /// no-echo, 8N1 framing at `baud`.
    pub fn open(path: &str, baud: u32) -> io::Result<Self> {
        let cpath = CString::new(path).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul byte in path"))?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_NOCTTY) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let transport = SerialTransport { fd };
        transport.configure(baud)?;
        Ok(transport)
    }

    fn configure(&self, baud: u32) -> io::Result<()> {
        unsafe {
            let mut tio: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(self.fd, &mut tio) != 0 {
                return Err(io::Error::last_os_error());
            }
            libc::cfmakeraw(&mut tio);

            let speed = baud_to_speed(baud).unwrap_or(libc::B115200);
            libc::cfsetispeed(&mut tio, speed);
            libc::cfsetospeed(&mut tio, speed);

            tio.c_cflag |= libc::CLOCAL | libc::CREAD;
            tio.c_cflag &= !libc::CRTSCTS;

            // VMIN=0, VTIME=1: reads return after 100ms idle or when data
            // is available, so the reader thread never blocks forever.
            tio.c_cc[libc::VMIN] = 0;
            tio.c_cc[libc::VTIME] = 1;

            if libc::tcsetattr(self.fd, libc::TCSANOW, &tio) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::tcflush(self.fd, libc::TCIOFLUSH) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Blocking read of up to `buf.len()` bytes, honouring the `VTIME` idle
    /// timeout configured above. Returns `0` on idle timeout with no data.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }

    /// Spawns a background thread that repeatedly calls [`Self::read`] and
    /// feeds whatever arrives to `on_bytes` — the glue the host integrator
    /// wires to [`crate::engine::Engine::process_input`] or
    /// [`crate::engine::Engine::feed_input`].
    ///
    /// # Safety
    /// The caller must ensure `self` outlives the spawned thread (e.g. by
    /// leaking it or keeping the `SerialTransport` alive for the program's
    /// duration); the thread holds only the raw fd, not a borrow checked by
    /// the compiler.
    pub unsafe fn spawn_reader(&self, mut on_bytes: impl FnMut(&[u8]) + Send + 'static) {
        let fd = self.fd;
        std::thread::Builder::new()
            .name("espat-serial-reader".to_string())
            .spawn(move || {
                let mut buf = [0u8; 512];
                loop {
                    let n = libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
                    if n > 0 {
                        on_bytes(&buf[..n as usize]);
                    } else if n < 0 {
                        let err = io::Error::last_os_error();
                        if err.kind() != io::ErrorKind::WouldBlock && err.kind() != io::ErrorKind::Interrupted {
                            log::warn!("serial read failed: {}", err);
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn serial reader thread");
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, bytes: &[u8]) -> usize {
        if bytes.is_empty() {
            return 0;
        }
        let n = unsafe { libc::write(self.fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if n < 0 {
            0
        } else {
            n as usize
        }
    }

    fn reset(&mut self, level: ResetLevel) -> bool {
        // No generic reset-line ioctl exists across USB-serial adapters;
        // integrators with a wired reset GPIO should implement `Transport`
        // directly instead. This default no-ops but still reports the
        // requested level for diagnostics.
        log::debug!("SerialTransport::reset({:?}) is a no-op; wire a GPIO-backed Transport if needed", level);
        false
    }

    fn set_baudrate(&mut self, baud: u32) -> bool {
        self.configure(baud).is_ok()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn baud_to_speed(baud: u32) -> Option<libc::speed_t> {
    Some(match baud {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        460_800 => libc::B460800,
        921_600 => libc::B921600,
        _ => return None,
    })
}
