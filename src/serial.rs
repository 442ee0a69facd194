use std::io::{self, Read, Write};
use std::time::Duration;

use log::{debug, info, warn};
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortBuilder, StopBits};

use crate::errors::Result;

/// Line rate of the PowerShield UART. Not in the POSIX rate table.
pub const BAUD_RATE: u32 = 3_686_400;

/// Standard rate used to get the port open when the real rate is refused.
const FALLBACK_BAUD_RATE: u32 = 9_600;

/// Write timeout. Reads never block: the worker polls `bytes_to_read` first.
const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Byte channel the connection worker drives.
///
/// `bytes_to_read` must not block; the worker only calls `read` when it
/// reports pending bytes.
pub trait Transport: Read + Write + Send {
    fn bytes_to_read(&mut self) -> io::Result<usize>;
}

/// Serial port configured for the PowerShield (8N1, no flow control).
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn name(&self) -> Option<String> {
        self.port.name()
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Transport for SerialTransport {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }
}

/// Names of the serial ports present on this host, sorted.
pub fn list_ports() -> Result<Vec<String>> {
    let mut names: Vec<String> = serialport::available_ports()?
        .into_iter()
        .map(|info| info.port_name)
        .collect();
    names.sort();
    Ok(names)
}

fn builder(path: &str, baud_rate: u32) -> SerialPortBuilder {
    serialport::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(IO_TIMEOUT)
}

/// Open `path` at [`BAUD_RATE`].
///
/// If the host refuses the rate outright, the port is opened at a standard rate
/// and then switched to the real one through the platform's arbitrary-rate path.
pub fn open_port(path: &str) -> Result<SerialTransport> {
    let port = open_configured(path)?;
    info!("opened {} at {} baud", path, BAUD_RATE);
    Ok(SerialTransport { port })
}

#[cfg(unix)]
fn open_configured(path: &str) -> Result<Box<dyn SerialPort>> {
    let port = match builder(path, BAUD_RATE).open_native() {
        Ok(port) => port,
        Err(e) => {
            warn!(
                "opening {} at {} baud failed ({}), retrying at {}",
                path, BAUD_RATE, e, FALLBACK_BAUD_RATE
            );
            builder(path, FALLBACK_BAUD_RATE).open_native()?
        }
    };
    custom_rate::apply(&port, BAUD_RATE)?;
    Ok(Box::new(port))
}

#[cfg(not(unix))]
fn open_configured(path: &str) -> Result<Box<dyn SerialPort>> {
    match builder(path, BAUD_RATE).open() {
        Ok(port) => Ok(port),
        Err(e) => {
            warn!(
                "opening {} at {} baud failed ({}), retrying at {}",
                path, BAUD_RATE, e, FALLBACK_BAUD_RATE
            );
            let mut port = builder(path, FALLBACK_BAUD_RATE).open()?;
            port.set_baud_rate(BAUD_RATE)?;
            Ok(port)
        }
    }
}

/// Linux `termios2` + `BOTHER`: lets the UART driver take any integer rate.
#[cfg(all(
    target_os = "linux",
    any(
        target_arch = "x86",
        target_arch = "x86_64",
        target_arch = "arm",
        target_arch = "aarch64",
        target_arch = "riscv64"
    )
))]
mod custom_rate {
    use std::io;
    use std::mem;
    use std::os::fd::AsRawFd;

    use log::debug;

    // _IOR('T', 0x2A, struct termios2) / _IOW('T', 0x2B, struct termios2)
    const TCGETS2: u32 = 0x802C_542A;
    const TCSETS2: u32 = 0x402C_542B;
    const BOTHER: u32 = 0x0000_1000;
    const CBAUD: u32 = 0x0000_100F;

    #[repr(C)]
    #[derive(Copy, Clone)]
    struct Termios2 {
        c_iflag: u32,
        c_oflag: u32,
        c_cflag: u32,
        c_lflag: u32,
        c_line: u8,
        c_cc: [u8; 19],
        c_ispeed: u32,
        c_ospeed: u32,
    }

    pub fn apply(port: &impl AsRawFd, baud_rate: u32) -> io::Result<()> {
        let fd = port.as_raw_fd();
        // SAFETY: Termios2 is plain integers; all-zero is a valid value.
        let mut tio: Termios2 = unsafe { mem::zeroed() };

        if unsafe { libc::ioctl(fd, TCGETS2 as _, &mut tio as *mut Termios2) } < 0 {
            return Err(io::Error::last_os_error());
        }

        tio.c_cflag = (tio.c_cflag & !CBAUD) | BOTHER;
        tio.c_ispeed = baud_rate;
        tio.c_ospeed = baud_rate;

        if unsafe { libc::ioctl(fd, TCSETS2 as _, &tio as *const Termios2) } < 0 {
            return Err(io::Error::last_os_error());
        }

        debug!("termios2: fd={} set to {} baud", fd, baud_rate);
        Ok(())
    }

}

/// Elsewhere serialport already reaches arbitrary rates on its own.
#[cfg(all(
    unix,
    not(all(
        target_os = "linux",
        any(
            target_arch = "x86",
            target_arch = "x86_64",
            target_arch = "arm",
            target_arch = "aarch64",
            target_arch = "riscv64"
        )
    ))
))]
mod custom_rate {
    use std::io;

    use serialport::SerialPort;

    pub fn apply(port: &serialport::TTYPort, baud_rate: u32) -> io::Result<()> {
        let mut port = port.try_clone_native()?;
        port.set_baud_rate(baud_rate).map_err(io::Error::from)
    }
}

/// Write one queued command and flush it out of the host buffer.
pub(crate) fn send_bytes(transport: &mut dyn Transport, bytes: &[u8]) -> io::Result<()> {
    transport.write_all(bytes)?;
    transport.flush()
}

/// Non-blocking read into `buf`; `Ok(0)` means nothing is pending.
pub(crate) fn poll_read(transport: &mut dyn Transport, buf: &mut [u8]) -> io::Result<usize> {
    let available = transport.bytes_to_read()?;
    if available == 0 {
        return Ok(0);
    }
    let want = available.min(buf.len());
    match transport.read(&mut buf[..want]) {
        Ok(n) => Ok(n),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ) =>
        {
            debug!("read returned {:?} with {} bytes pending", e.kind(), available);
            Ok(0)
        }
        Err(e) => Err(e),
    }
}
