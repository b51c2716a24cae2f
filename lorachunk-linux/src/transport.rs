//! Byte transport to the LoRa module: the UART device, or an in-memory pair in tests.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

/// How long a write may stall on a full UART buffer before giving up.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Non-blocking byte pipe to the radio module.
pub trait Transport {
    /// Write all of `bytes`.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Bytes that can be read without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;
    /// Read up to `max` bytes; empty if nothing is pending.
    fn read(&mut self, max: usize) -> io::Result<Vec<u8>>;
}

/// UART device opened non-blocking in raw 8N1 mode.
pub struct SerialTransport {
    file: File,
}

impl SerialTransport {
    /// Open `path` and switch the line to raw mode at `baud`. Fails if the
    /// device is not a tty.
    pub fn open(path: &Path, baud: u32) -> io::Result<Self> {
        let speed = baud_rate(baud)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(path)?;
        make_raw(&file, speed)?;
        Ok(Self { file })
    }
}

fn baud_rate(baud: u32) -> io::Result<libc::speed_t> {
    Ok(match baud {
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {other}"),
            ))
        }
    })
}

/// No line editing, no CR/LF translation, no XON/XOFF, 8 data bits, and
/// reads that return whatever is pending.
fn make_raw(file: &File, speed: libc::speed_t) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: termios is plain old data; tcgetattr overwrites it before use.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    // SAFETY: fd stays open for these calls and `tio` is a valid termios.
    unsafe {
        if libc::tcgetattr(fd, &mut tio) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::cfmakeraw(&mut tio);
        tio.c_iflag &= !(libc::IXON | libc::IXOFF | libc::IXANY);
        tio.c_cflag &= !(libc::CSTOPB | libc::CRTSCTS);
        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        tio.c_cc[libc::VMIN] = 0;
        tio.c_cc[libc::VTIME] = 0;
        if libc::cfsetispeed(&mut tio, speed) != 0 || libc::cfsetospeed(&mut tio, speed) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
            return Err(io::Error::last_os_error());
        }
        // Drop whatever the module sent before we were listening.
        libc::tcflush(fd, libc::TCIOFLUSH);
    }
    Ok(())
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let started = Instant::now();
        let mut rest = bytes;
        while !rest.is_empty() {
            match self.file.write(rest) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => rest = &rest[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if started.elapsed() > WRITE_TIMEOUT {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "serial write stalled",
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let mut n: libc::c_int = 0;
        // SAFETY: FIONREAD writes one c_int through the pointer; fd is open for self's lifetime.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                libc::FIONREAD,
                &mut n as *mut libc::c_int,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(usize::try_from(n).unwrap_or(0))
    }

    fn read(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        match self.file.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use super::Transport;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    type Pipe = Arc<Mutex<VecDeque<u8>>>;

    /// One end of an in-memory full-duplex link.
    pub struct MemoryTransport {
        rx: Pipe,
        tx: Pipe,
    }

    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let ab: Pipe = Arc::default();
        let ba: Pipe = Arc::default();
        (
            MemoryTransport {
                rx: ba.clone(),
                tx: ab.clone(),
            },
            MemoryTransport { rx: ab, tx: ba },
        )
    }

    impl Transport for MemoryTransport {
        fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.tx.lock().unwrap().extend(bytes);
            Ok(())
        }

        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(self.rx.lock().unwrap().len())
        }

        fn read(&mut self, max: usize) -> io::Result<Vec<u8>> {
            let mut rx = self.rx.lock().unwrap();
            let n = max.min(rx.len());
            Ok(rx.drain(..n).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pair_is_full_duplex() {
        let (mut a, mut b) = memory::pair();
        a.write(&[1, 2, 3]).unwrap();
        b.write(&[9]).unwrap();
        assert_eq!(b.bytes_available().unwrap(), 3);
        assert_eq!(b.read(2).unwrap(), vec![1, 2]);
        assert_eq!(b.read(10).unwrap(), vec![3]);
        assert!(b.read(10).unwrap().is_empty());
        assert_eq!(a.read(10).unwrap(), vec![9]);
    }

    use std::ffi::CStr;
    use std::os::unix::io::FromRawFd;
    use std::path::PathBuf;

    /// A pseudo-terminal: the master end plays the radio module, the slave
    /// path is opened as the serial device.
    fn pty() -> (File, PathBuf) {
        unsafe {
            let fd = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
            assert!(fd >= 0, "posix_openpt: {}", io::Error::last_os_error());
            assert_eq!(libc::grantpt(fd), 0);
            assert_eq!(libc::unlockpt(fd), 0);
            let mut name = [0 as libc::c_char; 128];
            assert_eq!(libc::ptsname_r(fd, name.as_mut_ptr(), name.len()), 0);
            let slave = PathBuf::from(CStr::from_ptr(name.as_ptr()).to_str().unwrap());
            (File::from_raw_fd(fd), slave)
        }
    }

    fn read_exactly(t: &mut SerialTransport, n: usize) -> Vec<u8> {
        let started = Instant::now();
        let mut got = Vec::new();
        while got.len() < n && started.elapsed() < Duration::from_secs(2) {
            let available = t.bytes_available().unwrap();
            got.extend(t.read(available.max(1)).unwrap());
            std::thread::sleep(Duration::from_millis(5));
        }
        got
    }

    #[test]
    fn serial_open_missing_device_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SerialTransport::open(&dir.path().join("ttyNone"), 9600).is_err());
    }

    #[test]
    fn regular_file_is_not_a_serial_device() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(SerialTransport::open(f.path(), 9600).is_err());
    }

    #[test]
    fn unsupported_baud_rate_rejected() {
        let (_master, slave) = pty();
        let err = SerialTransport::open(&slave, 12345).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn tty_bytes_pass_through_untranslated() {
        let (mut master, slave) = pty();
        let mut t = SerialTransport::open(&slave, 9600).unwrap();

        // CR, XOFF and a byte with no newline after it.
        let inbound = [0x7E, 0x00, 0x01, 0x0D, 0x13, 0x0A, 0x42];
        master.write_all(&inbound).unwrap();
        assert_eq!(read_exactly(&mut t, inbound.len()), inbound);

        let outbound = [0x0A, 0x0D, 0x11, 0x7E];
        t.write(&outbound).unwrap();
        let mut echoed = [0u8; 4];
        master.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, outbound);
    }
}
