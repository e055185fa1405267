//! Serial transport to the rubidium unit (unix only).
//!
//! The port is opened raw 8N1 with a 200 ms inter-read timeout. A response
//! is everything the unit sends until the line goes quiet for one timeout.

use crate::error::Result;
use crate::protocol::{self, Command, FieldMap};
use crate::telemetry::{HealthReport, ModelFamily, ModelInfo};
use crate::traits::{DeviceCommandSink, TelemetryProvider};
use log::{debug, info, trace, warn};
use nix::fcntl::{fcntl, flock, FcntlArg, FlockArg, OFlag};
use nix::sys::termios::{
    cfmakeraw, cfsetspeed, tcflush, tcgetattr, tcsetattr, BaudRate, ControlFlags, FlushArg,
    SetArg, SpecialCharacterIndices,
};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Baud rates tried in order during identification.
pub const BAUD_RATES: [u32; 2] = [9600, 57600];

/// Read timeout in deciseconds (VTIME).
const READ_TIMEOUT_DS: u8 = 2;

/// A response shorter than this means we are talking at the wrong speed.
const MIN_IDENTITY_BYTES: usize = 4;

fn baud_rate(baud: u32) -> BaudRate {
    match baud {
        57600 => BaudRate::B57600,
        19200 => BaudRate::B19200,
        _ => BaudRate::B9600,
    }
}

pub fn needs_baud_fallback(response: &[u8]) -> bool {
    response.len() < MIN_IDENTITY_BYTES
}

pub struct SerialDevice {
    port: File,
    path: PathBuf,
    baud: u32,
    family: ModelFamily,
    /// Every field from the last health poll, for display.
    last_fields: FieldMap,
}

impl SerialDevice {
    pub fn open(path: &Path) -> Result<Self> {
        let port = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
            .open(path)?;

        // One discipline loop per port
        match flock(port.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(nix::errno::Errno::EWOULDBLOCK) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} is already in use by another instance", path.display()),
                ).into());
            }
            Err(e) => return Err(io::Error::from(e).into()),
        }

        // Blocking reads from here on; VMIN/VTIME bound them
        let flags = fcntl(port.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let mut flags = OFlag::from_bits_truncate(flags);
        flags.remove(OFlag::O_NONBLOCK);
        fcntl(port.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;

        let mut device = SerialDevice {
            port,
            path: path.to_path_buf(),
            baud: BAUD_RATES[0],
            family: ModelFamily::Unknown,
            last_fields: FieldMap::new(),
        };
        device.configure(BAUD_RATES[0])?;
        info!("Opened {} at {} baud", path.display(), device.baud);
        Ok(device)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn last_fields(&self) -> &FieldMap {
        &self.last_fields
    }

    fn configure(&mut self, baud: u32) -> Result<()> {
        let mut tio = tcgetattr(&self.port).map_err(io::Error::from)?;
        cfmakeraw(&mut tio);
        tio.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
        tio.control_flags &= !(ControlFlags::CSTOPB | ControlFlags::PARENB);
        tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        tio.control_chars[SpecialCharacterIndices::VTIME as usize] = READ_TIMEOUT_DS;
        cfsetspeed(&mut tio, baud_rate(baud)).map_err(io::Error::from)?;
        tcsetattr(&self.port, SetArg::TCSANOW, &tio).map_err(io::Error::from)?;
        tcflush(&self.port, FlushArg::TCIOFLUSH).map_err(io::Error::from)?;
        self.baud = baud;
        Ok(())
    }

    /// Read until the line stays quiet for one read timeout.
    fn read_response(&mut self) -> Result<Vec<u8>> {
        let mut response = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(response)
    }

    fn send(&mut self, command: Command) -> Result<()> {
        let text = command.encode();
        trace!("> {}", text);
        self.port.write_all(text.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    /// Send one command and collect its response lines.
    pub fn transact(&mut self, command: Command) -> Result<Vec<String>> {
        let raw = self.transact_raw(command)?;
        let lines = protocol::split_lines(&raw);
        trace!("< {:?}", lines);
        Ok(lines)
    }

    fn transact_raw(&mut self, command: Command) -> Result<Vec<u8>> {
        self.send(command)?;
        self.read_response()
    }
}

impl TelemetryProvider for SerialDevice {
    fn identify(&mut self) -> Result<ModelInfo> {
        let mut raw = self.transact_raw(Command::Identify)?;
        if needs_baud_fallback(&raw) {
            warn!("No identity at {} baud, retrying at {}", self.baud, BAUD_RATES[1]);
            self.configure(BAUD_RATES[1])?;
            raw = self.transact_raw(Command::Identify)?;
        }

        let (info, fields) = protocol::parse_identity(&protocol::split_lines(&raw))?;
        debug!("Identity fields: {:?}", fields);
        info!("Model: {} -- S/N: {} -- Service Pin: {}",
              info.model_text,
              info.serial.as_deref().unwrap_or("-"),
              info.service_pin.as_deref().unwrap_or("-"));
        self.family = info.family;
        Ok(info)
    }

    fn pps_delta(&mut self) -> Result<u64> {
        let lines = self.transact(Command::PpsDelta)?;
        protocol::parse_pps_delta(&lines, self.family)
    }

    fn control_register(&mut self) -> Result<u32> {
        let lines = self.transact(Command::ControlRegister)?;
        protocol::parse_control_register(&lines)
    }

    fn health(&mut self) -> Result<HealthReport> {
        let lines = self.transact(Command::Health)?;
        let (report, fields) = protocol::parse_health(&lines, self.family)?;
        self.last_fields = fields;
        Ok(report)
    }

    fn drain(&mut self) -> Result<()> {
        tcflush(&self.port, FlushArg::TCIFLUSH).map_err(io::Error::from)?;
        let leftover = self.read_response()?;
        if !leftover.is_empty() {
            debug!("Drained {} bytes", leftover.len());
        }
        Ok(())
    }
}

// Commands answer with an echo we do not need, but it must be read off the
// line before the next query.
impl DeviceCommandSink for SerialDevice {
    fn set_dds_value(&mut self, value: f64) -> Result<()> {
        self.transact(Command::SetDds(value)).map(|_| ())
    }

    fn zero_pps_delta_to(&mut self, observed: u64) -> Result<()> {
        self.transact(Command::ZeroPpsDelta(observed)).map(|_| ())
    }

    fn set_control_register(&mut self, value: u32) -> Result<()> {
        self.transact(Command::SetControlRegister(value)).map(|_| ())
    }
}
