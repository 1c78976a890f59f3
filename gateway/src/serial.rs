/**
 * SERIAL LISTENER - RS-232 side of the gateway
 *
 * ROLE: Reads lines from the serial device, parses them into power requests
 * and hands them to the intake.
 *
 * ARCHITECTURE: The device node is read as a plain async file. Lines end at
 * `\r` or `\n`, so a tty left in canonical mode (ICRNL turns CR into NL)
 * works the same as a raw one. A missing or failing device never stops the
 * rest of the gateway: the listener logs and reopens after a fixed delay.
 */

use crate::intake::Intake;
use crate::power::PowerAction;
use crate::registry::{DeviceId, PortId};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, warn};

const TERMINATORS: [char; 2] = ['\r', '\n'];

fn is_terminator(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialRequest {
    Power { op: PowerAction, bank: DeviceId, port: PortId },
    Quit,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("line is not terminated by \\r or \\n")]
    Unterminated,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("{field} '{value}' is not a number in 0-255")]
    InvalidNumber { field: &'static str, value: String },
    #[error("expected '<op> <bank> <port>'")]
    Malformed,
}

/// Grammar: `(on|of|cy) <bank> <port>\r`, `quit\r` or `\r`; `\n` may stand in for `\r`
pub fn parse_line(line: &str) -> Result<SerialRequest, ParseError> {
    let body = line.strip_suffix(&TERMINATORS[..]).ok_or(ParseError::Unterminated)?;
    let tokens: Vec<&str> = body.split(' ').filter(|t| !t.is_empty()).collect();

    match tokens.as_slice() {
        [] => Ok(SerialRequest::Empty),
        ["quit"] => Ok(SerialRequest::Quit),
        [op, bank, port] => {
            let op = op
                .parse::<PowerAction>()
                .map_err(|()| ParseError::UnknownCommand(op.to_string()))?;
            Ok(SerialRequest::Power {
                op,
                bank: number("bank", bank)?,
                port: number("port", port)?,
            })
        }
        [op, ..] if op.parse::<PowerAction>().is_ok() || *op == "quit" => Err(ParseError::Malformed),
        [op, ..] => Err(ParseError::UnknownCommand(op.to_string())),
    }
}

fn number(field: &'static str, raw: &str) -> Result<u8, ParseError> {
    let invalid = || ParseError::InvalidNumber { field, value: raw.to_string() };
    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    raw.parse().map_err(|_| invalid())
}

pub struct SerialListener {
    device: PathBuf,
    reconnect_delay: Duration,
    intake: Intake,
}

impl SerialListener {
    pub fn new(device: PathBuf, reconnect_delay: Duration, intake: Intake) -> Self {
        Self { device, reconnect_delay, intake }
    }

    /// Reopens the device forever; never returns
    pub async fn run(self) {
        loop {
            match tokio::fs::File::open(&self.device).await {
                Ok(file) => {
                    info!(device = %self.device.display(), "serial device opened");
                    match self.listen(file).await {
                        Ok(()) => warn!(device = %self.device.display(), "serial device closed"),
                        Err(e) => warn!(device = %self.device.display(), error = %e, "TransportUnavailable: serial read failed"),
                    }
                }
                Err(e) => {
                    warn!(device = %self.device.display(), error = %e, "TransportUnavailable: cannot open serial device");
                }
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    /// Feeds every complete line from `source` to the intake until EOF.
    ///
    /// A `\r\n` pair yields the command plus an empty line, which is ignored.
    pub async fn listen<R: AsyncRead + Unpin>(&self, source: R) -> std::io::Result<()> {
        let mut reader = BufReader::new(source);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            if !read_line(&mut reader, &mut raw).await? {
                if !raw.is_empty() {
                    debug!(line = %String::from_utf8_lossy(&raw), "discarding partial line");
                }
                return Ok(());
            }
            self.handle_line(&String::from_utf8_lossy(&raw));
        }
    }

    fn handle_line(&self, line: &str) {
        match parse_line(line) {
            Ok(SerialRequest::Power { op, bank, port }) => {
                // Rejections are logged by the intake
                let _ = self.intake.submit_power(bank, port, op);
            }
            Ok(SerialRequest::Quit | SerialRequest::Empty) => {}
            Err(err) => warn!(line = %line.escape_debug(), error = %err, "unparseable serial line"),
        }
    }
}

/// Appends bytes up to and including the next terminator. Returns false at EOF.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R, line: &mut Vec<u8>) -> std::io::Result<bool> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(false);
        }
        match available.iter().position(|&b| is_terminator(b)) {
            Some(end) => {
                line.extend_from_slice(&available[..=end]);
                reader.consume(end + 1);
                return Ok(true);
            }
            None => {
                let taken = available.len();
                line.extend_from_slice(available);
                reader.consume(taken);
            }
        }
    }
}
