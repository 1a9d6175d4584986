//! Client for the upsd (Network UPS Tools daemon) line protocol.
//!
//! One request is in flight at a time: each call writes a command line and
//! reads its reply before returning. A reply is either a single line, or a
//! block opened by `BEGIN <command>` and closed by `END <command>`.
//!
//! Once a write or read fails or times out, a late reply may still be on its
//! way, so the session refuses further commands with
//! [`UpsdError::Desynchronised`]. Callers reconnect.
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{
    split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::UpsdError;
use crate::line_reader::LineReader;
use crate::parser::{ParsingError, VarLine};
use crate::types::protocol::{
    StatusFlag, UpsUnit, UpsdCommand, CMD_LOAD_OFF_DELAY, VAR_INPUT_VOLTAGE,
    VAR_UPS_STATUS,
};
use crate::types::serialisable::UpsdSerialisable;
use crate::util::bytes_to_human_str;

/// Runs `fut`, bounded by `deadline` if one is set.
async fn within<T>(
    deadline: Option<Duration>,
    command: &str,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T, UpsdError> {
    let result = match deadline {
        Some(d) => timeout(d, fut).await.map_err(|_| UpsdError::Timeout {
            command: command.to_owned(),
        })?,
        None => fut.await,
    };

    result.map_err(|source| UpsdError::Io {
        command: command.to_owned(),
        source,
    })
}

/// An open session with upsd.
pub struct UpsdSession<S: AsyncRead + AsyncWrite = TcpStream> {
    reader: LineReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    io_timeout: Option<Duration>,
    /// Unit name to description, filled in by `login`.
    units: HashMap<String, String>,
    default_unit: Option<String>,
    /// The command whose exchange broke the session, if any.
    broken_by: Option<String>,
}

impl UpsdSession<TcpStream> {
    /// Opens a TCP connection to upsd at `addr` (`host:port`).
    #[instrument(skip(io_timeout))]
    pub async fn connect(
        addr: &str,
        io_timeout: Option<Duration>,
    ) -> Result<Self, UpsdError> {
        let connect_err = |source| UpsdError::Connect {
            addr: addr.to_owned(),
            source,
        };

        let connecting = TcpStream::connect(addr);
        let stream = match io_timeout {
            Some(d) => timeout(d, connecting).await.map_err(|_| {
                connect_err(io::Error::from(io::ErrorKind::TimedOut))
            })?,
            None => connecting.await,
        }
        .map_err(connect_err)?;

        stream.set_nodelay(true).map_err(connect_err)?;
        let peer = stream.peer_addr().map_err(connect_err)?;
        info!(%peer, "connected to upsd");

        Ok(Self::new(stream, io_timeout))
    }
}

impl<S: AsyncRead + AsyncWrite> UpsdSession<S> {
    /// Wraps an already-open stream. `io_timeout` bounds every line written
    /// or read; without it a silent daemon blocks the caller indefinitely.
    pub fn new(stream: S, io_timeout: Option<Duration>) -> Self {
        let (r, writer) = split(stream);

        Self {
            reader: r.into(),
            writer,
            io_timeout,
            units: HashMap::new(),
            default_unit: None,
            broken_by: None,
        }
    }

    /// Known units, by name, with their descriptions.
    pub fn units(&self) -> &HashMap<String, String> {
        &self.units
    }

    /// The first unit listed at login, used by the single-unit queries.
    pub fn default_unit(&self) -> Option<&str> {
        self.default_unit.as_deref()
    }

    /// Whether an earlier failure left the connection out of step.
    pub fn is_desynchronised(&self) -> bool {
        self.broken_by.is_some()
    }

    /// Sends one command and collects its reply lines.
    async fn transaction(
        &mut self,
        cmd: &UpsdCommand,
    ) -> Result<Vec<String>, UpsdError> {
        if let Some(after) = &self.broken_by {
            return Err(UpsdError::Desynchronised {
                after: after.clone(),
            });
        }

        let result = self.exchange(cmd).await;
        if let Err(error) = &result {
            if error.is_connection_lost() {
                self.broken_by = Some(cmd.redacted());
            }
        }

        result
    }

    async fn exchange(
        &mut self,
        cmd: &UpsdCommand,
    ) -> Result<Vec<String>, UpsdError> {
        let label = cmd.redacted();
        trace!(command = %label, "sending");

        let wire = cmd.serialise_upsd();
        within(self.io_timeout, &label, async {
            self.writer.write_all(&wire).await?;
            self.writer.flush().await
        })
        .await?;

        let first = self.read_line(&label).await?;
        if first != cmd.begin_marker() {
            return Ok(vec![first]);
        }

        let end = cmd.end_marker();
        let mut lines = Vec::new();
        loop {
            let line = self.read_line(&label).await?;
            if line == end {
                return Ok(lines);
            }
            lines.push(line);
        }
    }

    async fn read_line(&mut self, label: &str) -> Result<String, UpsdError> {
        let line = within(self.io_timeout, label, self.reader.read_line())
            .await?
            .ok_or_else(|| UpsdError::Disconnected {
                command: label.to_owned(),
            })?;

        trace!(line = %bytes_to_human_str(&line), "received");

        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Sends a command whose only acceptable reply is `OK`, optionally
    /// followed by more words (`OK TRACKING <id>`).
    async fn expect_ok(&mut self, cmd: UpsdCommand) -> Result<(), UpsdError> {
        let reply = self.transaction(&cmd).await?;

        match reply.as_slice() {
            [line] if line == "OK" || line.starts_with("OK ") => Ok(()),
            _ => Err(UpsdError::Daemon {
                command: cmd.redacted(),
                response: reply.join("\n"),
            }),
        }
    }

    /// Authenticates, then loads the list of units. The first unit listed
    /// becomes the default unit.
    #[instrument(skip(self, password))]
    pub async fn login(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<(), UpsdError> {
        self.units.clear();
        self.default_unit = None;

        let credentials = [
            UpsdCommand::Username(username.to_owned()),
            UpsdCommand::Password(password.to_owned()),
        ];
        for cmd in credentials {
            let reply = self.transaction(&cmd).await?;
            if reply != ["OK"] {
                return Err(UpsdError::Auth {
                    response: reply.join("\n"),
                });
            }
        }

        self.load_units().await?;
        info!(
            units = self.units.len(),
            default = ?self.default_unit,
            "logged in"
        );

        Ok(())
    }

    async fn load_units(&mut self) -> Result<(), UpsdError> {
        let cmd = UpsdCommand::ListUps;
        let reply = self.transaction(&cmd).await?;

        if let [line] = reply.as_slice() {
            if line.starts_with("ERR") {
                return Err(UpsdError::Daemon {
                    command: cmd.to_string(),
                    response: line.clone(),
                });
            }
        }

        let mut units = Vec::with_capacity(reply.len());
        for line in &reply {
            let unit = UpsUnit::try_from(line.as_bytes()).map_err(|reason| {
                UpsdError::Protocol {
                    command: cmd.to_string(),
                    line: line.clone(),
                    reason,
                }
            })?;
            units.push(unit);
        }

        self.default_unit = units.first().map(|u| u.name.clone());
        self.units = units
            .into_iter()
            .map(|u| (u.name, u.description))
            .collect();

        Ok(())
    }

    /// Reads a variable of the default unit, reporting every failure. A reply
    /// naming another unit or variable is a protocol error.
    pub async fn try_get_var(
        &mut self,
        name: &str,
    ) -> Result<String, UpsdError> {
        let ups = self.default_unit.clone().ok_or(UpsdError::NoUnit)?;
        let cmd = UpsdCommand::GetVar {
            ups: ups.clone(),
            name: name.to_owned(),
        };
        let reply = self.transaction(&cmd).await?;
        let protocol = |line: String, reason| UpsdError::Protocol {
            command: cmd.to_string(),
            line,
            reason,
        };

        let [line] = reply.as_slice() else {
            return Err(protocol(reply.join("\n"), ParsingError::BadFormat));
        };

        let var = VarLine::try_from(line.as_bytes())
            .map_err(|reason| protocol(line.clone(), reason))?;
        if var.ups != ups || var.name != name {
            return Err(protocol(line.clone(), ParsingError::Mismatched));
        }

        Ok(var.value)
    }

    /// Reads a numeric variable of the default unit, reporting every failure.
    pub async fn try_get_float(
        &mut self,
        name: &str,
    ) -> Result<f64, UpsdError> {
        let value = self.try_get_var(name).await?;

        value.trim().parse().map_err(|_| UpsdError::Protocol {
            command: format!(
                "GET VAR {} {name}",
                self.default_unit().unwrap_or_default()
            ),
            line: value.clone(),
            reason: ParsingError::BadFormat,
        })
    }

    /// Reads a numeric variable of the default unit. Any failure reads as
    /// zero, so a genuine zero can't be told apart from a failed lookup.
    pub async fn get_float_value(&mut self, name: &str) -> f64 {
        self.try_get_float(name).await.unwrap_or_else(|error| {
            debug!(name, %error, "variable lookup failed");
            0.0
        })
    }

    /// Reads a variable of the default unit verbatim. Any failure reads as an
    /// empty string.
    pub async fn get_string_value(&mut self, name: &str) -> String {
        self.try_get_var(name).await.unwrap_or_else(|error| {
            debug!(name, %error, "variable lookup failed");
            String::new()
        })
    }

    /// As [`is_power_mains_good`](Self::is_power_mains_good), but a failed
    /// lookup is an error rather than a power loss.
    pub async fn try_is_power_mains_good(
        &mut self,
    ) -> Result<bool, UpsdError> {
        Ok(self.try_get_float(VAR_INPUT_VOLTAGE).await? > 0.0)
    }

    /// Mains power is taken as good whenever some input voltage is present.
    pub async fn is_power_mains_good(&mut self) -> bool {
        self.get_float_value(VAR_INPUT_VOLTAGE).await > 0.0
    }

    /// The flags currently listed in `ups.status`.
    pub async fn try_status_flags(
        &mut self,
    ) -> Result<Vec<StatusFlag>, UpsdError> {
        let status = self.try_get_var(VAR_UPS_STATUS).await?;

        Ok(status
            .split(' ')
            .filter(|t| !t.is_empty())
            .map(StatusFlag::parse)
            .collect())
    }

    /// As [`try_status_flags`](Self::try_status_flags), with any failure
    /// reading as no flags.
    pub async fn status_flags(&mut self) -> Vec<StatusFlag> {
        self.try_status_flags().await.unwrap_or_else(|error| {
            debug!(%error, "status lookup failed");
            Vec::new()
        })
    }

    /// Whether `ups.status` lists exactly this flag.
    pub async fn get_status_on(&mut self, flag: &StatusFlag) -> bool {
        self.status_flags().await.contains(flag)
    }

    /// Asks the default unit to cut its load after `seconds`.
    #[instrument(skip(self))]
    pub async fn schedule_load_off_in(
        &mut self,
        seconds: u32,
    ) -> Result<(), UpsdError> {
        let ups = self.default_unit.clone().ok_or(UpsdError::NoUnit)?;

        self.expect_ok(UpsdCommand::InstCmd {
            ups,
            cmd: CMD_LOAD_OFF_DELAY.to_owned(),
            arg: seconds.to_string(),
        })
        .await?;
        warn!(seconds, "load off scheduled");

        Ok(())
    }

    /// Logs out and closes the connection. The connection is closed even if
    /// the logout fails.
    pub async fn close(mut self) {
        if let Err(error) = self.transaction(&UpsdCommand::Logout).await {
            debug!(%error, "logout failed");
        }

        if let Err(error) = self.writer.shutdown().await {
            debug!(%error, "shutting down connection");
        }
        debug!("closed upsd session");
    }
}
