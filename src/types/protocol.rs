use std::fmt;

use super::serialisable::UpsdSerialisable;

/// Delay, in seconds, commonly given to `load.off.delay` once the battery is
/// exhausted.
pub const LOAD_OFF_TIMEOUT: u32 = 15;

/// Variable holding the input (mains) voltage.
pub const VAR_INPUT_VOLTAGE: &str = "input.voltage";
/// Variable holding the space-separated status flags.
pub const VAR_UPS_STATUS: &str = "ups.status";
/// Instant command that cuts the load after a delay.
pub const CMD_LOAD_OFF_DELAY: &str = "load.off.delay";

/// A request sent by the client to upsd.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpsdCommand {
    /// Announces the user name to authenticate as. Replies `OK` or `ERR ..`.
    ///
    /// On the wire: `USERNAME <name>`
    Username(String),
    /// Completes authentication. Replies `OK` or `ERR ..`.
    ///
    /// On the wire: `PASSWORD <password>`
    Password(String),
    /// Ends the session. Replies `OK Goodbye` and the server hangs up.
    ///
    /// On the wire: `LOGOUT`
    Logout,
    /// Lists the UPS units the daemon knows, as a `BEGIN LIST UPS` ..
    /// `END LIST UPS` block of `UPS <name> "<description>"` lines.
    ///
    /// On the wire: `LIST UPS`
    ListUps,
    /// Reads one variable. Replies `VAR <ups> <name> "<value>"`.
    ///
    /// On the wire: `GET VAR <ups> <name>`
    GetVar { ups: String, name: String },
    /// Runs an instant command with an argument. Replies `OK` or `ERR ..`.
    ///
    /// On the wire: `INSTCMD <ups> <cmd> <arg>`
    InstCmd {
        ups: String,
        cmd: String,
        arg: String,
    },
}

impl UpsdCommand {
    /// Line opening a multi-line reply to this command.
    pub fn begin_marker(&self) -> String {
        format!("BEGIN {self}")
    }

    /// Line closing a multi-line reply to this command.
    pub fn end_marker(&self) -> String {
        format!("END {self}")
    }

    /// The command as it may appear in logs and error messages.
    pub fn redacted(&self) -> String {
        match self {
            Self::Password(_) => "PASSWORD ********".to_owned(),
            _ => self.to_string(),
        }
    }
}

// Wire form, without the terminating newline.
impl fmt::Display for UpsdCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use UpsdCommand::*;

        match self {
            Username(name) => write!(f, "USERNAME {name}"),
            Password(password) => write!(f, "PASSWORD {password}"),
            Logout => f.write_str("LOGOUT"),
            ListUps => f.write_str("LIST UPS"),
            GetVar { ups, name } => write!(f, "GET VAR {ups} {name}"),
            InstCmd { ups, cmd, arg } => write!(f, "INSTCMD {ups} {cmd} {arg}"),
        }
    }
}

impl UpsdSerialisable for UpsdCommand {
    fn serialise_upsd(&self) -> Vec<u8> {
        format!("{self}\n").into_bytes()
    }
}

/// A UPS unit announced by `LIST UPS`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpsUnit {
    pub name: String,
    pub description: String,
}

/// Tokens that may appear in `ups.status`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum StatusFlag {
    Online,
    OnBattery,
    LowBattery,
    ReplaceBattery,
    Charging,
    Bypass,
    Other(String),
}

impl StatusFlag {
    pub fn as_str(&self) -> &str {
        use StatusFlag::*;

        match self {
            Online => "OL",
            OnBattery => "OB",
            LowBattery => "LB",
            ReplaceBattery => "RB",
            Charging => "CHRG",
            Bypass => "BYPASS",
            Other(s) => s.as_str(),
        }
    }

    pub fn parse(token: &str) -> Self {
        use StatusFlag::*;

        match token {
            "OL" => Online,
            "OB" => OnBattery,
            "LB" => LowBattery,
            "RB" => ReplaceBattery,
            "CHRG" => Charging,
            "BYPASS" => Bypass,
            _ => Other(token.to_owned()),
        }
    }
}

impl fmt::Display for StatusFlag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialise_commands() {
        use UpsdCommand::*;

        #[track_caller]
        fn wire(cmd: UpsdCommand, expected: &[u8]) {
            assert_eq!(cmd.serialise_upsd(), expected);
        }

        wire(Username("admin".into()), b"USERNAME admin\n");
        wire(Password("pw".into()), b"PASSWORD pw\n");
        wire(Logout, b"LOGOUT\n");
        wire(ListUps, b"LIST UPS\n");
        wire(
            GetVar {
                ups: "myups".into(),
                name: "input.voltage".into(),
            },
            b"GET VAR myups input.voltage\n",
        );
        wire(
            InstCmd {
                ups: "myups".into(),
                cmd: CMD_LOAD_OFF_DELAY.into(),
                arg: "15".into(),
            },
            b"INSTCMD myups load.off.delay 15\n",
        );
    }

    #[test]
    fn test_markers_echo_command() {
        assert_eq!(UpsdCommand::ListUps.begin_marker(), "BEGIN LIST UPS");
        assert_eq!(UpsdCommand::ListUps.end_marker(), "END LIST UPS");
    }

    #[test]
    fn test_password_is_redacted() {
        let cmd = UpsdCommand::Password("hunter2".into());
        assert!(!cmd.redacted().contains("hunter2"));
        assert_eq!(UpsdCommand::Logout.redacted(), "LOGOUT");
    }

    #[test]
    fn test_status_flags_round_trip_tokens() {
        for token in ["OL", "OB", "LB", "RB", "CHRG", "BYPASS", "TRIM"] {
            assert_eq!(StatusFlag::parse(token).as_str(), token);
        }
        assert_eq!(StatusFlag::parse("OB"), StatusFlag::OnBattery);
    }
}
