use std::fmt;

/// Control commands understood by the worker.
///
/// Parsing is case-sensitive and fail-open: anything unrecognised reads as
/// [`ControlCommand::Proceed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", from = "String")]
pub enum ControlCommand {
    #[default]
    Proceed,
    /// Hold at the next step boundary.
    Pause,
    /// Force one out-of-cadence snapshot after the next step, then revert to
    /// `Proceed`.
    Snapshot,
    /// Abort at the next step boundary.
    Exit,
}

impl ControlCommand {
    pub fn parse_lossy(raw: &str) -> Self {
        match raw {
            "PAUSE" => ControlCommand::Pause,
            "SNAPSHOT" => ControlCommand::Snapshot,
            "EXIT" => ControlCommand::Exit,
            _ => ControlCommand::Proceed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlCommand::Proceed => "PROCEED",
            ControlCommand::Pause => "PAUSE",
            ControlCommand::Snapshot => "SNAPSHOT",
            ControlCommand::Exit => "EXIT",
        }
    }
}

impl From<String> for ControlCommand {
    fn from(raw: String) -> Self {
        ControlCommand::parse_lossy(&raw)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_commands() {
        assert_eq!(ControlCommand::parse_lossy("PROCEED"), ControlCommand::Proceed);
        assert_eq!(ControlCommand::parse_lossy("PAUSE"), ControlCommand::Pause);
        assert_eq!(ControlCommand::parse_lossy("SNAPSHOT"), ControlCommand::Snapshot);
        assert_eq!(ControlCommand::parse_lossy("EXIT"), ControlCommand::Exit);
    }

    #[test]
    fn test_parse_is_case_sensitive_and_fail_open() {
        assert_eq!(ControlCommand::parse_lossy("pause"), ControlCommand::Proceed);
        assert_eq!(ControlCommand::parse_lossy("RUN"), ControlCommand::Proceed);
        assert_eq!(ControlCommand::parse_lossy(""), ControlCommand::Proceed);
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&ControlCommand::Snapshot).unwrap();
        assert_eq!(json, "\"SNAPSHOT\"");
        let cmd: ControlCommand = serde_json::from_str("\"EXIT\"").unwrap();
        assert_eq!(cmd, ControlCommand::Exit);
        let unknown: ControlCommand = serde_json::from_str("\"HALT\"").unwrap();
        assert_eq!(unknown, ControlCommand::Proceed);
    }

    #[test]
    fn test_display_matches_as_str() {
        for cmd in [
            ControlCommand::Proceed,
            ControlCommand::Pause,
            ControlCommand::Snapshot,
            ControlCommand::Exit,
        ] {
            assert_eq!(cmd.to_string(), cmd.as_str());
            assert_eq!(ControlCommand::parse_lossy(cmd.as_str()), cmd);
        }
    }
}
