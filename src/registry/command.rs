use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Lifecycle verb accepted by `Registry::command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Restart,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Restart => "restart",
        }
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "restart" => Ok(Command::Restart),
            other => Err(Error::InvalidCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_verbs() {
        for cmd in [Command::Start, Command::Stop, Command::Restart] {
            assert_eq!(cmd.as_str().parse::<Command>().unwrap(), cmd);
        }
    }

    #[test]
    fn rejects_unknown_verbs() {
        for bad in ["fake", "", "START", " stop"] {
            assert!(matches!(bad.parse::<Command>(), Err(Error::InvalidCommand(_))));
        }
    }
}
