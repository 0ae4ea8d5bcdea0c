//! Control commands understood by the node clients.

use std::fmt;

/// A command for the node client, encoded as one line of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Update the reported position of the node
    PositionUpdate(String),

    /// Start the application, passing each entry as an `args=` argument
    NetUp(Vec<String>),

    /// Stop the application
    NetDown,

    /// Write a string to the standard input of the application
    SendToApp(String),
}

impl ControlCommand {
    /// Returns the command text without terminator.
    pub fn to_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PositionUpdate(pos) => write!(f, "CTRL_POSITION_UPDATE {pos}"),
            Self::NetUp(args) => {
                write!(f, "CTRL_NET_UP_REQ ")?;
                let joined: Vec<String> = args.iter().map(|a| format!("args={a}")).collect();
                write!(f, "{}", joined.join(" "))
            }
            Self::NetDown => write!(f, "CTRL_NET_DOWN_REQ"),
            Self::SendToApp(msg) => write!(f, "CTRL_SEND_TO_APP {msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_update() {
        let cmd = ControlCommand::PositionUpdate("1.5;2.0;0.0".to_string());
        assert_eq!(cmd.to_text(), "CTRL_POSITION_UPDATE 1.5;2.0;0.0");
    }

    #[test]
    fn test_net_up_args() {
        let cmd = ControlCommand::NetUp(vec!["-b115200".to_string(), "./tty".to_string()]);
        assert_eq!(cmd.to_text(), "CTRL_NET_UP_REQ args=-b115200 args=./tty");
    }

    #[test]
    fn test_net_up_without_args() {
        assert_eq!(ControlCommand::NetUp(Vec::new()).to_text(), "CTRL_NET_UP_REQ ");
    }

    #[test]
    fn test_net_down_and_send() {
        assert_eq!(ControlCommand::NetDown.to_text(), "CTRL_NET_DOWN_REQ");
        assert_eq!(
            ControlCommand::SendToApp("led on".to_string()).to_text(),
            "CTRL_SEND_TO_APP led on"
        );
    }
}
