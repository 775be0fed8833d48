//! JSON frames exchanged over a bridge connection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// A frame sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundFrame {
    /// Spawn the process this connection is bound to.
    Init {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Bytes for the bound process's stdin.
    Stdin { data: String },
    /// Run an allow-listed program on the bridge host.
    HostCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl InboundFrame {
    /// Decode one text message.
    pub fn parse(text: &str) -> crate::Result<Self> {
        let frame: InboundFrame =
            serde_json::from_str(text).map_err(|e| HubError::Frame(e.to_string()))?;
        // Empty host commands fall through to the allow-list check.
        match &frame {
            InboundFrame::Init { command, .. } if command.trim().is_empty() => {
                Err(HubError::Frame("'command' must not be empty".to_string()))
            }
            _ => Ok(frame),
        }
    }
}

/// A frame sent by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundFrame {
    Ready {
        message: String,
    },
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    /// The bound process ended. `signal` is set when it was killed by one.
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
    Error {
        message: String,
    },
    HostCommandResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
}

impl OutboundFrame {
    pub fn error(message: impl Into<String>) -> Self {
        OutboundFrame::Error {
            message: message.into(),
        }
    }

    /// A host command that did not run, or ran and could not be reported.
    pub fn host_failure(message: impl Into<String>) -> Self {
        OutboundFrame::HostCommandResult {
            success: false,
            data: None,
            message: Some(message.into()),
            code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_init_defaults() {
        let frame = InboundFrame::parse(r#"{"type":"init","command":"node"}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Init {
                command: "node".to_string(),
                args: vec![],
                env: HashMap::new(),
            }
        );
    }

    #[test]
    fn test_parse_host_command() {
        let frame =
            InboundFrame::parse(r#"{"type":"host-command","command":"ls","args":["-la"]}"#)
                .unwrap();
        assert!(matches!(
            frame,
            InboundFrame::HostCommand { command, args } if command == "ls" && args == vec!["-la"]
        ));
    }

    #[test]
    fn test_parse_keeps_empty_host_command() {
        let frame = InboundFrame::parse(r#"{"type":"host-command","command":""}"#).unwrap();
        assert!(matches!(frame, InboundFrame::HostCommand { command, .. } if command.is_empty()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for text in [
            "not json",
            r#"{"type":"launch","command":"x"}"#,
            r#"{"type":"stdin"}"#,
            r#"{"command":"node"}"#,
            r#"{"type":"init","command":"  "}"#,
        ] {
            let result = InboundFrame::parse(text);
            assert!(matches!(result, Err(HubError::Frame(_))), "accepted {text}");
        }
    }

    #[test]
    fn test_exit_serializes_nulls() {
        let frame = OutboundFrame::Exit {
            code: None,
            signal: Some("SIGTERM".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "exit", "code": null, "signal": "SIGTERM"})
        );
    }

    #[test]
    fn test_host_result_omits_absent_fields() {
        let frame = OutboundFrame::host_failure("command 'rm' is not allowed");
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "host-command-result",
                "success": false,
                "message": "command 'rm' is not allowed"
            })
        );
    }
}
