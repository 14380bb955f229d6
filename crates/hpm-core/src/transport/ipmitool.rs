//! Transport backed by the `ipmitool raw` command.
//!
//! Each request spawns one `ipmitool` process, which opens and closes its own
//! session. Response bytes are read back from its hex dump; a non-zero
//! completion code is recovered from the `rsp=0x..` field of its error line.

use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::traits::{ChannelKind, IpmiRequest, IpmiResponse, IpmiTransport, TransportError};
use crate::protocol::constants::DEFAULT_MAX_REQUEST_SIZE;

/// Settings for the ipmitool-backed channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpmitoolConfig {
    /// Path or name of the ipmitool executable.
    pub program: String,
    /// ipmitool interface (`open`, `lan`, `lanplus`, ...).
    pub interface: String,
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Bridged target address (`-t`).
    pub target: Option<u8>,
    /// Largest request payload the channel carries.
    pub max_request_size: usize,
}

impl Default for IpmitoolConfig {
    fn default() -> Self {
        Self {
            program: "ipmitool".to_string(),
            interface: "open".to_string(),
            host: None,
            user: None,
            password: None,
            target: None,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }
}

/// ipmitool-based IPMI transport.
pub struct IpmitoolTransport {
    config: IpmitoolConfig,
}

impl IpmitoolTransport {
    pub fn new(config: IpmitoolConfig) -> Self {
        Self { config }
    }

    fn command(&self, req: &IpmiRequest) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.arg("-I").arg(&self.config.interface);
        if let Some(host) = &self.config.host {
            cmd.arg("-H").arg(host);
        }
        if let Some(user) = &self.config.user {
            cmd.arg("-U").arg(user);
        }
        if let Some(password) = &self.config.password {
            cmd.arg("-P").arg(password);
        }
        if let Some(target) = self.config.target {
            cmd.arg("-t").arg(format!("0x{:02x}", target));
        }
        cmd.arg("raw")
            .arg(format!("0x{:02x}", req.netfn))
            .arg(format!("0x{:02x}", req.cmd));
        for b in &req.data {
            cmd.arg(format!("0x{:02x}", b));
        }
        cmd
    }
}

impl IpmiTransport for IpmitoolTransport {
    #[instrument(level = "trace", skip(self), fields(netfn = req.netfn, cmd = req.cmd))]
    fn send_recv(&self, req: &IpmiRequest) -> Result<IpmiResponse, TransportError> {
        let output = self.command(req).output().map_err(|e| {
            TransportError::SendFailed(format!("{}: {}", self.config.program, e))
        })?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let data = parse_raw_output(&stdout)?;
            debug!(bytes = data.len(), "ipmitool raw response");
            return Ok(IpmiResponse::new(0x00, data));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        match parse_completion_code(&stderr) {
            Some(cc) => {
                debug!(cc = %format!("0x{:02X}", cc), "ipmitool raw completion code");
                Ok(IpmiResponse::code(cc))
            }
            None => {
                debug!(stderr = %stderr.trim(), "ipmitool produced no response");
                Err(TransportError::NoResponse)
            }
        }
    }

    fn channel_kind(&self) -> ChannelKind {
        if self.config.interface.starts_with("lan") {
            ChannelKind::Lan
        } else {
            ChannelKind::Local
        }
    }

    fn max_request_size(&self) -> usize {
        self.config.max_request_size
    }

    fn is_directly_attached(&self) -> bool {
        self.config.target.is_none()
    }

    fn reopen(&self) -> Result<(), TransportError> {
        // Every invocation already runs in a fresh session.
        debug!("ipmitool session reopen requested");
        Ok(())
    }
}

/// Parse the whitespace separated hex dump printed by `ipmitool raw`.
fn parse_raw_output(text: &str) -> Result<Vec<u8>, TransportError> {
    text.split_whitespace()
        .map(|tok| {
            u8::from_str_radix(tok, 16)
                .map_err(|_| TransportError::InvalidResponse(format!("bad hex byte '{}'", tok)))
        })
        .collect()
}

/// Extract the completion code from an ipmitool error line such as
/// `Unable to send RAW command (channel=0x0 netfn=0x2c lun=0x0 cmd=0x2e rsp=0xc1): Invalid command`.
fn parse_completion_code(text: &str) -> Option<u8> {
    let start = text.find("rsp=0x")? + "rsp=0x".len();
    let hex: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    u8::from_str_radix(&hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_output() {
        let out = " 00 01 c0 03 06 02\n 04 0c\n";
        assert_eq!(
            parse_raw_output(out).unwrap(),
            vec![0x00, 0x01, 0xC0, 0x03, 0x06, 0x02, 0x04, 0x0C]
        );
        assert!(parse_raw_output("zz").is_err());
        assert!(parse_raw_output("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_completion_code() {
        let err = "Unable to send RAW command (channel=0x0 netfn=0x2c lun=0x0 cmd=0x32 rsp=0xc7): Request data length invalid";
        assert_eq!(parse_completion_code(err), Some(0xC7));
        assert_eq!(parse_completion_code("Error: Unable to establish LAN session"), None);
    }

    #[test]
    fn test_command_line() {
        let transport = IpmitoolTransport::new(IpmitoolConfig {
            interface: "lanplus".to_string(),
            host: Some("10.0.0.5".to_string()),
            target: Some(0x82),
            ..Default::default()
        });
        assert_eq!(transport.channel_kind(), ChannelKind::Lan);
        assert!(!transport.is_directly_attached());

        let req = IpmiRequest::new(0x2C, 0x2E, vec![0x00]);
        let cmd = transport.command(&req);
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["-I", "lanplus", "-H", "10.0.0.5", "-t", "0x82", "raw", "0x2c", "0x2e", "0x00"]
        );
    }
}
