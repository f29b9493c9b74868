//! Control channel commands.
//!
//! One command per line:
//!
//! ```text
//! start <driver> [-n "<name>"] [-c "<config>"] [-s "<skel>"] [-p "<prefix>"]
//! stop <driver> [<name>]
//! start <device>@<host>[:<port>]
//! ```
//!
//! A line containing `@` names a remote driver: everything after the command
//! word is the remote driver argument, with double quotes removed.

use crate::{
    driver::{DriverLaunch, LocalLaunch, RemoteLaunch},
    error::{CoreError, Result},
};

/// A parsed control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Start a new driver
    Start {
        /// Persistent name, matched later by `stop`
        name: String,
        /// How to launch it
        launch: DriverLaunch,
    },
    /// Stop the first running driver with this name
    Stop {
        /// Persistent driver name
        name: String,
        /// Only stop it if it owns this device
        device: Option<String>,
    },
}

impl ControlCommand {
    /// Parse one control line.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim_start();
        let bad = || CoreError::InvalidControl(line.to_string());

        if !matches!(command, "start" | "stop") {
            return Err(bad());
        }

        if line.contains('@') {
            let spec: String = rest.chars().filter(|c| *c != '"').collect();
            let spec = spec.trim().to_string();
            if spec.is_empty() {
                return Err(bad());
            }
            return Ok(if command == "start" {
                let launch = DriverLaunch::Remote(RemoteLaunch::parse(&spec)?);
                Self::Start { name: spec, launch }
            } else {
                Self::Stop { name: spec, device: None }
            });
        }

        let (driver, options) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        if driver.is_empty() {
            return Err(bad());
        }
        let options = parse_options(options);
        let option = |flag: char| {
            options.iter().find(|(f, _)| *f == flag).map(|(_, v)| v.clone())
        };

        if command == "start" {
            let launch = LocalLaunch {
                program: driver.to_string(),
                device: option('n'),
                config: option('c'),
                skeleton: option('s'),
                prefix: option('p'),
                clear_unset: true,
            };
            return Ok(Self::Start { name: driver.to_string(), launch: DriverLaunch::Local(launch) });
        }

        // stop <driver> [-n "<name>" | <name>]
        let device = option('n').or_else(|| {
            let bare: String = rest[driver.len()..].chars().filter(|c| *c != '"').collect();
            let bare = bare.trim();
            (!bare.is_empty() && !bare.starts_with('-')).then(|| bare.to_string())
        });
        Ok(Self::Stop { name: driver.to_string(), device })
    }
}

/// Collect `-x "value"` pairs, stopping at the first token that does not fit.
fn parse_options(mut input: &str) -> Vec<(char, String)> {
    let mut options = Vec::new();
    loop {
        input = input.trim_start();
        let mut chars = input.chars();
        let (Some('-'), Some(flag)) = (chars.next(), chars.next()) else {
            break;
        };
        let after_flag = chars.as_str().trim_start();
        let Some(quoted) = after_flag.strip_prefix('"') else {
            break;
        };
        let Some((value, rest)) = quoted.split_once('"') else {
            break;
        };
        if value.is_empty() {
            break;
        }
        options.push((flag, value.to_string()));
        input = rest;
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_local_with_options() {
        let cmd = ControlCommand::parse(
            r#"start indi_simulator_ccd -n "CCD Sim" -c "/tmp/ccd.xml" -p "/opt/indi""#,
        )
        .unwrap();

        let ControlCommand::Start { name, launch: DriverLaunch::Local(local) } = cmd else {
            panic!("expected local start");
        };
        assert_eq!(name, "indi_simulator_ccd");
        assert_eq!(local.device.as_deref(), Some("CCD Sim"));
        assert_eq!(local.config.as_deref(), Some("/tmp/ccd.xml"));
        assert_eq!(local.skeleton, None);
        assert_eq!(local.prefix.as_deref(), Some("/opt/indi"));
        assert!(local.clear_unset);
    }

    #[test]
    fn start_local_bare() {
        let cmd = ControlCommand::parse("start indi_lx200generic\n").unwrap();
        assert!(matches!(
            cmd,
            ControlCommand::Start { launch: DriverLaunch::Local(LocalLaunch { ref program, .. }), .. }
                if program == "indi_lx200generic"
        ));
    }

    #[test]
    fn start_remote_strips_quotes() {
        let cmd = ControlCommand::parse(r#"start "Camera@obs:7625""#).unwrap();
        let ControlCommand::Start { name, launch: DriverLaunch::Remote(remote) } = cmd else {
            panic!("expected remote start");
        };
        assert_eq!(name, "Camera@obs:7625");
        assert_eq!(remote.device.as_deref(), Some("Camera"));
        assert_eq!(remote.port, 7625);
    }

    #[test]
    fn stop_with_and_without_device() {
        assert_eq!(
            ControlCommand::parse("stop indi_simulator_ccd").unwrap(),
            ControlCommand::Stop { name: "indi_simulator_ccd".to_string(), device: None }
        );
        assert_eq!(
            ControlCommand::parse(r#"stop indi_simulator_ccd "CCD Simulator""#).unwrap(),
            ControlCommand::Stop {
                name: "indi_simulator_ccd".to_string(),
                device: Some("CCD Simulator".to_string()),
            }
        );
        assert_eq!(
            ControlCommand::parse(r#"stop indi_simulator_ccd -n "CCD Simulator""#).unwrap(),
            ControlCommand::Stop {
                name: "indi_simulator_ccd".to_string(),
                device: Some("CCD Simulator".to_string()),
            }
        );
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(ControlCommand::parse("").is_err());
        assert!(ControlCommand::parse("restart drv").is_err());
        assert!(ControlCommand::parse("start").is_err());
        assert!(ControlCommand::parse("start @").is_err());
    }
}
