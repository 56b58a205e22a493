// MIT License - Copyright (c) 2026 Peter Wright

//! Free-text command surface.
//!
//! The host exposes a single writable `Command` field per driver; strings
//! like `ArmArea:LivingRoom,Away,1234` are parsed here into structured
//! commands the drivers translate onto the wire.

use crate::error::{DriverError, Result};

/// Area arming mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmMode {
    Disarm,
    Day,
    Night,
    Away,
    Vacation,
}

impl ArmMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "disarm" | "off" => Some(Self::Disarm),
            "day" | "home" | "stay" => Some(Self::Day),
            "night" => Some(Self::Night),
            "away" => Some(Self::Away),
            "vacation" => Some(Self::Vacation),
            _ => None,
        }
    }
}

/// Setpoint selector for thermostat commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetpointKind {
    Heat,
    Cool,
}

/// Temperature scale given with a setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempScale {
    Fahrenheit,
    Celsius,
}

/// A parsed host command. Unit references are names, resolved against the
/// device model by the driver executing the command.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    ArmArea { area: String, mode: ArmMode, code: String },
    UnitOn { unit: String, delay_secs: u32 },
    UnitOff { unit: String, delay_secs: u32 },
    UnitLevel { unit: String, level: u8 },
    SetSetpoint { unit: String, kind: SetpointKind, degrees: i16, scale: TempScale },
    BypassZone { zone: String, code: String },
    RestoreZone { zone: String, code: String },
    LockDoor { unit: String },
    UnlockDoor { unit: String },
}

impl HostCommand {
    /// Parse a `Verb:arg,arg,...` command string.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (verb, rest) = text
            .split_once(':')
            .ok_or_else(|| DriverError::unsupported(format!("command has no verb: '{}'", text)))?;
        let args: Vec<&str> = rest.split(',').map(str::trim).collect();

        let want = |n: usize| -> Result<()> {
            if args.len() == n {
                Ok(())
            } else {
                Err(DriverError::unsupported(format!(
                    "{} expects {} arguments, got {}",
                    verb,
                    n,
                    args.len()
                )))
            }
        };

        match verb {
            "ArmArea" => {
                want(3)?;
                let mode = ArmMode::parse(args[1]).ok_or_else(|| {
                    DriverError::unsupported(format!("unknown arm mode '{}'", args[1]))
                })?;
                Ok(Self::ArmArea {
                    area: args[0].to_string(),
                    mode,
                    code: args[2].to_string(),
                })
            }
            "UnitOn" | "UnitOff" => {
                want(2)?;
                let delay_secs: u32 = args[1]
                    .parse()
                    .map_err(|_| DriverError::unsupported(format!("bad delay '{}'", args[1])))?;
                let unit = args[0].to_string();
                Ok(if verb == "UnitOn" {
                    Self::UnitOn { unit, delay_secs }
                } else {
                    Self::UnitOff { unit, delay_secs }
                })
            }
            "UnitLevel" => {
                want(2)?;
                let level: u8 = args[1]
                    .parse()
                    .ok()
                    .filter(|l| *l <= 100)
                    .ok_or_else(|| {
                        DriverError::unsupported(format!("bad level '{}' (0-100)", args[1]))
                    })?;
                Ok(Self::UnitLevel { unit: args[0].to_string(), level })
            }
            "SetSetPnt" => {
                want(4)?;
                let kind = match args[1].to_ascii_lowercase().as_str() {
                    "heat" => SetpointKind::Heat,
                    "cool" => SetpointKind::Cool,
                    other => {
                        return Err(DriverError::unsupported(format!(
                            "unknown setpoint kind '{}'",
                            other
                        )))
                    }
                };
                let degrees: i16 = args[2].parse().map_err(|_| {
                    DriverError::unsupported(format!("bad temperature '{}'", args[2]))
                })?;
                let scale = match args[3].to_ascii_uppercase().as_str() {
                    "F" => TempScale::Fahrenheit,
                    "C" => TempScale::Celsius,
                    other => {
                        return Err(DriverError::unsupported(format!(
                            "unknown temperature scale '{}'",
                            other
                        )))
                    }
                };
                Ok(Self::SetSetpoint { unit: args[0].to_string(), kind, degrees, scale })
            }
            "BypassZone" | "RestoreZone" => {
                want(2)?;
                let zone = args[0].to_string();
                let code = args[1].to_string();
                Ok(if verb == "BypassZone" {
                    Self::BypassZone { zone, code }
                } else {
                    Self::RestoreZone { zone, code }
                })
            }
            "LockDoor" => {
                want(1)?;
                Ok(Self::LockDoor { unit: args[0].to_string() })
            }
            "UnlockDoor" => {
                want(1)?;
                Ok(Self::UnlockDoor { unit: args[0].to_string() })
            }
            other => Err(DriverError::unsupported(format!("unknown command verb '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_arm_area() {
        let cmd = HostCommand::parse("ArmArea:LivingRoom,Away,1234").unwrap();
        assert_eq!(
            cmd,
            HostCommand::ArmArea {
                area: "LivingRoom".into(),
                mode: ArmMode::Away,
                code: "1234".into()
            }
        );
    }

    #[test]
    fn parse_unit_and_setpoint() {
        assert_eq!(
            HostCommand::parse("UnitOn:Lamp1,0").unwrap(),
            HostCommand::UnitOn { unit: "Lamp1".into(), delay_secs: 0 }
        );
        assert_eq!(
            HostCommand::parse("SetSetPnt:Thermo1,Heat,72,F").unwrap(),
            HostCommand::SetSetpoint {
                unit: "Thermo1".into(),
                kind: SetpointKind::Heat,
                degrees: 72,
                scale: TempScale::Fahrenheit
            }
        );
    }

    #[test]
    fn rejects_unknown_verb_and_bad_arity() {
        assert!(HostCommand::parse("Frobnicate:1").is_err());
        assert!(HostCommand::parse("no colon here").is_err());
        assert!(HostCommand::parse("ArmArea:OnlyOneArg").is_err());
        assert!(HostCommand::parse("UnitLevel:Lamp1,250").is_err());
    }
}
