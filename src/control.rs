//! Line-oriented scan control: `start <ROD> <scanId> <moduleMask>` and
//! `abort <ROD> <scanId>`. Blank lines and `#` comments are ignored.

use thiserror::Error;

use crate::manager::parse_rod_string;
use crate::scan::ScanId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Start {
        crate_id: u32,
        rod: u32,
        scan_id: ScanId,
        module_mask: u32,
    },
    Abort {
        crate_id: u32,
        rod: u32,
        scan_id: ScanId,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("expected {expected} arguments, got {got}")]
    Arity { expected: usize, got: usize },
    #[error("invalid ROD name {0:?}")]
    Rod(String),
    #[error("invalid number {0:?}")]
    Number(String),
}

pub fn parse_line(line: &str) -> Result<Option<ControlCommand>, ControlError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    match verb {
        "start" => {
            expect_args(&args, 3)?;
            let (crate_id, rod) = rod(args[0])?;
            Ok(Some(ControlCommand::Start {
                crate_id,
                rod,
                scan_id: number(args[1])?,
                module_mask: number(args[2])?,
            }))
        }
        "abort" => {
            expect_args(&args, 2)?;
            let (crate_id, rod) = rod(args[0])?;
            Ok(Some(ControlCommand::Abort {
                crate_id,
                rod,
                scan_id: number(args[1])?,
            }))
        }
        other => Err(ControlError::UnknownCommand(other.to_string())),
    }
}

fn expect_args(args: &[&str], expected: usize) -> Result<(), ControlError> {
    if args.len() != expected {
        return Err(ControlError::Arity {
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn rod(text: &str) -> Result<(u32, u32), ControlError> {
    parse_rod_string(text)
        .map(|(_, crate_id, rod)| (crate_id, rod))
        .ok_or_else(|| ControlError::Rod(text.to_string()))
}

/// Decimal or `0x`-prefixed hexadecimal.
fn number(text: &str) -> Result<u32, ControlError> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| ControlError::Number(text.to_string()))
}
