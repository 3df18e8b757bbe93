//! Unit command surface
//!
//! Commands are registered explicitly by name with a handler and help text.
//! Every command, including a failed one, answers with a [`UnitOutcome`]
//! carrying a fresh unit status.

use mast_device::{CommandOutcome, DeviceError};
use mast_guiding::{Unit, UnitOutcome};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

pub type CommandFuture<'a> = Pin<Box<dyn Future<Output = UnitOutcome> + Send + 'a>>;

/// Runs one command against a unit with its (already split) arguments
pub type CommandHandler = for<'a> fn(&'a Unit, &'a [String]) -> CommandFuture<'a>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command '{0}' (try 'help')")]
    Unknown(String),
}

/// Help entry for one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandInfo {
    pub name: &'static str,
    pub args: &'static str,
    pub description: &'static str,
}

struct Command {
    info: CommandInfo,
    handler: CommandHandler,
}

pub struct CommandRegistry {
    commands: BTreeMap<&'static str, Command>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: BTreeMap::new(),
        }
    }

    /// Registry holding the full unit command set
    pub fn unit_commands() -> Self {
        let mut registry = Self::new();
        registry.register("connect", "", "Connect the camera", connect);
        registry.register("disconnect", "", "Disconnect the camera (stops guiding first)", disconnect);
        registry.register(
            "start_exposure",
            "<seconds>",
            "Start a light exposure of the given length",
            start_exposure,
        );
        registry.register("abort_exposure", "", "Abort the exposure without readout", abort_exposure);
        registry.register("stop_exposure", "", "Stop the exposure early and read it out", stop_exposure);
        registry.register(
            "startup",
            "",
            "Connect, turn the cooler on and cool to the operating set-point",
            startup,
        );
        registry.register(
            "shutdown",
            "",
            "Stop guiding, warm to the storage set-point and turn the cooler off",
            shutdown,
        );
        registry.register("start_guiding", "", "Start the guide loop", start_guiding);
        registry.register("stop_guiding", "", "Stop the guide loop", stop_guiding);
        registry.register("status", "", "Report unit status", status);
        registry
    }

    pub fn register(
        &mut self,
        name: &'static str,
        args: &'static str,
        description: &'static str,
        handler: CommandHandler,
    ) {
        self.commands.insert(
            name,
            Command {
                info: CommandInfo {
                    name,
                    args,
                    description,
                },
                handler,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        name == "help" || self.commands.contains_key(name)
    }

    /// Help entries, sorted by name, `help` included
    pub fn describe(&self) -> Vec<CommandInfo> {
        let mut infos: Vec<CommandInfo> = self.commands.values().map(|c| c.info.clone()).collect();
        infos.push(CommandInfo {
            name: "help",
            args: "",
            description: "List the available commands",
        });
        infos.sort_by_key(|info| info.name);
        infos
    }

    pub fn help_text(&self) -> String {
        self.describe()
            .iter()
            .map(|info| {
                let usage = if info.args.is_empty() {
                    info.name.to_string()
                } else {
                    format!("{} {}", info.name, info.args)
                };
                format!("  {:<24} {}", usage, info.description)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub async fn dispatch(&self, unit: &Unit, name: &str, args: &[String]) -> Result<UnitOutcome, CommandError> {
        if name == "help" {
            let described = serde_json::to_value(self.describe()).ok();
            let mut outcome = CommandOutcome::ok(unit.status().await);
            outcome.result = described;
            return Ok(outcome);
        }
        let command = self
            .commands
            .get(name)
            .ok_or_else(|| CommandError::Unknown(name.to_string()))?;
        tracing::debug!("command: {} {:?}", name, args);
        Ok((command.handler)(unit, args).await)
    }

    /// Split a console line and dispatch it; `None` for a blank line
    pub async fn dispatch_line(&self, unit: &Unit, line: &str) -> Option<Result<UnitOutcome, CommandError>> {
        let mut words = line.split_whitespace();
        let name = words.next()?;
        let args: Vec<String> = words.map(str::to_string).collect();
        Some(self.dispatch(unit, name, &args).await)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::unit_commands()
    }
}

// =============================================================================
// Handlers
// =============================================================================

fn connect<'a>(unit: &'a Unit, _args: &'a [String]) -> CommandFuture<'a> {
    Box::pin(unit.connect())
}

fn disconnect<'a>(unit: &'a Unit, _args: &'a [String]) -> CommandFuture<'a> {
    Box::pin(unit.disconnect())
}

fn start_exposure<'a>(unit: &'a Unit, args: &'a [String]) -> CommandFuture<'a> {
    Box::pin(async move {
        match parse_seconds(args) {
            Ok(seconds) => unit.start_exposure(seconds).await,
            Err(e) => CommandOutcome::from_result(Err::<(), _>(e), unit.status().await),
        }
    })
}

fn abort_exposure<'a>(unit: &'a Unit, _args: &'a [String]) -> CommandFuture<'a> {
    Box::pin(unit.abort_exposure())
}

fn stop_exposure<'a>(unit: &'a Unit, _args: &'a [String]) -> CommandFuture<'a> {
    Box::pin(unit.stop_exposure())
}

fn startup<'a>(unit: &'a Unit, _args: &'a [String]) -> CommandFuture<'a> {
    Box::pin(unit.startup())
}

fn shutdown<'a>(unit: &'a Unit, _args: &'a [String]) -> CommandFuture<'a> {
    Box::pin(unit.shutdown())
}

fn start_guiding<'a>(unit: &'a Unit, _args: &'a [String]) -> CommandFuture<'a> {
    Box::pin(unit.start_guiding())
}

fn stop_guiding<'a>(unit: &'a Unit, _args: &'a [String]) -> CommandFuture<'a> {
    Box::pin(unit.stop_guiding())
}

fn status<'a>(unit: &'a Unit, _args: &'a [String]) -> CommandFuture<'a> {
    Box::pin(unit.status_outcome())
}

fn parse_seconds(args: &[String]) -> Result<f64, DeviceError> {
    let raw = args
        .first()
        .ok_or_else(|| DeviceError::InvalidParameter("start_exposure needs <seconds>".to_string()))?;
    raw.parse::<f64>()
        .map_err(|_| DeviceError::InvalidParameter(format!("'{}' is not a number of seconds", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mast_device::{ErrorKind, SimulatedCamera, SimulatedCameraConfig, SimulatedMount};
    use mast_guiding::{ExternalWorker, UnitConfig};
    use std::sync::Arc;

    fn test_unit() -> Unit {
        Unit::new(
            UnitConfig::default(),
            Box::new(SimulatedCamera::new(SimulatedCameraConfig::for_tests())),
            Arc::new(SimulatedMount::default()),
            Arc::new(ExternalWorker),
        )
        .unwrap()
    }

    #[test]
    fn test_registry_lists_command_surface() {
        let registry = CommandRegistry::unit_commands();
        let names: Vec<&str> = registry.describe().iter().map(|i| i.name).collect();
        for expected in [
            "connect",
            "disconnect",
            "start_exposure",
            "abort_exposure",
            "stop_exposure",
            "startup",
            "shutdown",
            "start_guiding",
            "stop_guiding",
            "status",
            "help",
        ] {
            assert!(names.contains(&expected), "missing {}", expected);
        }
        assert!(registry.help_text().contains("start_exposure <seconds>"));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let registry = CommandRegistry::unit_commands();
        let unit = test_unit();
        let err = registry.dispatch(&unit, "focus", &[]).await.unwrap_err();
        assert_eq!(err, CommandError::Unknown("focus".to_string()));
        assert!(registry.dispatch_line(&unit, "   ").await.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_connect_then_expose() {
        let registry = CommandRegistry::unit_commands();
        let unit = test_unit();

        let outcome = registry.dispatch_line(&unit, "start_exposure 1").await.unwrap().unwrap();
        assert_eq!(outcome.error_kind(), Some(ErrorKind::NotConnected));

        let outcome = registry.dispatch_line(&unit, "connect").await.unwrap().unwrap();
        assert!(outcome.is_ok());
        assert!(outcome.status.camera.is_connected);

        let outcome = registry.dispatch_line(&unit, "start_exposure 0.5").await.unwrap().unwrap();
        assert!(outcome.is_ok());
        assert!(outcome.status.camera.activities.contains(&"Exposing".to_string()));
    }

    #[tokio::test]
    async fn test_bad_exposure_argument() {
        let registry = CommandRegistry::unit_commands();
        let unit = test_unit();

        for line in ["start_exposure", "start_exposure soon"] {
            let outcome = registry.dispatch_line(&unit, line).await.unwrap().unwrap();
            assert_eq!(outcome.error_kind(), Some(ErrorKind::InvalidParameter));
        }
    }

    #[tokio::test]
    async fn test_help_and_status() {
        let registry = CommandRegistry::unit_commands();
        let unit = test_unit();

        let outcome = registry.dispatch(&unit, "help", &[]).await.unwrap();
        let listed = outcome.result.unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 11);

        let outcome = registry.dispatch(&unit, "status", &[]).await.unwrap();
        assert!(outcome.error.is_none());
        assert_eq!(outcome.status.name, "mast00");
    }

    #[tokio::test]
    async fn test_stop_guiding_while_idle() {
        let registry = CommandRegistry::unit_commands();
        let unit = test_unit();
        let outcome = registry.dispatch(&unit, "stop_guiding", &[]).await.unwrap();
        assert!(outcome.is_ok());
    }
}
