use std::collections::BTreeMap;
use std::fmt;

use crate::config::MultiplayerConfig;

use super::{Console, ConsoleError, ConsoleFlags};

#[derive(Debug, Clone, PartialEq)]
pub enum CvarValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Str(String),
}

impl CvarValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CvarValue::Bool(v) => Some(*v),
            CvarValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            CvarValue::Int(v) => Some(*v),
            CvarValue::Bool(v) => Some(*v as i64),
            CvarValue::Float(v) => Some(*v as i64),
            CvarValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CvarValue::Str(v) => Some(v),
            _ => None,
        }
    }

    fn parse_like(&self, raw: &str) -> Option<CvarValue> {
        match self {
            CvarValue::Bool(_) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => Some(CvarValue::Bool(true)),
                "0" | "false" | "off" => Some(CvarValue::Bool(false)),
                _ => None,
            },
            CvarValue::Int(_) => raw.parse().ok().map(CvarValue::Int),
            CvarValue::Float(_) => raw.parse().ok().map(CvarValue::Float),
            CvarValue::Str(_) => Some(CvarValue::Str(raw.to_string())),
        }
    }
}

impl fmt::Display for CvarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CvarValue::Bool(v) => write!(f, "{}", v),
            CvarValue::Int(v) => write!(f, "{}", v),
            CvarValue::Float(v) => write!(f, "{}", v),
            CvarValue::Str(v) => f.write_str(v),
        }
    }
}

type ConsoleFunction = Box<dyn FnMut(&[&str]) -> Result<(), String> + Send>;

struct Cvar {
    name: String,
    value: CvarValue,
    flags: ConsoleFlags,
}

struct Function {
    flags: ConsoleFlags,
    handler: ConsoleFunction,
}

/// Console backed by registered variables and functions. Names match
/// case-insensitively.
pub struct CvarRegistry {
    cvars: BTreeMap<String, Cvar>,
    functions: BTreeMap<String, Function>,
}

impl Default for CvarRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CvarRegistry {
    pub fn new() -> Self {
        Self {
            cvars: BTreeMap::new(),
            functions: BTreeMap::new(),
        }
    }

    /// Registers the session variables with values taken from `config`.
    pub fn from_config(config: &MultiplayerConfig) -> Self {
        let local = ConsoleFlags::DONT_REPLICATE;
        let mut registry = Self::new();
        registry.register_cvar("cl_clientport", CvarValue::Int(config.client_port.into()), local);
        registry.register_cvar("cl_serveraddr", CvarValue::Str(config.server_addr.clone()), local);
        registry.register_cvar("cl_serverport", CvarValue::Int(config.server_port.into()), local);
        registry.register_cvar("sv_port", CvarValue::Int(config.port.into()), local);
        registry.register_cvar("sv_map", CvarValue::Str(config.map.clone()), local);
        registry.register_cvar(
            "sv_protocol",
            CvarValue::Str(config.protocol.to_string()),
            local,
        );
        registry.register_cvar("sv_isDedicated", CvarValue::Bool(config.dedicated), local);
        registry.register_cvar(
            "sv_serverSendRateMs",
            CvarValue::Int(config.server_send_rate_ms.into()),
            ConsoleFlags::NONE,
        );
        registry.register_cvar(
            "cl_defaultNetworkEntityActivationTimeSliceMs",
            CvarValue::Int(config.activation_time_slice_ms.into()),
            local,
        );
        registry.register_cvar(
            "sv_defaultPlayerSpawnAsset",
            CvarValue::Str(config.default_player_spawn_asset.clone()),
            local,
        );

        registry.register_function("LoadLevel", local, |args| {
            log::info!("Loading level {}", args.first().copied().unwrap_or("<none>"));
            Ok(())
        });
        registry
    }

    pub fn register_cvar(&mut self, name: &str, value: CvarValue, flags: ConsoleFlags) {
        self.cvars.insert(
            name.to_ascii_lowercase(),
            Cvar {
                name: name.to_string(),
                value,
                flags,
            },
        );
    }

    /// Replaces any function already registered under `name`.
    pub fn register_function<F>(&mut self, name: &str, flags: ConsoleFlags, handler: F)
    where
        F: FnMut(&[&str]) -> Result<(), String> + Send + 'static,
    {
        self.functions.insert(
            name.to_ascii_lowercase(),
            Function {
                flags,
                handler: Box::new(handler),
            },
        );
    }

    pub fn set(&mut self, name: &str, value: CvarValue) -> bool {
        match self.cvars.get_mut(&name.to_ascii_lowercase()) {
            Some(cvar) => {
                cvar.value = value;
                true
            }
            None => false,
        }
    }

    pub fn cvar_names(&self) -> impl Iterator<Item = &str> {
        self.cvars.values().map(|cvar| cvar.name.as_str())
    }
}

impl Console for CvarRegistry {
    fn perform_command(
        &mut self,
        command: &str,
        required: ConsoleFlags,
    ) -> Result<ConsoleFlags, ConsoleError> {
        let mut tokens = command.split_whitespace();
        let name = tokens.next().ok_or(ConsoleError::Empty)?;
        let args: Vec<&str> = tokens.collect();
        let key = name.to_ascii_lowercase();

        if let Some(cvar) = self.cvars.get_mut(&key) {
            if !cvar.flags.contains(required) {
                return Err(ConsoleError::PermissionDenied(cvar.name.clone()));
            }
            if args.is_empty() {
                log::info!("{} = {}", cvar.name, cvar.value);
                return Ok(cvar.flags);
            }
            if cvar.flags.contains(ConsoleFlags::READ_ONLY) {
                return Err(ConsoleError::ReadOnly(cvar.name.clone()));
            }
            let raw = args.join(" ");
            let value = cvar
                .value
                .parse_like(&raw)
                .ok_or_else(|| ConsoleError::InvalidValue {
                    name: cvar.name.clone(),
                    value: raw.clone(),
                })?;
            log::debug!("{} changed to {}", cvar.name, value);
            cvar.value = value;
            return Ok(cvar.flags);
        }

        let function = self
            .functions
            .get_mut(&key)
            .ok_or_else(|| ConsoleError::UnknownCommand(name.to_string()))?;
        if !function.flags.contains(required) {
            return Err(ConsoleError::PermissionDenied(name.to_string()));
        }
        (function.handler)(&args).map_err(|reason| ConsoleError::Failed {
            name: name.to_string(),
            reason,
        })?;
        Ok(function.flags)
    }

    fn cvar(&self, name: &str) -> Option<CvarValue> {
        self.cvars
            .get(&name.to_ascii_lowercase())
            .map(|cvar| cvar.value.clone())
    }

    fn flags(&self, name: &str) -> Option<ConsoleFlags> {
        let key = name.to_ascii_lowercase();
        self.cvars
            .get(&key)
            .map(|cvar| cvar.flags)
            .or_else(|| self.functions.get(&key).map(|function| function.flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_from_config() {
        let registry = CvarRegistry::from_config(&MultiplayerConfig::default());
        assert_eq!(
            registry.cvar("sv_serverSendRateMs"),
            Some(CvarValue::Int(50))
        );
        assert_eq!(
            registry.cvar("SV_MAP").and_then(|v| v.as_str().map(String::from)),
            Some("nolevel".to_string())
        );
        assert_eq!(registry.flags("sv_port"), Some(ConsoleFlags::DONT_REPLICATE));
        assert_eq!(registry.cvar_names().count(), 10);
    }

    #[test]
    fn set_parses_by_type() {
        let mut registry = CvarRegistry::from_config(&MultiplayerConfig::default());
        registry
            .perform_command("sv_serverSendRateMs 33", ConsoleFlags::NONE)
            .unwrap();
        assert_eq!(registry.cvar("sv_serverSendRateMs"), Some(CvarValue::Int(33)));

        let err = registry
            .perform_command("sv_isDedicated maybe", ConsoleFlags::NONE)
            .unwrap_err();
        assert!(matches!(err, ConsoleError::InvalidValue { .. }));
    }

    #[test]
    fn required_flags_gate_commands() {
        let mut registry = CvarRegistry::from_config(&MultiplayerConfig::default());
        registry.register_cvar("g_gravity", CvarValue::Float(-9.8), ConsoleFlags::ALLOW_CLIENT_SET);

        assert_eq!(
            registry.perform_command("sv_map arena", ConsoleFlags::ALLOW_CLIENT_SET),
            Err(ConsoleError::PermissionDenied("sv_map".to_string()))
        );
        assert!(
            registry
                .perform_command("g_gravity -3.5", ConsoleFlags::ALLOW_CLIENT_SET)
                .is_ok()
        );
        assert_eq!(registry.cvar("g_gravity"), Some(CvarValue::Float(-3.5)));
    }

    #[test]
    fn functions_receive_arguments() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut registry = CvarRegistry::new();
        registry.register_function("LoadLevel", ConsoleFlags::DONT_REPLICATE, move |args| {
            tx.send(args.join(" ")).map_err(|e| e.to_string())
        });

        let flags = registry
            .perform_command("loadlevel nolevel", ConsoleFlags::NONE)
            .unwrap();
        assert_eq!(flags, ConsoleFlags::DONT_REPLICATE);
        assert_eq!(rx.try_recv().unwrap(), "nolevel");
        assert_eq!(
            registry.perform_command("nope", ConsoleFlags::NONE),
            Err(ConsoleError::UnknownCommand("nope".to_string()))
        );
    }
}
