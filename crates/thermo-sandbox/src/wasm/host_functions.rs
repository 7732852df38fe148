//! Capability host functions for policy modules.
//!
//! Policy modules import exactly these functions from the `env` namespace:
//!
//! ```wat
//! (import "env" "get_sensor"   (func (result f32)))
//! (import "env" "set_actuator" (func (param f32)))   ;; or (param i32) for on/off
//! (import "env" "sleep"        (func (param i32)))
//! (import "env" "log"          (func (param i32 i32)))
//! ```
//!
//! ## Signature Encoding
//!
//! Signatures are written as parameter codes in parentheses followed by an
//! optional result code, with `i` for `i32` and `f` for `f32`:
//!
//! | Capability     | Signature      |
//! |----------------|----------------|
//! | `get_sensor`   | `()f`          |
//! | `set_actuator` | `(f)` or `(i)` |
//! | `sleep`        | `(i)`          |
//! | `log`          | `(ii)`         |
//!
//! `log` takes a pointer and a byte length into the module's exported
//! `memory`.
//!
//! Each call refills the module's fuel slice, so only code that stops
//! calling capabilities can run out of fuel.

use std::fmt;
use std::str::FromStr;

use thermo_core::ActuatorEncoding;
use thiserror::Error;
use wasmtime::{Caller, ExternType, FuncType, ImportType, Linker, Memory, ValType};

use super::runtime::HostState;
use crate::capabilities::{Capabilities, CapabilityFault, HostRejection};
use crate::error::InstantiationError;

/// Import namespace for all capabilities
pub const IMPORT_MODULE: &str = "env";

/// `get_sensor() -> f32`
pub const GET_SENSOR: &str = "get_sensor";
/// `set_actuator(value)`
pub const SET_ACTUATOR: &str = "set_actuator";
/// `sleep(duration_ms)`
pub const SLEEP: &str = "sleep";
/// `log(ptr, len)`
pub const LOG: &str = "log";

/// Names of every capability the host provides
pub const CAPABILITY_NAMES: [&str; 4] = [GET_SENSOR, SET_ACTUATOR, SLEEP, LOG];

/// Value types that may cross the capability ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiType {
    /// `i32`, code `i`
    I32,
    /// `f32`, code `f`
    F32,
}

impl AbiType {
    fn from_code(code: char) -> Option<Self> {
        match code {
            'i' => Some(AbiType::I32),
            'f' => Some(AbiType::F32),
            _ => None,
        }
    }

    fn code(&self) -> char {
        match self {
            AbiType::I32 => 'i',
            AbiType::F32 => 'f',
        }
    }

    fn matches(&self, ty: &ValType) -> bool {
        matches!(
            (self, ty),
            (AbiType::I32, ValType::I32) | (AbiType::F32, ValType::F32)
        )
    }
}

/// Malformed signature string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid capability signature `{0}`")]
pub struct SignatureParseError(pub String);

/// Binary signature of one capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySignature {
    /// Parameter types in order
    pub params: Vec<AbiType>,
    /// Result type, if any
    pub result: Option<AbiType>,
}

impl CapabilitySignature {
    /// Whether a module's function type has exactly this signature
    pub fn matches(&self, ty: &FuncType) -> bool {
        let results: Vec<ValType> = ty.results().collect();
        let result_ok = match (&self.result, results.as_slice()) {
            (None, []) => true,
            (Some(expected), [found]) => expected.matches(found),
            _ => false,
        };

        result_ok
            && ty.params().len() == self.params.len()
            && self.params.iter().zip(ty.params()).all(|(p, t)| p.matches(&t))
    }
}

impl FromStr for CapabilitySignature {
    type Err = SignatureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || SignatureParseError(s.to_string());
        let rest = s.strip_prefix('(').ok_or_else(err)?;
        let (params, result) = rest.split_once(')').ok_or_else(err)?;

        let params = params
            .chars()
            .map(|c| AbiType::from_code(c).ok_or_else(err))
            .collect::<Result<Vec<_>, _>>()?;

        let mut result_chars = result.chars();
        let result = match (result_chars.next(), result_chars.next()) {
            (None, _) => None,
            (Some(c), None) => Some(AbiType::from_code(c).ok_or_else(err)?),
            _ => return Err(err()),
        };

        Ok(Self { params, result })
    }
}

impl fmt::Display for CapabilitySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for p in &self.params {
            write!(f, "{}", p.code())?;
        }
        write!(f, ")")?;
        if let Some(r) = &self.result {
            write!(f, "{}", r.code())?;
        }
        Ok(())
    }
}

/// Render any function type in signature notation, using `?` for types the
/// ABI does not carry.
pub fn describe_func_type(ty: &FuncType) -> String {
    let code = |t: ValType| match t {
        ValType::I32 => 'i',
        ValType::F32 => 'f',
        ValType::I64 => 'I',
        ValType::F64 => 'F',
        _ => '?',
    };
    let params: String = ty.params().map(code).collect();
    let results: String = ty.results().map(code).collect();
    format!("({}){}", params, results)
}

/// One entry of the capability table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityBinding {
    /// Import name
    pub name: &'static str,
    /// Signature the module must import it with
    pub signature: CapabilitySignature,
}

/// The four capabilities, with the signatures they are bound under and the
/// host state they operate on.
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    bindings: Vec<CapabilityBinding>,
    capabilities: Capabilities,
}

impl CapabilityTable {
    /// Standard table; `set_actuator` follows the actuator's encoding.
    pub fn new(capabilities: Capabilities) -> Self {
        let set_actuator = match capabilities.actuator().encoding {
            ActuatorEncoding::Float => "(f)",
            ActuatorEncoding::Integer => "(i)",
        };

        let bindings = [
            (GET_SENSOR, "()f"),
            (SET_ACTUATOR, set_actuator),
            (SLEEP, "(i)"),
            (LOG, "(ii)"),
        ]
        .into_iter()
        .filter_map(|(name, sig)| {
            sig.parse()
                .ok()
                .map(|signature| CapabilityBinding { name, signature })
        })
        .collect();

        Self {
            bindings,
            capabilities,
        }
    }

    /// Bound entries
    pub fn bindings(&self) -> &[CapabilityBinding] {
        &self.bindings
    }

    /// Look up a capability by import name
    pub fn lookup(&self, name: &str) -> Option<&CapabilityBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    /// Host state behind the table
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Check one module import against the table.
    pub fn check_import(&self, import: &ImportType<'_>) -> Result<(), InstantiationError> {
        let unknown = || InstantiationError::UnknownImport {
            module: import.module().to_string(),
            name: import.name().to_string(),
        };
        if import.module() != IMPORT_MODULE {
            return Err(unknown());
        }
        let binding = self.lookup(import.name()).ok_or_else(unknown)?;

        match import.ty() {
            ExternType::Func(ty) if binding.signature.matches(&ty) => Ok(()),
            ExternType::Func(ty) => Err(InstantiationError::SignatureMismatch {
                name: binding.name.to_string(),
                expected: binding.signature.to_string(),
                found: describe_func_type(&ty),
            }),
            _ => Err(unknown()),
        }
    }

    /// Install the capabilities in `linker`.
    pub(crate) fn register(&self, linker: &mut Linker<HostState>) -> Result<(), InstantiationError> {
        register_get_sensor(linker)?;
        match self.capabilities.actuator().encoding {
            ActuatorEncoding::Float => register_set_actuator_f32(linker)?,
            ActuatorEncoding::Integer => register_set_actuator_i32(linker)?,
        }
        register_sleep(linker)?;
        register_log(linker)?;
        Ok(())
    }
}

/// Whether an import could be satisfied by some capability table.
///
/// Used at instantiation, before the table (and therefore the actuator
/// encoding) is known.
pub(crate) fn check_import_name(import: &ImportType<'_>) -> Result<(), InstantiationError> {
    let provided = import.module() == IMPORT_MODULE
        && CAPABILITY_NAMES.contains(&import.name())
        && matches!(import.ty(), ExternType::Func(_));
    if provided {
        Ok(())
    } else {
        Err(InstantiationError::UnknownImport {
            module: import.module().to_string(),
            name: import.name().to_string(),
        })
    }
}

// ============================================================================
// Registration
// ============================================================================

fn link_error(name: &str, e: wasmtime::Error) -> InstantiationError {
    InstantiationError::Link(format!("failed to register {}: {}", name, e))
}

fn register_get_sensor(linker: &mut Linker<HostState>) -> Result<(), InstantiationError> {
    linker
        .func_wrap(
            IMPORT_MODULE,
            GET_SENSOR,
            |mut caller: Caller<'_, HostState>| -> wasmtime::Result<f32> {
                let caps = enter(&mut caller, GET_SENSOR)?;
                Ok(caps.get_sensor()?)
            },
        )
        .map_err(|e| link_error(GET_SENSOR, e))?;
    Ok(())
}

fn register_set_actuator_f32(linker: &mut Linker<HostState>) -> Result<(), InstantiationError> {
    linker
        .func_wrap(
            IMPORT_MODULE,
            SET_ACTUATOR,
            |mut caller: Caller<'_, HostState>, value: f32| -> wasmtime::Result<()> {
                let caps = enter(&mut caller, SET_ACTUATOR)?;
                caps.set_actuator(value)?;
                Ok(())
            },
        )
        .map_err(|e| link_error(SET_ACTUATOR, e))?;
    Ok(())
}

fn register_set_actuator_i32(linker: &mut Linker<HostState>) -> Result<(), InstantiationError> {
    linker
        .func_wrap(
            IMPORT_MODULE,
            SET_ACTUATOR,
            |mut caller: Caller<'_, HostState>, value: i32| -> wasmtime::Result<()> {
                let caps = enter(&mut caller, SET_ACTUATOR)?;
                caps.set_actuator_int(value)?;
                Ok(())
            },
        )
        .map_err(|e| link_error(SET_ACTUATOR, e))?;
    Ok(())
}

fn register_sleep(linker: &mut Linker<HostState>) -> Result<(), InstantiationError> {
    linker
        .func_wrap(
            IMPORT_MODULE,
            SLEEP,
            |mut caller: Caller<'_, HostState>, duration_ms: i32| -> wasmtime::Result<()> {
                let caps = enter(&mut caller, SLEEP)?;
                caps.sleep(duration_ms)?;
                Ok(())
            },
        )
        .map_err(|e| link_error(SLEEP, e))?;
    Ok(())
}

fn register_log(linker: &mut Linker<HostState>) -> Result<(), InstantiationError> {
    linker
        .func_wrap(
            IMPORT_MODULE,
            LOG,
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                let caps = enter(&mut caller, LOG)?;
                let memory = get_memory(&mut caller)?;
                let message = read_bytes(&memory, &caller, ptr, len)?;
                caps.log(message)?;
                Ok(())
            },
        )
        .map_err(|e| link_error(LOG, e))?;
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Common prologue of every capability: refill the fuel slice and fetch the
/// bound capabilities.
fn enter(caller: &mut Caller<'_, HostState>, name: &'static str) -> wasmtime::Result<Capabilities> {
    let slice = caller.data().fuel_per_slice;
    caller.set_fuel(slice)?;
    caller
        .data()
        .capabilities
        .clone()
        .ok_or_else(|| rejected(HostRejection::Unbound(name)))
}

fn rejected(rejection: HostRejection) -> wasmtime::Error {
    wasmtime::Error::new(CapabilityFault::Rejected(rejection))
}

/// Get the module's exported memory.
fn get_memory(caller: &mut Caller<'_, HostState>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| rejected(HostRejection::NoMemory))
}

/// Borrow `len` bytes at `ptr` from linear memory, bounds-checked.
fn read_bytes<'a>(
    memory: &Memory,
    caller: &'a Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<&'a [u8]> {
    let out_of_bounds = || rejected(HostRejection::OutOfBounds { ptr, len });
    let start = usize::try_from(ptr).map_err(|_| out_of_bounds())?;
    let len_bytes = usize::try_from(len).map_err(|_| out_of_bounds())?;
    let end = start.checked_add(len_bytes).ok_or_else(out_of_bounds)?;

    memory.data(caller).get(start..end).ok_or_else(out_of_bounds)
}
