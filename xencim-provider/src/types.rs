//! Type definitions for the protocol-neutral object model and pool records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

// =============================================================================
// CALLER IDENTITY
// =============================================================================

/// Caller credentials extracted by the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// =============================================================================
// PROPERTY VALUES
// =============================================================================

/// A typed property value written into an [`Instance`] or passed as a method argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    String(String),
    Bool(bool),
    U16(u16),
    U32(u32),
    U64(u64),
    DateTime(DateTime<Utc>),
    StringArray(Vec<String>),
    Reference(ObjectPath),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of integer values, used by query comparisons and argument parsing.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U16(v) => Some(u64::from(*v)),
            Value::U32(v) => Some(u64::from(*v)),
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&ObjectPath> {
        match self {
            Value::Reference(path) => Some(path),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::U16(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringArray(v)
    }
}

impl From<ObjectPath> for Value {
    fn from(v: ObjectPath) -> Self {
        Value::Reference(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Value::StringArray(v) => write!(f, "{}", v.join(",")),
            Value::Reference(path) => write!(f, "{}", path),
        }
    }
}

// =============================================================================
// OBJECT IDENTITY
// =============================================================================

/// Identity of a managed object: namespace, class and ordered key bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectPath {
    pub namespace: String,
    pub class_name: String,
    pub keys: Vec<(String, Value)>,
}

impl ObjectPath {
    pub fn new(namespace: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            class_name: class_name.into(),
            keys: Vec::new(),
        }
    }

    /// Add a key binding, replacing an existing binding of the same name.
    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.keys.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.keys.push((name, value)),
        }
        self
    }

    pub fn key(&self, name: &str) -> Option<&Value> {
        self.keys
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// String value of a key binding, if present and non-empty.
    pub fn key_str(&self, name: &str) -> Option<&str> {
        self.key(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Convert the path into a partial instance carrying only its keys.
    pub fn to_instance(&self) -> Instance {
        let mut instance = Instance::new(self.namespace.clone(), self.class_name.clone());
        for (name, value) in &self.keys {
            instance.properties.insert(name.clone(), value.clone());
        }
        instance.key_names = self.keys.iter().map(|(k, _)| k.clone()).collect();
        instance
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.class_name)?;
        for (i, (name, value)) in self.keys.iter().enumerate() {
            let sep = if i == 0 { '.' } else { ',' };
            write!(f, "{}{}=\"{}\"", sep, name, value)?;
        }
        Ok(())
    }
}

// =============================================================================
// INSTANCES
// =============================================================================

/// Restricts which properties a caller wants returned.
///
/// Key properties are always admitted so the returned object stays addressable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyFilter {
    properties: Option<HashSet<String>>,
}

impl PropertyFilter {
    /// Admit every property.
    pub fn all() -> Self {
        Self { properties: None }
    }

    /// Admit only the named properties (plus keys).
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            properties: Some(
                names
                    .into_iter()
                    .map(|n| n.as_ref().to_ascii_lowercase())
                    .collect(),
            ),
        }
    }

    /// Admit key properties only.
    pub fn keys_only() -> Self {
        Self {
            properties: Some(HashSet::new()),
        }
    }

    pub fn admits(&self, name: &str) -> bool {
        match &self.properties {
            None => true,
            Some(set) => set.contains(&name.to_ascii_lowercase()),
        }
    }

    pub fn is_all(&self) -> bool {
        self.properties.is_none()
    }
}

/// Output sink that handlers write managed-object properties into.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub namespace: String,
    pub class_name: String,
    properties: BTreeMap<String, Value>,
    key_names: Vec<String>,
    filter: PropertyFilter,
}

impl Instance {
    pub fn new(namespace: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            class_name: class_name.into(),
            properties: BTreeMap::new(),
            key_names: Vec::new(),
            filter: PropertyFilter::all(),
        }
    }

    /// Set the property filter and the key properties that bypass it.
    pub fn with_filter(mut self, filter: PropertyFilter, keys: &[&str]) -> Self {
        self.filter = filter;
        self.key_names = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    fn is_key(&self, name: &str) -> bool {
        self.key_names.iter().any(|k| k.eq_ignore_ascii_case(name))
    }

    /// Set a property. Silently dropped if the filter excludes it.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        if self.is_key(name) || self.filter.admits(name) {
            self.properties.insert(name.to_string(), value.into());
        }
    }

    /// Set a property regardless of the filter.
    pub fn insert(&mut self, name: &str, value: impl Into<Value>) {
        self.properties.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    /// Keep only properties the filter admits (keys always survive).
    pub fn retain(&mut self, filter: &PropertyFilter) {
        let keys = self.key_names.clone();
        self.properties.retain(|name, _| {
            keys.iter().any(|k| k.eq_ignore_ascii_case(name)) || filter.admits(name)
        });
    }

    /// Object path built from the instance's key properties.
    pub fn path(&self) -> ObjectPath {
        let mut path = ObjectPath::new(self.namespace.clone(), self.class_name.clone());
        for key in &self.key_names {
            if let Some(value) = self.get(key) {
                path = path.with_key(key.clone(), value.clone());
            }
        }
        path
    }
}

// =============================================================================
// METHOD CALLS
// =============================================================================

/// Named input arguments to an extrinsic method.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodArgs {
    args: BTreeMap<String, Value>,
}

impl MethodArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.args
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(Value::as_u64)
    }

    pub fn get_reference(&self, name: &str) -> Option<&ObjectPath> {
        self.get(name).and_then(Value::as_reference)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Result of an extrinsic method: numeric return value plus out-arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodOutput {
    pub return_value: u32,
    pub out_args: BTreeMap<String, Value>,
}

impl MethodOutput {
    pub fn new(return_value: u32) -> Self {
        Self {
            return_value,
            out_args: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.out_args.insert(name.into(), value.into());
        self
    }

    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.out_args.get(name)
    }
}

/// DMTF return codes shared by state-change and service methods.
pub mod return_code {
    pub const COMPLETED: u32 = 0;
    pub const NOT_SUPPORTED: u32 = 1;
    pub const FAILED: u32 = 4;
    pub const INVALID_PARAMETER: u32 = 5;
    pub const JOB_STARTED: u32 = 4096;
    pub const INVALID_STATE_TRANSITION: u32 = 4097;
}

// =============================================================================
// POOL RECORDS
// =============================================================================

/// VM power state as reported by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmPowerState {
    Halted,
    Running,
    Paused,
    Suspended,
}

impl VmPowerState {
    /// DMTF `EnabledState` value for this power state.
    pub fn enabled_state(&self) -> u16 {
        match self {
            VmPowerState::Running => 2,
            VmPowerState::Halted => 3,
            VmPowerState::Suspended => 6,
            VmPowerState::Paused => 9,
        }
    }
}

/// Power operations that can be requested on a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmPowerOp {
    Start,
    CleanShutdown,
    HardShutdown,
    CleanReboot,
    HardReboot,
    Pause,
    Unpause,
    Suspend,
    Resume,
}

impl VmPowerOp {
    /// Map a DMTF `RequestedState` onto a power operation, given the current state.
    ///
    /// Returns `None` for values that have no power-operation equivalent.
    pub fn from_requested_state(requested: u16, current: VmPowerState) -> Option<Self> {
        match requested {
            2 => Some(match current {
                VmPowerState::Paused => VmPowerOp::Unpause,
                VmPowerState::Suspended => VmPowerOp::Resume,
                _ => VmPowerOp::Start,
            }),
            3 => Some(VmPowerOp::HardShutdown),
            4 => Some(VmPowerOp::CleanShutdown),
            6 => Some(VmPowerOp::Suspend),
            9 => Some(VmPowerOp::Pause),
            10 => Some(VmPowerOp::CleanReboot),
            11 => Some(VmPowerOp::HardReboot),
            _ => None,
        }
    }
}

/// A VM record fetched from the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub power_state: VmPowerState,
    /// UUID of the host the VM is resident on, if running.
    pub resident_on: Option<String>,
    pub vcpus: u32,
    pub memory_bytes: u64,
}

/// A host record fetched from the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub hostname: String,
    pub address: String,
    pub enabled: bool,
}

/// A backend task record, the persistence for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub created: DateTime<Utc>,
    pub other_config: HashMap<String, String>,
}

// =============================================================================
// JOB STATE
// =============================================================================

/// Job state machine: `New -> Running -> {Completed | Exception}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    New,
    Running,
    Completed,
    Exception,
}

impl JobState {
    /// DMTF `JobState` number.
    pub fn as_u16(&self) -> u16 {
        match self {
            JobState::New => 2,
            JobState::Running => 4,
            JobState::Completed => 7,
            JobState::Exception => 10,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            2 => Some(JobState::New),
            4 => Some(JobState::Running),
            7 => Some(JobState::Completed),
            10 => Some(JobState::Exception),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Exception)
    }

    /// Whether a job in this state may move to `next`. Jobs never move backwards.
    pub fn can_advance_to(&self, next: JobState) -> bool {
        !self.is_terminal() && next.stage() >= self.stage()
    }

    fn stage(&self) -> u8 {
        match self {
            JobState::New => 0,
            JobState::Running => 1,
            JobState::Completed | JobState::Exception => 2,
        }
    }
}

impl Default for JobState {
    fn default() -> Self {
        JobState::New
    }
}
