use std::collections::HashMap;

use tracing::debug;

use crate::binary::{BinaryReader, BinaryWriter};
use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, Result};
use crate::generic::GenericCodec;
use crate::typed::{ProtocolEntry, TypedCodec};
use crate::value::Value;

/// Codec selected for one method name.
#[derive(Debug, Clone, Copy)]
pub enum MethodCodec<'a> {
    Typed(&'a TypedCodec),
    Generic(&'a GenericCodec),
}

impl MethodCodec<'_> {
    pub fn is_typed(&self) -> bool {
        matches!(self, MethodCodec::Typed(_))
    }

    pub fn write_args(&self, args: &[Value], writer: &mut BinaryWriter) -> Result<()> {
        match self {
            MethodCodec::Typed(codec) => codec.write_args(args, writer),
            MethodCodec::Generic(codec) => codec.write_args(args, writer),
        }
    }

    pub fn read_args(&self, reader: &mut BinaryReader) -> Result<Vec<Value>> {
        match self {
            MethodCodec::Typed(codec) => codec.read_args(reader),
            MethodCodec::Generic(codec) => codec.read_args(reader),
        }
    }

    pub fn write_result(&self, result: &Value, writer: &mut BinaryWriter) -> Result<()> {
        match self {
            MethodCodec::Typed(codec) => codec.write_result(result, writer),
            MethodCodec::Generic(codec) => codec.write_value(result, writer),
        }
    }

    pub fn read_result(&self, reader: &mut BinaryReader) -> Result<Value> {
        match self {
            MethodCodec::Typed(codec) => codec.read_result(reader),
            MethodCodec::Generic(codec) => codec.read_value(reader),
        }
    }
}

/// Per-method codec table.
///
/// Methods with a registered [`ProtocolEntry`] use a [`TypedCodec`]; every
/// other method shares one [`GenericCodec`]. Both peers must register the
/// same entries for a method or neither may.
///
/// Registering while traffic flows is allowed, but the repository is not
/// internally synchronized: callers that share it must serialize
/// registration against lookups themselves.
#[derive(Debug, Clone)]
pub struct ProtocolRepository {
    typed: HashMap<String, TypedCodec>,
    generic: GenericCodec,
    config: ProtocolConfig,
}

impl ProtocolRepository {
    /// Create an empty repository with default config.
    pub fn new() -> Self {
        Self::with_config(ProtocolConfig::default())
    }

    /// Create an empty repository with explicit config.
    pub fn with_config(config: ProtocolConfig) -> Self {
        Self {
            typed: HashMap::new(),
            generic: GenericCodec::new(&config),
            config,
        }
    }

    /// Register (or replace) the shape of one method.
    pub fn register(&mut self, entry: ProtocolEntry) -> Result<()> {
        if entry.method.is_empty() {
            return Err(ProtocolError::InvalidEntry("empty method name".to_string()));
        }
        debug!(method = %entry.method, args = entry.args.len(), "registered protocol entry");
        let method = entry.method.clone();
        self.typed
            .insert(method, TypedCodec::new(entry, self.generic));
        Ok(())
    }

    /// Register every entry from an iterator.
    pub fn load_entries<I>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = ProtocolEntry>,
    {
        for entry in entries {
            self.register(entry)?;
        }
        Ok(())
    }

    /// Register entries from a JSON array (or a single JSON object).
    pub fn load_json(&mut self, json: &str) -> Result<()> {
        let parsed: serde_json::Value = serde_json::from_str(json)?;
        let entries: Vec<ProtocolEntry> = match parsed {
            serde_json::Value::Array(_) => serde_json::from_value(parsed)?,
            other => vec![serde_json::from_value(other)?],
        };
        self.load_entries(entries)
    }

    /// Check if a method has a registered entry.
    pub fn has_entry(&self, method: &str) -> bool {
        self.typed.contains_key(method)
    }

    /// Methods with registered entries, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.typed.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    /// Codec for `method`: its typed codec if registered, else the shared
    /// generic codec.
    pub fn codec_for(&self, method: &str) -> MethodCodec<'_> {
        match self.typed.get(method) {
            Some(codec) => MethodCodec::Typed(codec),
            None => MethodCodec::Generic(&self.generic),
        }
    }

    /// The shared generic codec.
    pub fn generic(&self) -> &GenericCodec {
        &self.generic
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }
}

impl Default for ProtocolRepository {
    fn default() -> Self {
        Self::new()
    }
}
