//! Cache entries and their wire format
//!
//! The wire format is a small protobuf message so that entries published by
//! one build-tool version stay readable by peers on another. Digest fields
//! carry the [`crate::digest`] codec encoding.

use prost::Message;
use serde::{Deserialize, Serialize};

use crate::digest::{self, FileDigest};
use crate::error::{CacheError, Result};

/// Wire format version written by this crate
pub const WIRE_FORMAT_VERSION: u32 = 1;

/// An output file produced by an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Path relative to the execution root
    pub path: String,
    /// Digest of the file content
    pub digest: FileDigest,
}

/// Record of an action key plus the digest of its outputs at the last
/// successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    action_key: String,
    digest: FileDigest,
    discovers_inputs: bool,
    #[serde(default)]
    outputs: Vec<OutputFile>,
}

impl CacheEntry {
    pub fn new(action_key: impl Into<String>, digest: FileDigest) -> Self {
        Self {
            action_key: action_key.into(),
            digest,
            discovers_inputs: false,
            outputs: Vec::new(),
        }
    }

    /// Mark the action as one whose full input set is only known after
    /// execution
    pub fn discovering_inputs(mut self, discovers_inputs: bool) -> Self {
        self.discovers_inputs = discovers_inputs;
        self
    }

    /// Replace the recorded digest
    pub fn with_digest(mut self, digest: FileDigest) -> Self {
        self.digest = digest;
        self
    }

    /// Record a freshly produced output file
    ///
    /// Entries with outputs are published to the remote tier on `put`.
    pub fn with_output(mut self, path: impl Into<String>, digest: FileDigest) -> Self {
        self.outputs.push(OutputFile {
            path: path.into(),
            digest,
        });
        self
    }

    pub fn action_key(&self) -> &str {
        &self.action_key
    }

    pub fn digest(&self) -> &FileDigest {
        &self.digest
    }

    pub fn discovers_inputs(&self) -> bool {
        self.discovers_inputs
    }

    pub fn outputs(&self) -> &[OutputFile] {
        &self.outputs
    }

    /// Encode this entry as a wire message
    pub fn to_wire(&self) -> Vec<u8> {
        let message = EntryMessage {
            action_key: self.action_key.clone(),
            digest: digest::encode(&self.digest),
            discovers_inputs: self.discovers_inputs,
            outputs: self
                .outputs
                .iter()
                .map(|o| OutputMessage {
                    path: o.path.clone(),
                    digest: digest::encode(&o.digest),
                })
                .collect(),
            format_version: WIRE_FORMAT_VERSION,
        };
        message.encode_to_vec()
    }

    /// Decode a wire message
    ///
    /// Any malformed input, including an unknown format version, is reported
    /// as [`CacheError::CorruptEntry`].
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let message = EntryMessage::decode(bytes)
            .map_err(|e| CacheError::CorruptEntry(format!("undecodable entry: {}", e)))?;

        match message.format_version {
            0 => {
                return Err(CacheError::CorruptEntry(
                    "entry has no format version".to_string(),
                ))
            }
            v if v > WIRE_FORMAT_VERSION => {
                return Err(CacheError::CorruptEntry(format!(
                    "entry format version {} is newer than supported version {}",
                    v, WIRE_FORMAT_VERSION
                )))
            }
            _ => {}
        }

        let outputs = message
            .outputs
            .into_iter()
            .map(|o| {
                Ok(OutputFile {
                    digest: digest::decode(&o.digest)?,
                    path: o.path,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            action_key: message.action_key,
            digest: digest::decode(&message.digest)?,
            discovers_inputs: message.discovers_inputs,
            outputs,
        })
    }
}

#[derive(Clone, PartialEq, Message)]
struct EntryMessage {
    #[prost(string, tag = "1")]
    action_key: String,
    #[prost(bytes = "vec", tag = "2")]
    digest: Vec<u8>,
    #[prost(bool, tag = "3")]
    discovers_inputs: bool,
    #[prost(message, repeated, tag = "4")]
    outputs: Vec<OutputMessage>,
    #[prost(uint32, tag = "15")]
    format_version: u32,
}

#[derive(Clone, PartialEq, Message)]
struct OutputMessage {
    #[prost(string, tag = "1")]
    path: String,
    #[prost(bytes = "vec", tag = "2")]
    digest: Vec<u8>,
}
