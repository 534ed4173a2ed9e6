// Ledger record types
use crate::error::{CoreError, CoreResult};
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One physical object, keyed by fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub fingerprint: Fingerprint,
    /// First uploader's declaration, kept for every duplicate.
    pub content_type: String,
    pub byte_size: u64,
    pub physical_location: String,
    pub ref_count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(CoreError::InvalidArgument(format!(
                "unknown visibility: {}",
                other
            ))),
        }
    }
}

/// One logical, owner-visible file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipEntry {
    pub id: String,
    pub fingerprint: Fingerprint,
    pub owner_id: String,
    /// Owner name as it was at upload time.
    pub uploader_name: String,
    pub display_name: String,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    pub is_duplicate: bool,
    pub download_count: u64,
    pub created_at: DateTime<Utc>,
}

impl OwnershipEntry {
    pub fn is_readable_by(&self, caller: &str) -> bool {
        self.owner_id == caller || self.visibility == Visibility::Public
    }
}

/// Per-owner byte accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub bytes_charged: u64,
    pub byte_limit: u64,
}

impl QuotaRecord {
    pub fn remaining(&self) -> u64 {
        self.byte_limit.saturating_sub(self.bytes_charged)
    }
}

/// Owner-controlled metadata supplied with an upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub display_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub visibility: Visibility,
    /// Defaults to the owner id when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader_name: Option<String>,
}

impl EntryMetadata {
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Default::default()
        }
    }
}

/// One file of an upload batch.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub metadata: EntryMetadata,
}

impl UploadFile {
    pub fn new(
        bytes: impl Into<Vec<u8>>,
        content_type: impl Into<String>,
        metadata: EntryMetadata,
    ) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
            metadata,
        }
    }
}
