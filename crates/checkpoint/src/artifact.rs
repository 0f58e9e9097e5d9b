//! Checkpoint artifact encoding
//!
//! One artifact per published step. The header carries everything needed
//! to judge structural completeness and to re-shard on resume without
//! decoding the payload: magic, format version, step, and a JSON
//! manifest recording the mesh topology, rule table, and parameter
//! shapes in effect at write time.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use mesh::{MeshAxis, MeshSpec, RuleTable};
use runtime_core::{Error, Result, Step};
use serde::{Deserialize, Serialize};

/// Magic bytes opening every checkpoint artifact
pub const ARTIFACT_MAGIC: [u8; 4] = *b"MTCK";

/// Artifact format version
pub const ARTIFACT_VERSION: u32 = 1;

/// Fixed-size header prefix: magic + version + step + manifest length
const HEADER_PREFIX_LEN: usize = 4 + 4 + 8 + 4;

/// Shape entry for one parameter in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterShape {
    pub name: String,
    pub global_shape: Vec<usize>,
}

/// Manifest describing the run context an artifact was written under
///
/// The mesh and rule table are the ones in effect at save time. A
/// resuming process with a different topology ignores them for layout
/// (the payload stores global arrays) but can report the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub run_name: String,
    pub created_at: DateTime<Utc>,
    pub mesh_axes: Vec<MeshAxis>,
    pub rules: RuleTable,
    pub parameters: Vec<ParameterShape>,
}

impl ArtifactManifest {
    pub fn new(
        run_name: impl Into<String>,
        mesh: &MeshSpec,
        rules: &RuleTable,
        parameters: Vec<ParameterShape>,
    ) -> Self {
        Self {
            run_name: run_name.into(),
            created_at: Utc::now(),
            mesh_axes: mesh.axes().to_vec(),
            rules: rules.clone(),
            parameters,
        }
    }

    /// Mesh axes as a compact `name=size` list for log lines
    pub fn mesh_summary(&self) -> String {
        self.mesh_axes
            .iter()
            .map(|axis| format!("{}={}", axis.name(), axis.size()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A fully decoded artifact
#[derive(Debug, Clone)]
pub struct Artifact {
    pub step: Step,
    pub manifest: ArtifactManifest,
    pub payload: Bytes,
}

/// Deterministic artifact file name for a step
pub fn file_name(step: Step) -> String {
    format!("step-{step:08}.ckpt")
}

/// Parse a step number back out of an artifact file name
///
/// Returns `None` for anything that is not exactly a published artifact
/// name, so temp files and markers never look like checkpoints.
pub fn parse_file_name(name: &str) -> Option<Step> {
    let digits = name.strip_prefix("step-")?.strip_suffix(".ckpt")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Encode a manifest and payload into artifact bytes
pub fn encode(step: Step, manifest: &ArtifactManifest, payload: &[u8]) -> Result<Bytes> {
    let manifest_json = serde_json::to_vec(manifest)?;

    let mut buf =
        Vec::with_capacity(HEADER_PREFIX_LEN + manifest_json.len() + 8 + payload.len());
    buf.extend_from_slice(&ARTIFACT_MAGIC);
    buf.extend_from_slice(&ARTIFACT_VERSION.to_le_bytes());
    buf.extend_from_slice(&step.to_le_bytes());
    buf.extend_from_slice(&(manifest_json.len() as u32).to_le_bytes());
    buf.extend_from_slice(&manifest_json);
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(payload);

    Ok(Bytes::from(buf))
}

/// Structural completeness check
///
/// Verifies magic, version, and that the declared manifest and payload
/// lengths exactly account for the data. Returns the header step. Does
/// not parse the manifest or payload, so it stays cheap during scans.
pub fn verify(path: &str, data: &[u8]) -> Result<Step> {
    let reader = ArtifactReader::open(path, data)?;
    Ok(reader.step)
}

/// Decode the header and manifest without touching the payload
pub fn decode_manifest(path: &str, data: &[u8]) -> Result<(Step, ArtifactManifest)> {
    let reader = ArtifactReader::open(path, data)?;
    let manifest = reader.parse_manifest()?;
    Ok((reader.step, manifest))
}

/// Decode a complete artifact
pub fn decode(path: &str, data: &[u8]) -> Result<Artifact> {
    let reader = ArtifactReader::open(path, data)?;
    let manifest = reader.parse_manifest()?;
    Ok(Artifact {
        step: reader.step,
        manifest,
        payload: Bytes::copy_from_slice(reader.payload),
    })
}

/// Borrowed view over validated artifact bytes
struct ArtifactReader<'a> {
    path: &'a str,
    step: Step,
    manifest_json: &'a [u8],
    payload: &'a [u8],
}

impl<'a> ArtifactReader<'a> {
    fn open(path: &'a str, data: &'a [u8]) -> Result<Self> {
        let corrupt = |reason: &str| Error::CheckpointCorrupted {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        if data.len() < HEADER_PREFIX_LEN {
            return Err(corrupt("shorter than the fixed header"));
        }
        if data[0..4] != ARTIFACT_MAGIC {
            return Err(corrupt("bad magic bytes"));
        }

        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != ARTIFACT_VERSION {
            return Err(Error::CheckpointCorrupted {
                path: path.to_string(),
                reason: format!("unsupported format version {version}"),
            });
        }

        let step = u64::from_le_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        let manifest_len = u32::from_le_bytes([data[16], data[17], data[18], data[19]]) as usize;

        let manifest_end = HEADER_PREFIX_LEN
            .checked_add(manifest_len)
            .ok_or_else(|| corrupt("manifest length overflows"))?;
        if data.len() < manifest_end + 8 {
            return Err(corrupt("truncated before the payload length"));
        }
        let manifest_json = &data[HEADER_PREFIX_LEN..manifest_end];

        let payload_len = u64::from_le_bytes(
            data[manifest_end..manifest_end + 8]
                .try_into()
                .map_err(|_| corrupt("truncated payload length"))?,
        ) as usize;
        let payload_start = manifest_end + 8;
        let payload_end = payload_start
            .checked_add(payload_len)
            .ok_or_else(|| corrupt("payload length overflows"))?;
        if data.len() != payload_end {
            return Err(Error::CheckpointCorrupted {
                path: path.to_string(),
                reason: format!(
                    "declared {payload_len} payload bytes but file holds {}",
                    data.len() - payload_start
                ),
            });
        }

        Ok(Self {
            path,
            step,
            manifest_json,
            payload: &data[payload_start..payload_end],
        })
    }

    fn parse_manifest(&self) -> Result<ArtifactManifest> {
        serde_json::from_slice(self.manifest_json).map_err(|e| Error::CheckpointCorrupted {
            path: self.path.to_string(),
            reason: format!("manifest is not valid JSON: {e}"),
        })
    }
}
