//! On-disk formats: engine config files, raw matrix files and the embedded
//! settings encoding used to restore decompositions across sessions.
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::config::IcaConfig;
use crate::error::{IcaError, io_context};
use crate::operation::Decomposition;

/// Training data handed to the engine.
pub const DATA_FILE: &str = "input.floatdata";
/// Engine config file (also the file a saved run is reloaded from).
pub const CONFIG_FILE: &str = "binica.sc";
/// Engine weight matrix output.
pub const WEIGHTS_FILE: &str = "binica.wts";
/// Engine sphering matrix output.
pub const SPHERE_FILE: &str = "binica.sph";
/// Mixing matrix written after a successful run.
pub const MIXING_FILE: &str = "mixing.mat";
/// Unmixing matrix written after a successful run.
pub const UNMIXING_FILE: &str = "unmixing.mat";

const CHANNEL_HINT: &str = "!chans:";

/// Fixed engine parameters written after the per-run entries.
const ENGINE_PARAMETERS: &[(&str, &str)] = &[
    ("sphering", "on"),
    ("bias", "on"),
    ("extended", "1"),
    ("lrate", "1.0e-4"),
    ("blocksize", "0"),
    ("stop", "1.0e-7"),
    ("maxsteps", "512"),
    ("posact", "off"),
    ("annealstep", "0.98"),
    ("annealdeg", "60"),
    ("momentum", "0"),
    ("verbose", "on"),
];

/// Read a square row-major `f32` matrix. A length mismatch is an error.
pub fn read_matrix(path: &Path, dimension: usize) -> Result<DMatrix<f32>, IcaError> {
    let bytes = std::fs::read(path).map_err(io_context("reading matrix file", path))?;
    let expected = dimension * dimension;
    if bytes.len() % 4 != 0 || bytes.len() / 4 != expected {
        return Err(IcaError::MatrixLength {
            path: path.to_path_buf(),
            found: bytes.len() / 4,
            expected,
        });
    }
    Ok(DMatrix::from_row_slice(dimension, dimension, &floats_from_le(&bytes)))
}

/// Write a matrix as row-major little-endian `f32` with no header.
pub fn write_matrix(path: &Path, matrix: &DMatrix<f32>) -> Result<(), IcaError> {
    let file = File::create(path).map_err(io_context("creating matrix file", path))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(&matrix_to_le_bytes(matrix))
        .and_then(|_| writer.flush())
        .map_err(io_context("writing matrix file", path))
}

/// Base64 of the row-major little-endian `f32` bytes.
pub fn encode_matrix(matrix: &DMatrix<f32>) -> String {
    BASE64.encode(matrix_to_le_bytes(matrix))
}

/// Inverse of [`encode_matrix`] for a `dimension` x `dimension` matrix.
pub fn decode_matrix(encoded: &str, dimension: usize) -> Result<DMatrix<f32>, IcaError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| IcaError::Persist(format!("bad matrix encoding: {e}")))?;
    let expected = dimension * dimension;
    if bytes.len() != expected * 4 {
        return Err(IcaError::Persist(format!(
            "encoded matrix holds {} bytes, expected {}",
            bytes.len(),
            expected * 4
        )));
    }
    Ok(DMatrix::from_row_slice(dimension, dimension, &floats_from_le(&bytes)))
}

fn matrix_to_le_bytes(matrix: &DMatrix<f32>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(matrix.len() * 4);
    for row in matrix.row_iter() {
        for value in row.iter() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    bytes
}

pub(crate) fn floats_from_le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Space-separated integer list.
pub fn format_index_list<I>(indices: I) -> String
where
    I: IntoIterator<Item = usize>,
{
    let mut out = String::new();
    for (n, index) in indices.into_iter().enumerate() {
        if n > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{index}");
    }
    out
}

/// Parse a whitespace-separated integer list.
pub fn parse_index_list(text: &str) -> Result<Vec<usize>, String> {
    text.split_whitespace()
        .map(|token| {
            token
                .parse::<usize>()
                .map_err(|_| format!("'{token}' is not a channel index"))
        })
        .collect()
}

/// Contents of an engine config file that this crate cares about.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingConfigFile {
    /// Stream-relative channels used, from the `!chans:` hint line.
    pub enabled_channels: Vec<usize>,
    /// `frames` entry.
    pub frames: usize,
    /// `DataFile` entry.
    pub data_file: String,
    /// `WeightsOutFile` entry.
    pub weights_file: String,
    /// `SphereFile` entry.
    pub sphere_file: String,
}

impl TrainingConfigFile {
    /// Config for a run using the standard file names.
    pub fn new(enabled_channels: Vec<usize>, frames: usize) -> Self {
        Self {
            enabled_channels,
            frames,
            data_file: DATA_FILE.to_string(),
            weights_file: WEIGHTS_FILE.to_string(),
            sphere_file: SPHERE_FILE.to_string(),
        }
    }

    /// Number of channels (`chans` entry).
    pub fn channels(&self) -> usize {
        self.enabled_channels.len()
    }

    /// Render the config text the engine reads from stdin.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{CHANNEL_HINT} {}",
            format_index_list(self.enabled_channels.iter().copied())
        );
        let _ = writeln!(out, "DataFile {}", self.data_file);
        let _ = writeln!(out, "chans {}", self.channels());
        let _ = writeln!(out, "frames {}", self.frames);
        let _ = writeln!(out, "WeightsOutFile {}", self.weights_file);
        let _ = writeln!(out, "SphereFile {}", self.sphere_file);
        for (key, value) in ENGINE_PARAMETERS {
            let _ = writeln!(out, "{key} {value}");
        }
        out
    }

    /// Write the config file.
    pub fn write(&self, path: &Path) -> Result<(), IcaError> {
        std::fs::write(path, self.render()).map_err(io_context("writing ICA config file", path))
    }

    /// Read and parse a config file.
    pub fn read(path: &Path) -> Result<Self, IcaError> {
        let text =
            std::fs::read_to_string(path).map_err(io_context("reading ICA config file", path))?;
        Self::parse(&text).map_err(|reason| IcaError::MalformedConfig {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parse config text. Unknown keys are ignored.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut hint = None;
        let mut chans = None;
        let mut frames = None;
        let mut data_file = None;
        let mut weights_file = None;
        let mut sphere_file = None;

        for line in text.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix(CHANNEL_HINT) {
                hint = Some(parse_index_list(rest)?);
                continue;
            }
            if line.is_empty() || line.starts_with('#') || line.starts_with('%') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default().trim();
            match key {
                "chans" => chans = Some(parse_count(key, value)?),
                "frames" => frames = Some(parse_count(key, value)?),
                "DataFile" => data_file = Some(value.to_string()),
                "WeightsOutFile" => weights_file = Some(value.to_string()),
                "SphereFile" => sphere_file = Some(value.to_string()),
                _ => {}
            }
        }

        let enabled_channels = hint.ok_or("missing '!chans:' hint line")?;
        let chans = chans.ok_or("missing 'chans' entry")?;
        if chans != enabled_channels.len() {
            return Err(format!(
                "'chans {chans}' does not match {} hinted channels",
                enabled_channels.len()
            ));
        }
        let mut sorted = enabled_channels.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != enabled_channels.len() {
            return Err("duplicate channel in '!chans:' hint".to_string());
        }

        Ok(Self {
            enabled_channels,
            frames: frames.unwrap_or(0),
            data_file: data_file.unwrap_or_else(|| DATA_FILE.to_string()),
            weights_file: weights_file.ok_or("missing 'WeightsOutFile' entry")?,
            sphere_file: sphere_file.ok_or("missing 'SphereFile' entry")?,
        })
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize, String> {
    value
        .parse::<usize>()
        .map_err(|_| format!("'{key}' expects an integer, found '{value}'"))
}

/// Decomposition embedded in saved settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedOperation {
    /// Space-separated stream-relative channel indices.
    pub enabled_channels: String,
    /// Space-separated rejected component indices.
    pub rejected_components: String,
    /// Base64 row-major `f32` mixing matrix.
    pub mixing: String,
    /// Base64 row-major `f32` unmixing matrix.
    pub unmixing: String,
}

impl PersistedOperation {
    /// Encode a trained decomposition.
    pub fn encode(op: &Decomposition) -> Self {
        Self {
            enabled_channels: format_index_list(op.enabled_channels().iter().copied()),
            rejected_components: format_index_list(op.rejected_components().iter().copied()),
            mixing: encode_matrix(op.mixing()),
            unmixing: encode_matrix(op.unmixing()),
        }
    }

    /// Decode into matrices, enabled channels and the stored rejected set.
    ///
    /// The rejected set is returned as `None` when it does not fit the decoded
    /// dimension so the caller can fall back to its default.
    pub fn decode(
        &self,
    ) -> Result<(DMatrix<f32>, DMatrix<f32>, Vec<usize>, Option<BTreeSet<usize>>), IcaError> {
        let enabled = parse_index_list(&self.enabled_channels).map_err(IcaError::Persist)?;
        let dimension = enabled.len();
        let mixing = decode_matrix(&self.mixing, dimension)?;
        let unmixing = decode_matrix(&self.unmixing, dimension)?;
        let rejected = parse_index_list(&self.rejected_components)
            .ok()
            .map(|list| list.into_iter().collect::<BTreeSet<_>>())
            .filter(|set| set.len() <= dimension && set.iter().all(|&c| c < dimension));
        Ok((mixing, unmixing, enabled, rejected))
    }
}

/// Saved state of one stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedStream {
    /// Stream identifier.
    pub stream_id: u32,
    /// Display name at save time.
    pub stream_name: String,
    /// Run directory the decomposition came from, if any.
    pub decomposition_dir: Option<PathBuf>,
    /// Embedded decomposition, absent for no-op streams.
    pub operation: Option<PersistedOperation>,
}

/// Everything needed to restore a processor across sessions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSettings {
    /// Processor configuration.
    pub config: IcaConfig,
    /// Stream selected in the interactive view.
    pub current_stream: Option<u32>,
    /// Per-stream state.
    pub streams: Vec<PersistedStream>,
}
