//! Session-metadata (mdoc) parsing and the metadata probe.
//!
//! Mdoc files are text: `key = value` lines in a global header, followed by
//! one `[ZValue = N]` section per tilt record. The probe derives initial
//! microscope/acquisition parameters from the first parseable file matching
//! a glob; data import re-writes per-section `SubFramePath` entries and
//! round-trips the rest untouched.

use std::path::{Path, PathBuf};

use tracing::warn;

/// Detector geometry of a Gatan K3, in either orientation. Matching
/// dimensions are the camera signature that triggers the EER hint.
const K3_DIMENSIONS: [(u32, u32); 2] = [(5760, 4092), (4092, 5760)];

/// EER fraction grouping suggested when a K3/EER acquisition is detected.
const EER_FRACTIONS_HINT: u32 = 32;

/// One `[ZValue = N]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdocSection {
    pub z_value: String,
    pub entries: Vec<(String, String)>,
}

impl MdocSection {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set or append an entry, preserving position for existing keys.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }
}

/// A parsed mdoc file: raw header lines plus tilt sections.
///
/// Header lines are kept verbatim so a rewrite only touches what import
/// actually changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdocFile {
    pub header_lines: Vec<String>,
    pub sections: Vec<MdocSection>,
}

impl MdocFile {
    /// Parse mdoc text. Never fails: unrecognized lines land in the header.
    pub fn parse(text: &str) -> MdocFile {
        let mut file = MdocFile::default();
        let mut current: Option<MdocSection> = None;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("[ZValue") {
                if let Some(section) = current.take() {
                    file.sections.push(section);
                }
                let z = rest
                    .split('=')
                    .nth(1)
                    .map(|v| v.trim().trim_end_matches(']').trim().to_string())
                    .unwrap_or_default();
                current = Some(MdocSection {
                    z_value: z,
                    entries: Vec::new(),
                });
            } else if let Some(section) = current.as_mut() {
                if let Some((key, value)) = line.split_once('=') {
                    section
                        .entries
                        .push((key.trim().to_string(), value.trim().to_string()));
                }
            } else {
                file.header_lines.push(line.to_string());
            }
        }
        if let Some(section) = current {
            file.sections.push(section);
        }
        file
    }

    /// Look up a `key = value` pair in the header.
    pub fn header_value(&self, key: &str) -> Option<String> {
        for line in &self.header_lines {
            if let Some((k, v)) = line.split_once('=') {
                if k.trim() == key {
                    return Some(v.trim().to_string());
                }
            }
        }
        None
    }

    /// Append a header line (used to record the import provenance).
    pub fn append_header(&mut self, key: &str, value: &str) {
        self.header_lines.push(format!("{key} = {value}"));
    }

    /// Serialize back to mdoc text.
    pub fn to_mdoc_string(&self) -> String {
        let mut out = String::new();
        for line in &self.header_lines {
            out.push_str(line);
            out.push('\n');
        }
        for section in &self.sections {
            out.push('\n');
            out.push_str(&format!("[ZValue = {}]\n", section.z_value));
            for (key, value) in &section.entries {
                out.push_str(&format!("{key} = {value}\n"));
            }
        }
        out
    }
}

/// Parameters the probe could derive from acquisition metadata.
///
/// Absent fields simply stay `None`; the probe never fails on partial
/// files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectedParams {
    pub pixel_spacing: Option<f64>,
    pub voltage: Option<f64>,
    pub dose_per_tilt: Option<f64>,
    pub frame_dose: Option<f64>,
    pub tilt_axis_angle: Option<f64>,
    pub detector_dimensions: Option<(u32, u32)>,
    pub eer_fractions_per_frame: Option<u32>,
    pub acquisition_software: Option<String>,
    pub invert_tilt_angles: Option<bool>,
    pub nominal_magnification: Option<i64>,
    pub spot_size: Option<i64>,
    pub binning: Option<i64>,
}

/// Derive initial parameters from the first parseable file matching the
/// glob.
///
/// `dose_factor` is the configured multiplier from per-frame exposure dose
/// to dose-per-tilt; the raw value is reported as `frame_dose` alongside.
pub fn probe(mdocs_glob: &str, dose_factor: f64) -> DetectedParams {
    let paths = match glob::glob(mdocs_glob) {
        Ok(paths) => paths,
        Err(e) => {
            warn!("metadata probe: bad glob '{}': {}", mdocs_glob, e);
            return DetectedParams::default();
        }
    };

    for entry in paths.flatten() {
        if !entry.is_file() || entry.extension().and_then(|e| e.to_str()) != Some("mdoc") {
            continue;
        }
        match std::fs::read_to_string(&entry) {
            Ok(text) => return probe_text(&text, dose_factor),
            Err(e) => {
                warn!("metadata probe: cannot read {}: {}", entry.display(), e);
                continue;
            }
        }
    }
    DetectedParams::default()
}

/// Probe already-loaded mdoc text.
pub fn probe_text(text: &str, dose_factor: f64) -> DetectedParams {
    let file = MdocFile::parse(text);
    let first = file.sections.first();
    let mut out = DetectedParams::default();

    let lookup = |key: &str| -> Option<String> {
        file.header_value(key)
            .or_else(|| first.and_then(|s| s.get(key).map(str::to_string)))
    };

    let is_serialem = file.header_lines.iter().any(|l| l.contains("SerialEM"));
    if is_serialem {
        out.acquisition_software = Some("SerialEM".to_string());
        // SerialEM writes the axis into a title line; the value may carry a
        // trailing ", binning = ..." clause.
        if let Some(raw) = lookup("Tilt axis angle") {
            let head = raw.split(',').next().unwrap_or("").trim();
            out.tilt_axis_angle = head.parse().ok();
        }
        out.invert_tilt_angles = Some(false);
    } else {
        out.acquisition_software = Some("Tomo5".to_string());
        if let Some(raw) = first.and_then(|s| s.get("RotationAngle")) {
            out.tilt_axis_angle = raw.parse::<f64>().ok().map(f64::abs);
        }
        out.invert_tilt_angles = Some(true);
    }

    out.pixel_spacing = lookup("PixelSpacing").and_then(|v| v.parse().ok());
    out.voltage = lookup("Voltage").and_then(|v| v.parse().ok());

    if let Some(raw) = lookup("ImageSize") {
        let dims: Vec<u32> = raw
            .split_whitespace()
            .filter_map(|t| t.parse().ok())
            .collect();
        if dims.len() >= 2 {
            out.detector_dimensions = Some((dims[0], dims[1]));
        }
    }

    if let Some(raw) = lookup("ExposureDose") {
        if let Ok(dose) = raw.parse::<f64>() {
            out.frame_dose = Some(dose);
            out.dose_per_tilt = Some((dose * dose_factor * 100.0).round() / 100.0);
        }
    }

    out.nominal_magnification = lookup("Magnification").and_then(|v| v.parse().ok());
    out.spot_size = lookup("SpotSize").and_then(|v| v.parse().ok());
    out.binning = lookup("Binning").and_then(|v| v.parse().ok());

    let subframe = first.and_then(|s| s.get("SubFramePath")).unwrap_or("");
    let is_eer = subframe.to_ascii_lowercase().ends_with(".eer");
    let is_k3 = out
        .detector_dimensions
        .map(|dims| K3_DIMENSIONS.contains(&dims))
        .unwrap_or(false);
    if is_eer || is_k3 {
        out.eer_fractions_per_frame = Some(EER_FRACTIONS_HINT);
    }

    out
}

/// Expand a glob into existing file paths, sorted for determinism.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>, String> {
    let paths = glob::glob(pattern).map_err(|e| e.to_string())?;
    let mut files: Vec<PathBuf> = paths.flatten().filter(|p| p.is_file()).collect();
    files.sort();
    Ok(files)
}

/// Parent directory of a glob pattern (the fixed prefix before any
/// wildcard), used to resolve raw movie locations and bind mounts.
pub fn glob_parent(pattern: &str) -> PathBuf {
    let path = Path::new(pattern);
    match path.parent() {
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    }
}
