//! Per-trace runtime state: output path derivation, directory
//! creation, and metadata emission when the trace is finalized.

use crate::{
    config::SinkConfig,
    error::Error,
    ir,
    meta::TraceClass,
    sink::stream::Stream,
    translate, tsdl,
};
use fxhash::FxHashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Map key for live streams: the source stream's identity.
pub(crate) type StreamKey = usize;

pub(crate) fn stream_key(ir_stream: &Arc<ir::Stream>) -> StreamKey {
    Arc::as_ptr(ir_stream) as StreamKey
}

pub(crate) struct Trace {
    pub tc: TraceClass,
    pub path: PathBuf,
    pub metadata_path: PathBuf,
    pub streams: FxHashMap<StreamKey, Stream>,
}

/// Sanitizes a relative trace path: `.` path segments become `_`,
/// `..` segments become `__`, trailing slashes are removed, and an
/// empty result falls back to `trace`.
fn sanitize_trace_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    let sanitized = trimmed
        .split('/')
        .map(|segment| match segment {
            "." => "_",
            ".." => "__",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("/");

    if sanitized.is_empty() {
        "trace".to_owned()
    } else {
        sanitized
    }
}

/// Finds a path based on `path` that does not exist yet: `path`
/// itself, then `path-0`, `path-1`, ...
fn make_unique_trace_path(path: &Path) -> PathBuf {
    let mut unique = path.to_path_buf();
    let mut suffix = 0_u32;

    while unique.exists() {
        let mut name = path.as_os_str().to_owned();
        name.push(format!("-{suffix}"));
        unique = PathBuf::from(name);
        suffix += 1;
    }

    unique
}

/// Validates the ISO 8601 datetime strings LTTng puts in the trace
/// environment.
fn is_valid_iso8601(datetime: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(datetime).is_ok()
        || chrono::DateTime::parse_from_str(datetime, "%Y%m%dT%H%M%S%z").is_ok()
        || chrono::NaiveDateTime::parse_from_str(datetime, "%Y%m%dT%H%M%S").is_ok()
}

fn env_str<'a>(ir_trace: &'a ir::Trace, name: &str) -> Option<&'a str> {
    match ir_trace.environment_entry(name) {
        Some(ir::EnvironmentValue::String(s)) => Some(s),
        _ => {
            info!(name, "Couldn't get string environment value");
            None
        }
    }
}

fn env_int(ir_trace: &ir::Trace, name: &str) -> Option<i64> {
    match ir_trace.environment_entry(name) {
        Some(ir::EnvironmentValue::Integer(v)) => Some(*v),
        _ => {
            info!(name, "Couldn't get integer environment value");
            None
        }
    }
}

fn lttng_trace_path_ust_uid(ir_trace: &ir::Trace, path: &mut String) -> Option<()> {
    let buffering_id = env_int(ir_trace, "tracer_buffering_id")?;
    path.push_str(&format!("/{buffering_id}"));

    let bit_width = env_int(ir_trace, "architecture_bit_width")?;
    path.push_str(&format!("/{bit_width}-bit"));
    Some(())
}

fn lttng_trace_path_ust_pid(ir_trace: &ir::Trace, path: &mut String) -> Option<()> {
    let procname = env_str(ir_trace, "procname")?;
    path.push_str(&format!("/{procname}"));

    let vpid = env_int(ir_trace, "vpid")?;
    path.push_str(&format!("-{vpid}"));

    let datetime = env_str(ir_trace, "vpid_datetime")?;
    if !is_valid_iso8601(datetime) {
        info!(datetime, "Couldn't parse datetime as ISO 8601");
        return None;
    }
    path.push_str(&format!("-{datetime}"));
    Some(())
}

/// Tries to build a trace path from the environment values the LTTng
/// tracer records, starting with version 2.11:
/// `<hostname>/<trace_name>-<datetime>/<domain>[/<scheme>/...]`.
fn make_lttng_trace_path_rel(ir_trace: &ir::Trace) -> Option<String> {
    let tracer_name = env_str(ir_trace, "tracer_name")?;
    if tracer_name != "lttng-ust" && tracer_name != "lttng-modules" {
        info!(tracer_name, "Unrecognized tracer name");
        return None;
    }

    let tracer_major = env_int(ir_trace, "tracer_major")?;
    let tracer_minor = env_int(ir_trace, "tracer_minor")?;
    if !(tracer_major >= 3 || (tracer_major == 2 && tracer_minor >= 11)) {
        info!(
            tracer_major,
            tracer_minor, "Unsupported LTTng version for automatic trace path"
        );
        return None;
    }

    let mut path = env_str(ir_trace, "hostname")?.to_owned();

    let trace_name = env_str(ir_trace, "trace_name")?;
    path.push_str(&format!("/{trace_name}"));

    let datetime = env_str(ir_trace, "trace_creation_datetime")?;
    if !is_valid_iso8601(datetime) {
        info!(datetime, "Couldn't parse datetime as ISO 8601");
        return None;
    }
    path.push_str(&format!("-{datetime}"));

    let domain = env_str(ir_trace, "domain")?;
    path.push_str(&format!("/{domain}"));

    match domain {
        "ust" => {
            let scheme = env_str(ir_trace, "tracer_buffering_scheme")?;
            path.push_str(&format!("/{scheme}"));

            match scheme {
                "uid" => lttng_trace_path_ust_uid(ir_trace, &mut path)?,
                "pid" => lttng_trace_path_ust_pid(ir_trace, &mut path)?,
                _ => {
                    info!(scheme, "Unknown buffering scheme");
                    return None;
                }
            }
        }
        "kernel" => (),
        _ => {
            info!(domain, "Unknown domain");
            return None;
        }
    }

    Some(path)
}

/// Builds the relative output path for a trace in multi-trace mode:
/// the LTTng layout when the environment carries it, the trace name
/// otherwise, the literal `trace` failing both.
fn make_trace_path_rel(ir_trace: &ir::Trace) -> String {
    if let Some(path) = make_lttng_trace_path_rel(ir_trace) {
        return path;
    }

    ir_trace
        .name
        .as_ref()
        .map(|name| name.to_string())
        .unwrap_or_else(|| "trace".to_owned())
}

/// Computes the trace output directory, rooted at the configured
/// output directory.
fn make_trace_path(config: &SinkConfig, ir_trace: &ir::Trace) -> PathBuf {
    if config.assume_single_trace {
        // Use the output directory directly
        config.path.clone()
    } else {
        let rel = sanitize_trace_path(&make_trace_path_rel(ir_trace));
        make_unique_trace_path(&config.path.join(rel))
    }
}

#[cfg(unix)]
fn create_dir_chain(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(path)
}

#[cfg(not(unix))]
fn create_dir_chain(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

impl Trace {
    pub fn create(config: &SinkConfig, ir_trace: &Arc<ir::Trace>) -> Result<Self, Error> {
        let tc = translate::translate_trace(ir_trace)?;
        let path = make_trace_path(config, ir_trace);
        create_dir_chain(&path)?;
        let metadata_path = path.join("metadata");

        Ok(Self {
            tc,
            path,
            metadata_path,
            streams: FxHashMap::default(),
        })
    }

    /// Emits the metadata file and releases the trace.
    ///
    /// There is no caller that could handle a metadata write failure
    /// at this point, and a trace without its metadata file is
    /// unreadable, so that failure terminates the process.
    pub fn finalize(&mut self, config: &SinkConfig) {
        let metadata = tsdl::render_metadata(&self.tc, config.byte_order);

        if let Err(e) = fs::write(&self.metadata_path, metadata.as_bytes()) {
            error!(
                path = %self.metadata_path.display(),
                error = %e,
                "Cannot write metadata file"
            );
            panic!(
                "cannot write metadata file `{}`: {e}",
                self.metadata_path.display()
            );
        }

        if !config.quiet {
            println!("Created CTF trace `{}`.", self.path.display());
        }
    }
}
