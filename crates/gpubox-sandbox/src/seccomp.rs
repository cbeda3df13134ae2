use std::path::{Path, PathBuf};

use seccompiler::{BpfProgram, TargetArch};
use serde_json::Value;

use crate::{PolicyKind, SandboxError, SandboxPolicy};

const RECORD_SIZE: usize = 8;
const MAX_RECORDS: usize = 4096;

/// The filter used when a policy document defines more than one.
const FILTER_NAME: &str = "worker";

/// Actions an audited policy records instead of enforcing.
const ENFORCING_ACTIONS: [&str; 3] = ["kill_thread", "kill_process", "trap"];

pub(crate) enum Program {
    Raw(Vec<libc::sock_filter>),
    Compiled(BpfProgram),
}

impl Program {
    pub(crate) fn load(policy: &SandboxPolicy) -> Result<Option<Self>, SandboxError> {
        let path = match (policy.kind, &policy.path) {
            (PolicyKind::None, _) => return Ok(None),
            (kind, None) => return Err(SandboxError::MissingPath(kind)),
            (_, Some(path)) => path,
        };

        let bytes = std::fs::read(path).map_err(|source| SandboxError::Read {
            path: path.clone(),
            source,
        })?;

        let program = match policy.kind {
            PolicyKind::SeccompBpf => Self::Raw(parse_raw(path, &bytes)?),
            PolicyKind::SeccompPolicy => Self::Compiled(compile(path, &bytes, false)?),
            PolicyKind::SeccompPolicyAudit => Self::Compiled(compile(path, &bytes, true)?),
            PolicyKind::None => return Ok(None),
        };

        tracing::debug!(kind = ?policy.kind, path = %path.display(), "loaded seccomp program");
        Ok(Some(program))
    }

    /// Installs the program on the calling thread.
    pub(crate) fn install(&self) -> Result<(), SandboxError> {
        match self {
            Self::Raw(filter) => install_raw(filter),
            Self::Compiled(program) => seccompiler::apply_filter(program).map_err(SandboxError::Apply),
        }
    }
}

fn parse_raw(path: &Path, bytes: &[u8]) -> Result<Vec<libc::sock_filter>, SandboxError> {
    let invalid = |reason| SandboxError::InvalidProgram {
        path: path.to_owned(),
        reason,
    };

    if bytes.is_empty() {
        return Err(invalid("the program is empty"));
    }
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(invalid("the size is not a multiple of the instruction size"));
    }
    if bytes.len() / RECORD_SIZE > MAX_RECORDS {
        return Err(invalid("the program has too many instructions"));
    }

    Ok(bytes
        .chunks_exact(RECORD_SIZE)
        .map(|v| libc::sock_filter {
            code: u16::from_ne_bytes([v[0], v[1]]),
            jt: v[2],
            jf: v[3],
            k: u32::from_ne_bytes([v[4], v[5], v[6], v[7]]),
        })
        .collect())
}

fn compile(path: &Path, bytes: &[u8], audit: bool) -> Result<BpfProgram, SandboxError> {
    let mut document: Value = serde_json::from_slice(bytes).map_err(|source| SandboxError::Json {
        path: path.to_owned(),
        source,
    })?;

    if audit {
        audit_actions(&mut document);
    }

    let arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(|error| SandboxError::Architecture(format!("{error:?}")))?;

    let json = serde_json::to_vec(&document).map_err(|source| SandboxError::Json {
        path: path.to_owned(),
        source,
    })?;
    let mut filters = seccompiler::compile_from_json(json.as_slice(), arch).map_err(|source| {
        SandboxError::Compile {
            path: path.to_owned(),
            source,
        }
    })?;

    if let Some(program) = filters.remove(FILTER_NAME) {
        return Ok(program);
    }

    match filters.len() {
        1 => Ok(filters.into_values().next().unwrap_or_default()),
        _ => Err(SandboxError::MissingFilter {
            path: PathBuf::from(path),
        }),
    }
}

/// Rewrites every enforcing action in a policy document to `log`.
fn audit_actions(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                match value {
                    Value::String(action)
                        if key.ends_with("action") && ENFORCING_ACTIONS.contains(&action.as_str()) =>
                    {
                        *action = "log".into();
                    }
                    _ => audit_actions(value),
                }
            }
        }
        Value::Array(values) => values.iter_mut().for_each(audit_actions),
        _ => {}
    }
}

fn install_raw(filter: &[libc::sock_filter]) -> Result<(), SandboxError> {
    let program = libc::sock_fprog {
        len: filter.len() as libc::c_ushort,
        filter: filter.as_ptr().cast_mut(),
    };

    // SAFETY: plain prctl calls; the kernel copies the program before PR_SET_SECCOMP returns.
    unsafe {
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, 0, 0, 0) != 0 {
            return Err(SandboxError::Install(std::io::Error::last_os_error()));
        }
        if libc::prctl(
            libc::PR_SET_SECCOMP,
            libc::SECCOMP_MODE_FILTER as libc::c_ulong,
            &program as *const libc::sock_fprog,
        ) != 0
        {
            return Err(SandboxError::Install(std::io::Error::last_os_error()));
        }
    }

    Ok(())
}
