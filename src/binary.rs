//! Locating the proxy executable for the host platform

use crate::error::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Host CPU architecture class, used to pick the binary variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X64,
    Arm64,
    Ia32,
    Arm,
    Unknown,
}

impl Architecture {
    /// Map a Rust target architecture name
    pub fn from_target(arch: &str) -> Self {
        match arch {
            "x86_64" => Architecture::X64,
            "aarch64" => Architecture::Arm64,
            "x86" => Architecture::Ia32,
            "arm" => Architecture::Arm,
            _ => Architecture::Unknown,
        }
    }

    pub fn current() -> Self {
        Self::from_target(std::env::consts::ARCH)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X64 => "x64",
            Architecture::Arm64 => "arm64",
            Architecture::Ia32 => "ia32",
            Architecture::Arm => "arm",
            Architecture::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves `<resource_dir>/bin/<os>-<arch>/<binary_name>`
#[derive(Debug, Clone)]
pub struct BinaryLocator {
    resource_dir: PathBuf,
    binary_name: String,
    arch: Architecture,
}

impl BinaryLocator {
    pub fn new<P: AsRef<Path>>(resource_dir: P, binary_name: &str, arch: Architecture) -> Self {
        Self {
            resource_dir: resource_dir.as_ref().to_path_buf(),
            binary_name: binary_name.to_string(),
            arch,
        }
    }

    pub fn arch(&self) -> Architecture {
        self.arch
    }

    /// Name of the per-platform directory, e.g. `linux-x64`
    pub fn platform_dir(&self) -> String {
        format!("{}-{}", std::env::consts::OS, self.arch)
    }

    /// Where the binary is expected to be
    pub fn path(&self) -> PathBuf {
        self.resource_dir
            .join("bin")
            .join(self.platform_dir())
            .join(format!("{}{}", self.binary_name, std::env::consts::EXE_SUFFIX))
    }

    /// Verify the binary exists and is executable
    pub fn resolve(&self) -> Result<PathBuf> {
        if self.arch == Architecture::Unknown {
            return Err(Error::BinaryUnavailable(format!(
                "unsupported architecture '{}'",
                std::env::consts::ARCH
            )));
        }

        let path = self.path();
        debug!(path = %path.display(), "Resolving proxy binary");

        let metadata = std::fs::metadata(&path).map_err(|e| {
            Error::BinaryUnavailable(format!("{}: {}", path.display(), e))
        })?;

        if !metadata.is_file() {
            return Err(Error::BinaryUnavailable(format!(
                "{} is not a file",
                path.display()
            )));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(Error::BinaryUnavailable(format!(
                    "{} is not executable",
                    path.display()
                )));
            }
        }

        info!(path = %path.display(), arch = %self.arch, "Proxy binary resolved");
        Ok(path)
    }
}
