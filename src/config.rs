//! Harness configuration: JSON file plus command-line overrides

use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::{QgemmError, Result};
use crate::operator::{GraphConfig, KernelConfig, KernelModule, QuantizedGemmParams};

/// Graph backend to run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Host emulation
    #[default]
    Emulated,
    /// wgpu adapter (needs the `gpu` feature)
    Wgpu,
}

/// Everything one harness run needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Rows of A and OUT
    pub m: u32,
    /// Reduction length
    pub k: u32,
    /// Columns of OUT
    pub n: u32,
    /// Quantization block size
    pub block_size: u32,
    /// Timed dispatches on the fast path
    pub iters: u32,
    /// Graph backend
    pub backend: BackendKind,
    /// Kernel module to load on the raw-kernel backend
    pub kernel_module: Option<PathBuf>,
    /// Entry point inside `kernel_module`
    pub kernel_entry: Option<String>,
    /// Use the CUDA driver for the raw-kernel backend
    pub cuda: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let params = QuantizedGemmParams::harness();
        Self {
            m: params.m,
            k: params.k,
            n: params.n,
            block_size: params.block_size,
            iters: 1,
            backend: BackendKind::default(),
            kernel_module: None,
            kernel_entry: None,
            cuda: false,
        }
    }
}

impl HarnessConfig {
    /// Load a JSON config; missing fields keep their defaults
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read and `Config` if it is not a
    /// valid config.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| QgemmError::Config(format!("{}: {e}", path.display())))
    }

    /// Operator shape
    #[must_use]
    pub fn params(&self) -> QuantizedGemmParams {
        QuantizedGemmParams {
            m: self.m,
            k: self.k,
            n: self.n,
            block_size: self.block_size,
            b_transposed: true,
        }
    }

    /// Fast-path graph settings
    #[must_use]
    pub fn graph_config(&self) -> GraphConfig {
        GraphConfig {
            iters: self.iters,
            disable_meta_commands: false,
        }
    }

    /// Raw-kernel settings
    ///
    /// # Errors
    ///
    /// Returns `Config` if only one of module path and entry name is set.
    pub fn kernel_config(&self) -> Result<KernelConfig> {
        let module = match (&self.kernel_module, &self.kernel_entry) {
            (Some(path), Some(entry)) => Some(KernelModule {
                path: path.clone(),
                entry: entry.clone(),
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(QgemmError::Config(
                    "--kernel-module needs --kernel-entry".to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(QgemmError::Config(
                    "--kernel-entry needs --kernel-module".to_string(),
                ))
            }
        };
        Ok(KernelConfig {
            iters: self.iters,
            module,
        })
    }
}

/// Command-line interface of the `qgemm` binary
#[derive(Debug, Parser)]
#[command(name = "qgemm")]
#[command(author, version, about = "Block-quantized int4 x f16 GEMM conformance harness")]
pub struct Cli {
    /// Rows of A and OUT
    #[arg(short = 'm', long)]
    pub m: Option<u32>,

    /// Reduction length
    #[arg(short = 'k', long)]
    pub k: Option<u32>,

    /// Columns of OUT
    #[arg(short = 'n', long)]
    pub n: Option<u32>,

    /// Quantization block size (must divide K)
    #[arg(long)]
    pub block_size: Option<u32>,

    /// Timed dispatches on the fast path
    #[arg(long)]
    pub iters: Option<u32>,

    /// Graph backend
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Kernel module (PTX) for the raw-kernel backend
    #[arg(long, value_name = "PATH")]
    pub kernel_module: Option<PathBuf>,

    /// Mangled entry name inside the kernel module
    #[arg(long, value_name = "NAME")]
    pub kernel_entry: Option<String>,

    /// Run the raw-kernel backend on the CUDA driver
    #[arg(long)]
    pub cuda: bool,

    /// JSON config file; flags override its values
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Merge the config file (if any) with the flags
    ///
    /// # Errors
    ///
    /// Returns the config file's load error.
    pub fn resolve(&self) -> Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::from_file(path)?,
            None => HarnessConfig::default(),
        };
        if let Some(m) = self.m {
            config.m = m;
        }
        if let Some(k) = self.k {
            config.k = k;
        }
        if let Some(n) = self.n {
            config.n = n;
        }
        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        if let Some(iters) = self.iters {
            config.iters = iters;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(path) = &self.kernel_module {
            config.kernel_module = Some(path.clone());
        }
        if let Some(entry) = &self.kernel_entry {
            config.kernel_entry = Some(entry.clone());
        }
        config.cuda |= self.cuda;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_harness_shape() {
        let config = HarnessConfig::default();
        assert_eq!((config.m, config.k, config.n, config.block_size), (512, 512, 512, 32));
        assert_eq!(config.iters, 1);
        assert_eq!(config.backend, BackendKind::Emulated);
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"m": 64, "k": 128, "backend": "emulated", "iters": 5}}"#).unwrap();

        let cli = Cli::parse_from([
            "qgemm",
            "--config",
            file.path().to_str().unwrap(),
            "-k",
            "256",
            "--block-size",
            "64",
        ]);
        let config = cli.resolve().unwrap();
        assert_eq!(config.m, 64);
        assert_eq!(config.k, 256);
        assert_eq!(config.n, 512);
        assert_eq!(config.block_size, 64);
        assert_eq!(config.iters, 5);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"tile": 8}}"#).unwrap();
        let err = HarnessConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, QgemmError::Config(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = HarnessConfig::from_file(Path::new("/nonexistent/qgemm.json")).unwrap_err();
        assert!(matches!(err, QgemmError::Io(_)));
    }

    #[test]
    fn test_kernel_module_needs_entry() {
        let config = HarnessConfig {
            kernel_module: Some(PathBuf::from("kernels/vec_add.ptx")),
            ..HarnessConfig::default()
        };
        assert!(config.kernel_config().is_err());

        let config = HarnessConfig {
            kernel_entry: Some("_Z7vec_addPfS_S_".to_string()),
            ..config
        };
        let kernel = config.kernel_config().unwrap();
        assert_eq!(kernel.module.unwrap().entry, "_Z7vec_addPfS_S_");
    }

    #[test]
    fn test_verbose_counts() {
        let cli = Cli::parse_from(["qgemm", "-vv", "--backend", "wgpu"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.backend, Some(BackendKind::Wgpu));
    }
}
