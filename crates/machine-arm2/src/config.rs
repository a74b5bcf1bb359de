//! Machine configuration.
//!
//! Every field has a default suitable for small guest programs; the
//! facade overrides what it needs. Validation happens when the VM is
//! created so a bad layout is a structured error, not a fault at runtime.

use std::fmt;
use std::path::PathBuf;

/// Guest byte order. Only little-endian is implemented; the option exists
/// so configurations state it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// VM configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Instruction budget per run.
    pub max_cycles: u64,
    /// Code origin (text base).
    pub origin: u32,
    /// Stack segment size in bytes.
    pub stack_size: u32,
    /// Top of stack; the segment spans `[stack_top - stack_size, stack_top)`.
    pub stack_top: u32,
    /// Heap segment size.
    pub heap_size: u32,
    /// Upper bound on the addressable layout.
    pub memory_size: u32,
    /// Filesystem sandbox root. `None` disables the file syscalls.
    pub fs_root: Option<PathBuf>,
    /// Per-file size cap for guest writes.
    pub max_file_size: u64,
    /// Whether unaligned word/halfword accesses fault.
    pub strict_alignment: bool,
    pub endianness: Endianness,
    /// `.include` nesting limit.
    pub max_include_depth: u32,
    /// Instructions between cooperative yields during `continue`.
    pub steps_before_yield: u32,
    /// Guest program arguments (`GET_ARGUMENTS`).
    pub args: Vec<String>,
    /// Guest environment as `NAME=value` strings (`GET_ENVIRONMENT`).
    pub env: Vec<String>,
}

/// Hard cap on the per-file size limit.
pub const MAX_FILE_SIZE_LIMIT: u64 = 16 * 1024 * 1024;

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_cycles: 1_000_000,
            origin: 0x8000,
            stack_size: 0x1_0000,
            stack_top: 0x4_0000,
            heap_size: 0x1_0000,
            memory_size: 0x100_0000,
            fs_root: None,
            max_file_size: 1024 * 1024,
            strict_alignment: true,
            endianness: Endianness::Little,
            max_include_depth: 100,
            steps_before_yield: 1000,
            args: Vec::new(),
            env: Vec::new(),
        }
    }
}

/// A configuration that cannot produce a valid machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    BigEndianUnsupported,
    StackOverflowsAddressSpace,
    /// The per-file cap exceeds the hard limit.
    FileSizeCap,
    ZeroBudget,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BigEndianUnsupported => {
                write!(f, "big-endian guests are not supported")
            }
            Self::StackOverflowsAddressSpace => {
                write!(f, "stackSize does not fit below the stack top")
            }
            Self::FileSizeCap => {
                write!(f, "file size cap exceeds the {MAX_FILE_SIZE_LIMIT}-byte limit")
            }
            Self::ZeroBudget => write!(f, "maxCycles must be nonzero"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl VmConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for layouts no machine can satisfy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endianness == Endianness::Big {
            return Err(ConfigError::BigEndianUnsupported);
        }
        if self.stack_size == 0 || self.stack_size > self.stack_top {
            return Err(ConfigError::StackOverflowsAddressSpace);
        }
        if self.max_file_size > MAX_FILE_SIZE_LIMIT {
            return Err(ConfigError::FileSizeCap);
        }
        if self.max_cycles == 0 {
            return Err(ConfigError::ZeroBudget);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(VmConfig::default().validate(), Ok(()));
    }

    #[test]
    fn invalid_configs_rejected() {
        let config = VmConfig { endianness: Endianness::Big, ..VmConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::BigEndianUnsupported));

        let config = VmConfig { stack_size: 0x5_0000, stack_top: 0x4_0000, ..VmConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::StackOverflowsAddressSpace));

        let config =
            VmConfig { max_file_size: MAX_FILE_SIZE_LIMIT + 1, ..VmConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::FileSizeCap));
    }
}
