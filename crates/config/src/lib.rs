use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

/// Size requested from the monitor when the config does not override it.
pub const DEFAULT_MEMORY_SIZE: u64 = 0xffff_ffff;

#[derive(Debug, thiserror::Error)]
pub enum NumberError {
    #[error("invalid number '{0}'")]
    Invalid(String),
}

/// Parses `0x`-prefixed hex or plain decimal, ignoring `_` separators.
pub fn parse_u64(text: &str) -> Result<u64, NumberError> {
    let cleaned = text.trim().replace('_', "");
    let parsed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|_| NumberError::Invalid(text.to_string()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Int(u64),
    Text(String),
}

impl RawNumber {
    fn into_u64<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            RawNumber::Int(v) => Ok(v),
            RawNumber::Text(s) => parse_u64(&s).map_err(E::custom),
        }
    }
}

fn de_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    RawNumber::deserialize(d)?.into_u64()
}

fn de_opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    Option::<RawNumber>::deserialize(d)?
        .map(RawNumber::into_u64)
        .transpose()
}

fn default_true() -> bool {
    true
}

fn default_hits() -> u32 {
    1
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_guest_gdb() -> String {
    "localhost:1234".to_string()
}

fn default_monitor() -> String {
    "localhost:55555".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Directory name under the targets root.
    pub name: String,
    /// Substring the current process name must contain.
    pub program: String,
    #[serde(deserialize_with = "de_u64")]
    pub breakpoint: u64,
    #[serde(deserialize_with = "de_u64")]
    pub base: u64,
    /// ELF whose function symbols are seeded into the address store.
    #[serde(default)]
    pub symbols: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub check_name: bool,
    #[serde(default = "default_hits")]
    pub hits_required: u32,
}

/// Where the guest kernel keeps the running task.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct KernelConfig {
    #[serde(default)]
    pub image: Option<PathBuf>,
    /// Address of `__per_cpu_offset`.
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub per_cpu_offset: Option<u64>,
    /// Per-cpu offset of `current_task`.
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub current_task: Option<u64>,
    /// Offset of `comm` inside `struct task_struct`.
    #[serde(deserialize_with = "de_u64")]
    pub comm_offset: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct WaitConfig {
    /// Zero waits forever.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// How the extractor finds the live `CPUState` inside the host process.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CpuLocator {
    /// Address of a pointer to the first `CPUState`.
    #[serde(deserialize_with = "de_u64")]
    Pointer(u64),
    /// Entry of a function taking `CPUState *` as its first argument.
    #[serde(deserialize_with = "de_u64")]
    Breakpoint(u64),
}

/// Where `CPUX86State` lives relative to the `CPUState` pointer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EnvLocation {
    /// `env` is embedded at this offset.
    #[serde(deserialize_with = "de_u64")]
    Embedded(u64),
    /// A pointer to `env` is stored at this offset.
    #[serde(deserialize_with = "de_u64")]
    Pointer(u64),
}

/// Field offsets inside `CPUX86State`, pinned per host build.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CpuLayout {
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub env: EnvLocation,
    #[serde(deserialize_with = "de_u64")]
    pub regs: u64,
    #[serde(deserialize_with = "de_u64")]
    pub eip: u64,
    #[serde(deserialize_with = "de_u64")]
    pub eflags: u64,
    #[serde(deserialize_with = "de_u64")]
    pub segs: u64,
    #[serde(deserialize_with = "de_u64")]
    pub ldt: u64,
    #[serde(deserialize_with = "de_u64")]
    pub tr: u64,
    #[serde(deserialize_with = "de_u64")]
    pub gdt: u64,
    #[serde(deserialize_with = "de_u64")]
    pub idt: u64,
    #[serde(deserialize_with = "de_u64")]
    pub cr: u64,
    #[serde(deserialize_with = "de_u64")]
    pub dr: u64,
    #[serde(deserialize_with = "de_u64")]
    pub efer: u64,
    #[serde(deserialize_with = "de_u64")]
    pub star: u64,
    #[serde(deserialize_with = "de_u64")]
    pub lstar: u64,
    #[serde(deserialize_with = "de_u64")]
    pub cstar: u64,
    #[serde(deserialize_with = "de_u64")]
    pub fmask: u64,
    #[serde(deserialize_with = "de_u64")]
    pub kernel_gs_base: u64,
    #[serde(deserialize_with = "de_u64")]
    pub sysenter_cs: u64,
    #[serde(deserialize_with = "de_u64")]
    pub sysenter_esp: u64,
    #[serde(deserialize_with = "de_u64")]
    pub sysenter_eip: u64,
    #[serde(deserialize_with = "de_u64")]
    pub pat: u64,
    #[serde(deserialize_with = "de_u64")]
    pub tsc: u64,
    #[serde(deserialize_with = "de_u64")]
    pub tsc_aux: u64,
    #[serde(deserialize_with = "de_u64")]
    pub xcr0: u64,
    #[serde(deserialize_with = "de_u64")]
    pub mxcsr: u64,
    #[serde(deserialize_with = "de_u64")]
    pub fpop: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// gdbserver attached to the virtualization host process.
    pub gdb: String,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub cpu: CpuLocator,
    pub layout: CpuLayout,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    pub schema_version: String,
    pub target: TargetConfig,
    #[serde(default)]
    pub targets_root: Option<PathBuf>,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_guest_gdb")]
    pub guest_gdb: String,
    #[serde(default = "default_monitor")]
    pub monitor: String,
    /// Human size ("4GiB") or hex ("0xffffffff").
    #[serde(default)]
    pub memory_size: Option<String>,
    #[serde(default)]
    pub kernel: Option<KernelConfig>,
    #[serde(default)]
    pub wait: WaitConfig,
    #[serde(default)]
    pub host: Option<HostConfig>,
}

impl CaptureConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open capture config at {:?}", path.as_ref()))?;
        let config: Self =
            serde_yaml::from_reader(f).context("Failed to parse capture config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != "1.0" {
            anyhow::bail!(
                "Unsupported schema_version '{}'. Supported versions: '1.0'",
                self.schema_version
            );
        }

        if self.target.name.trim().is_empty() {
            anyhow::bail!("Target 'name' cannot be empty");
        }

        if self.target.check_name && self.target.program.trim().is_empty() {
            anyhow::bail!("Target 'program' cannot be empty when 'check_name' is set");
        }

        if self.target.hits_required == 0 {
            anyhow::bail!("Target 'hits_required' must be greater than zero");
        }

        if self.target.check_name && self.kernel.is_none() {
            anyhow::bail!("A 'kernel' section is required when 'check_name' is set");
        }

        if self.wait.poll_interval_ms == 0 {
            anyhow::bail!("Wait 'poll_interval_ms' must be greater than zero");
        }

        self.memory_size_bytes()?;
        Ok(())
    }

    pub fn memory_size_bytes(&self) -> Result<u64> {
        match &self.memory_size {
            None => Ok(DEFAULT_MEMORY_SIZE),
            Some(s) if s.trim().starts_with("0x") => Ok(parse_u64(s)?),
            Some(s) => parse_size(s),
        }
    }

    /// Targets root: the configured one, else `$WTF/targets`.
    pub fn resolve_targets_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.targets_root {
            return Ok(root.clone());
        }
        let wtf = std::env::var_os("WTF")
            .context("No 'targets_root' configured and the WTF environment variable is unset")?;
        Ok(PathBuf::from(wtf).join("targets"))
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}
