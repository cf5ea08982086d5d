/// Per-backend streaming strategy and the flag names needed to switch a
/// backend into that mode.
#[derive(Debug, Clone)]
pub enum StreamMethod {
    /// No streaming artefact; buffer stdout/stderr fully.
    None,
    /// The backend emits one JSON object per line on stdout once the listed
    /// flags are present on argv.
    JsonStdout { enable_flags: Vec<String> },
    /// The backend writes rolling `*.log` files into a directory passed via
    /// `dir_flag`.
    LogFile { dir_flag: String },
}

/// The resolved streaming configuration for one backend, consulted by the
/// base executor at the top of `ExecuteWithStreaming`.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub method: StreamMethod,
}

impl StreamConfig {
    pub fn none() -> Self {
        Self { method: StreamMethod::None }
    }

    pub fn json_stdout(enable_flags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            method: StreamMethod::JsonStdout {
                enable_flags: enable_flags.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn log_file(dir_flag: impl Into<String>) -> Self {
        Self {
            method: StreamMethod::LogFile {
                dir_flag: dir_flag.into(),
            },
        }
    }

    /// Appends this config's "enable streaming" flags to `argv`, idempotently
    /// (skips any flag already present).
    pub fn apply_enable_flags(&self, argv: &mut Vec<String>) {
        if let StreamMethod::JsonStdout { enable_flags } = &self.method {
            for flag in enable_flags {
                if !argv.iter().any(|existing| existing == flag) {
                    argv.push(flag.clone());
                }
            }
        }
    }
}
