use std::{
    env,
    fmt,
    fs::{self, File},
    io::{self, stderr, Stderr},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use log::{debug, Level, log_enabled};
use serde::{Deserialize, Serialize};
use tokio::signal::ctrl_c;

use fwfetchlib::{
    crypto::FusKeys,
    BinaryFileInfo,
    ErrorKind,
    FileStorage,
    FirmwareIdentifier,
    FusClientBuilder,
    FwVersion,
    JobController,
    JobState,
    Phase,
    ProgressEvent,
    ProgressObserver,
};
use progresslib::{ProgressBar, ProgressDrawMode};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");

struct TerminalState {
    bar: ProgressBar<Stderr>,
    phase: Option<Phase>,
}

impl TerminalState {
    fn update(&mut self, event: &ProgressEvent) -> io::Result<()> {
        if self.phase != Some(event.phase) {
            // Leave the finished phase's last frame on screen
            if self.phase.is_some() {
                self.bar.keep()?;
            }
            self.phase = Some(event.phase);
            self.bar.set_phase(event.phase.label(), event.progress.max)?;
        }

        self.bar.set_progress(event.progress.current, event.progress.speed)
    }
}

/// Renders job progress on stderr and prints the firmware summary on stdout.
struct TerminalObserver {
    state: Mutex<TerminalState>,
}

impl TerminalObserver {
    fn new() -> Self {
        let mut bar = ProgressBar::new(stderr());
        if log_enabled!(Level::Debug) {
            // The escape sequences for the interactive progress bar would
            // clobber log messages.
            bar.set_mode(Some(ProgressDrawMode::Append));
        }

        Self {
            state: Mutex::new(TerminalState { bar, phase: None }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TerminalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn println(&self, msg: &str) -> io::Result<()> {
        self.lock().bar.println(msg)
    }

    fn finish(&self) -> io::Result<()> {
        self.lock().bar.finish()
    }
}

impl ProgressObserver for TerminalObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        if let Err(e) = self.lock().update(event) {
            debug!("Failed to draw progress bar: {e}");
        }
    }

    fn on_binary_info(&self, info: &BinaryFileInfo) {
        let mut state = self.lock();
        if let Err(e) = state.bar.finish() {
            debug!("Failed to clear progress bar: {e}");
        }

        println!("Firmware info:");
        println!("- Model: {} ({})", info.model, info.model_name);
        println!("- Region: {}", info.region);
        println!("- Version: {}", info.version);
        println!("- OS: {} {}", info.platform, info.version_name);
        println!("- Type: {}", if info.binary_nature { "Factory" } else { "Home" });
        println!("- File: {}{}", info.remote_path, info.file_name);
        println!("- Size: {} bytes", info.size_bytes);
        match info.crc32 {
            Some(c) => println!("- CRC32: {c:08X}"),
            None => println!("- CRC32: (not provided)"),
        }
        println!("- Date: {}", info.last_modified);
    }
}

/// Delete a file, but don't error out if the path doesn't exist.
fn delete_if_exists(path: &Path) -> Result<()> {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            return Err(e).context(format!("Failed to delete file: {path:?}"));
        }
    }

    Ok(())
}

/// Load FUS keys from the following list in order:
/// * User-supplied command line arguments
/// * Environment variables
/// * Config file
fn load_keys(opts: &Opts, config: &Option<Config>) -> Result<FusKeys> {
    let fixed_key = opts.fus_fixed_key
        .as_ref()
        .or_else(|| config.as_ref().and_then(|c| c.fus_fixed_key.as_ref()))
        .ok_or_else(|| anyhow!("No FUS fixed key argument or variable specified"))?
        .as_bytes();
    let flexible_key_suffix = opts.fus_flexible_key_suffix
        .as_ref()
        .or_else(|| config.as_ref().and_then(|c| c.fus_flexible_key_suffix.as_ref()))
        .ok_or_else(|| anyhow!("No FUS flexible key suffix argument or variable specified"))?
        .as_bytes();

    FusKeys::new(fixed_key, flexible_key_suffix)
        .context("Invalid FUS keys")
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
enum FirmwareType {
    #[default]
    Home,
    Factory,
}

impl fmt::Display for FirmwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Home => f.write_str("home"),
            Self::Factory => f.write_str("factory"),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => f.write_str("debug"),
            Self::Trace => f.write_str("trace"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct Config {
    fus_fixed_key: Option<String>,
    fus_flexible_key_suffix: Option<String>,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push(format!("{PKG_NAME}.conf"));
        p
    })
}

fn load_config_file(user_path: Option<&Path>) -> Result<Option<Config>> {
    let default_path = default_config_path();
    let Some(path) = user_path.or(default_path.as_deref()) else {
        return Ok(None);
    };

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context(format!("Could not open file: {path:?}")),
    };

    let config = serde_json::from_reader(file)
        .context(format!("Could not parse config file: {path:?}"))?;

    Ok(Some(config))
}

/// Download, verify and decrypt official firmware files from FUS.
#[derive(Debug, Parser)]
#[command(author, version, disable_version_flag = true)]
struct Opts {
    /// Device's model number (eg. SM-N986U)
    #[arg(short, long)]
    model: String,
    /// Region/CSC code (eg. TMB)
    #[arg(short, long)]
    region: String,
    /// Version number
    ///
    /// The format is "<PDA>/<CSC>[/<Phone>/<Data>]". If <Phone> or <Data> are
    /// omitted, then they're set to the same value as <PDA>.
    #[arg(short, long)]
    version: FwVersion,
    /// Firmware type to download (home or factory)
    ///
    /// This option allows the firmware type (also known as "binary nature") to
    /// be selected. By default, the "home" firmware is downloaded.
    #[arg(value_enum, short = 't', long, default_value_t)]
    firmware_type: FirmwareType,
    /// Directory for the downloaded and decrypted files
    ///
    /// The files are named after the filename returned by the server. This
    /// does not present a security issue because all path components are
    /// ignored. Defaults to the current directory.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
    /// Set logging verbosity
    ///
    /// By default, no log messages are printed out. If set to 'debug', FUS
    /// requests and responses and stage transitions are printed out. If set
    /// to 'trace', per-chunk I/O messages are also printed out, which can be
    /// extremely verbose. This option overrides the RUST_LOG environment
    /// variable, which would otherwise be respected if this option was not
    /// passed.
    #[arg(value_enum, long)]
    loglevel: Option<LogLevel>,
    /// Allow overwriting the output file if it exists
    ///
    /// By default, the job stops before downloading anything if the decrypted
    /// output file already exists.
    #[arg(short, long)]
    force: bool,
    /// Keep the downloaded intermediate (encrypted) file
    ///
    /// By default, the encrypted download file is deleted if verification and
    /// decryption succeed.
    #[arg(long)]
    keep_encrypted: bool,
    /// Ignore TLS validation for HTTPS connections
    ///
    /// By default, all HTTPS connections (eg. to FUS) will validate the TLS
    /// certificate against the system's CA trust store.
    #[arg(long)]
    ignore_tls_validation: bool,
    /// FUS fixed key
    ///
    /// If unspecified, the key is loaded from the `FUS_FIXED_KEY` environment
    /// variable, followed by the `fus_fixed_key` config file variable.
    #[arg(long, env = "FUS_FIXED_KEY", hide_env_values = true)]
    fus_fixed_key: Option<String>,
    /// FUS flexible key suffix
    ///
    /// If unspecified, the key is loaded from the `FUS_FLEXIBLE_KEY_SUFFIX`
    /// environment variable, followed by the `fus_flexible_key_suffix` config
    /// file variable.
    #[arg(long, env = "FUS_FLEXIBLE_KEY_SUFFIX", hide_env_values = true)]
    fus_flexible_key_suffix: Option<String>,
    /// Config file path
    ///
    /// If unspecified, the default config file path is used. The config file
    /// can store the FUS keys to avoid needing to set environment variables or
    /// pass them as command-line arguments.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Some(l) = opts.loglevel {
        env::set_var("RUST_LOG", format!("{PKG_NAME}={l},fwfetchlib={l}"));
    }

    env_logger::init();
    let log_keys_var = format!("{}_LOG_KEYS", PKG_NAME.to_uppercase());
    let log_keys = matches!(env::var(log_keys_var), Ok(v) if v == "true");

    if log_keys {
        debug!("Arguments: {opts:#?}");
    }

    let config = load_config_file(opts.config.as_deref())?;
    if log_keys {
        debug!("Config: {config:#?}");
    }

    let keys = load_keys(&opts, &config)?;
    if log_keys {
        debug!("Keys: {keys:?}");
    }

    let output_dir = opts.output_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&output_dir)
        .context(format!("Could not create output directory: {output_dir:?}"))?;
    let storage = Arc::new(FileStorage::new(&output_dir));

    let client = FusClientBuilder::new(keys)
        .ignore_tls_validation(opts.ignore_tls_validation)
        .factory(opts.firmware_type == FirmwareType::Factory)
        .build();

    let observer = Arc::new(TerminalObserver::new());
    let controller = JobController::builder(client, storage.clone())
        .observer(observer.clone())
        .overwrite(opts.force)
        .build();

    let identifier = FirmwareIdentifier::new(&opts.model, &opts.region, opts.version.clone());
    debug!("Acquiring firmware: {identifier}");

    let handle = controller.start_acquisition(identifier)?;

    tokio::select! {
        _ = handle.wait() => {}
        r = ctrl_c() => {
            r.context("Failed to listen for Ctrl-C")?;
            observer.println("Cancelling...")?;
            controller.cancel(&handle);
            handle.wait().await;
        }
    }

    observer.finish()?;
    let job = controller.acknowledge(&handle)?;

    match job.state {
        JobState::Completed => {
            let (Some(file_name), Some(output_name)) = (&job.file_name, &job.output_name) else {
                return Err(anyhow!("Job completed without file names"));
            };

            if !opts.keep_encrypted {
                delete_if_exists(&storage.path_for(file_name)?)?;
            }

            println!("Decrypted firmware: {:?}", storage.path_for(output_name)?);
            Ok(())
        }
        JobState::Failed(f) if f.kind == ErrorKind::AlreadyExists => {
            Err(anyhow!("{}. Use -f/--force to overwrite.", f.message))
        }
        JobState::Failed(f) => Err(anyhow!(f.message)),
        JobState::Cancelled => Err(anyhow!("Download was cancelled")),
        s => Err(anyhow!("Job ended in unexpected state: {s:?}")),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn opts(args: &[&str]) -> Opts {
        let mut argv = vec!["fwfetch", "-m", "SM-N986U", "-r", "TMB", "-v", "A/B"];
        argv.extend_from_slice(args);
        Opts::parse_from(argv)
    }

    #[test]
    fn test_parse_options() {
        let opts = opts(&["-t", "factory", "--keep-encrypted"]);

        assert_eq!(opts.firmware_type, FirmwareType::Factory);
        assert!(!opts.force);
        assert_eq!(opts.version, FwVersion::new("A", "B", None, None));
        assert!(opts.keep_encrypted);
        assert!(Opts::try_parse_from(["fwfetch", "-m", "X", "-r", "Y", "-v", "A"]).is_err());
        assert!(self::opts(&["-f"]).force);
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.conf");
        assert!(load_config_file(Some(missing.as_path())).unwrap().is_none());

        let malformed = dir.path().join("malformed.conf");
        fs::write(&malformed, "{").unwrap();
        assert!(load_config_file(Some(malformed.as_path())).is_err());

        let valid = dir.path().join("valid.conf");
        let mut file = File::create(&valid).unwrap();
        write!(file, r#"{{"fus_fixed_key": "{}", "fus_flexible_key_suffix": "{}"}}"#,
               "f".repeat(32), "s".repeat(16)).unwrap();
        drop(file);

        let config = load_config_file(Some(valid.as_path())).unwrap();
        let keys = load_keys(&opts(&[]), &config).unwrap();
        assert_eq!(keys.fixed_key, [b'f'; 32]);
        assert_eq!(keys.flexible_key_suffix, [b's'; 16]);
    }

    #[test]
    fn test_key_precedence() {
        let config = Some(Config {
            fus_fixed_key: Some("c".repeat(32)),
            fus_flexible_key_suffix: Some("c".repeat(16)),
        });

        let fixed = "a".repeat(32);
        let keys = load_keys(&opts(&["--fus-fixed-key", &fixed]), &config).unwrap();
        assert_eq!(keys.fixed_key, [b'a'; 32]);
        assert_eq!(keys.flexible_key_suffix, [b'c'; 16]);

        let short = load_keys(&opts(&["--fus-fixed-key", "short"]), &config);
        assert!(short.is_err());
    }
}
