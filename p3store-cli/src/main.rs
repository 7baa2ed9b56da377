use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use p3store_core::{
    EncryptionService, EngineKey, HomeDirectory, InteractivePrompt, KeyRecord, P3Error,
    PasswordError, PasswordSource, ServiceConfig, sanitize_for_terminal,
};
use p3store_pgp::NativeEngine;
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const MAX_INPUT_BYTES: usize = 64 * 1024 * 1024;
const MAX_PASSPHRASE_FILE_BYTES: u64 = 16 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "p3store",
    version,
    about = "OpenPGP encryption against a private keyring"
)]
struct Cli {
    /// Keyring home directory [default: $P3STORE_GPG_HOME or <tmp>/p3store-gpg-<uid>]
    #[arg(long, global = true, value_name = "DIR")]
    home: Option<PathBuf>,

    /// Read key passphrases from FILE instead of prompting.
    #[arg(long = "passphrase-file", global = true, value_name = "FILE")]
    passphrase_file: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the home directory if needed and print its path.
    Home,
    /// Remove the home directory and every key in it.
    Destroy {
        #[arg(long)]
        yes: bool,
    },
    Import {
        path: PathBuf,
    },
    #[command(alias = "ls")]
    ListKeys {
        #[arg(long)]
        secret: bool,
    },
    /// Validate a key and print its description.
    Show {
        key: String,
    },
    #[command(alias = "enc")]
    Encrypt {
        #[arg(short = 'r', long = "recipient", value_name = "KEY", required = true)]
        recipients: Vec<String>,
        #[arg(short = 'a', long)]
        armor: bool,
        #[arg(long = "in", value_name = "FILE")]
        input: Option<PathBuf>,
        #[arg(short = 'o', long = "out", value_name = "FILE")]
        output: Option<PathBuf>,
    },
    #[command(alias = "dec")]
    Decrypt {
        #[arg(long = "in", value_name = "FILE")]
        input: Option<PathBuf>,
        #[arg(short = 'o', long = "out", value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

/// Where the CLI gets key passphrases from.
enum Secrets {
    File(PassphraseFile),
    Prompt(InteractivePrompt),
}

impl PasswordSource for Secrets {
    fn password(
        &self,
        key: Option<&KeyRecord>,
        prev_was_bad: bool,
    ) -> Result<String, PasswordError> {
        match self {
            Secrets::File(file) => file.password(key, prev_was_bad),
            Secrets::Prompt(prompt) => prompt.password(key, prev_was_bad),
        }
    }
}

/// A passphrase read once from an owner-only file and handed out for every
/// key.
struct PassphraseFile {
    secret: Zeroizing<String>,
}

impl PassphraseFile {
    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            secret: read_passphrase_file(path)?,
        })
    }
}

impl PasswordSource for PassphraseFile {
    fn password(
        &self,
        _key: Option<&KeyRecord>,
        _prev_was_bad: bool,
    ) -> Result<String, PasswordError> {
        Ok(self.secret.as_str().to_owned())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = ServiceConfig::from_env();
    if let Some(home) = &cli.home {
        config.home = home.clone();
    }
    debug!(home = %config.home.display(), "resolved configuration");

    match cli.cmd {
        Command::Home => {
            let home = HomeDirectory::ensure(config.home)?;
            println!("{}", home.path().display());
            Ok(())
        }
        Command::Destroy { yes } => {
            if !yes {
                bail!(
                    "refusing to destroy {} without --yes",
                    config.home.display()
                );
            }
            let home = HomeDirectory::existing(config.home)?;
            let path = home.path().to_path_buf();
            home.destroy()?;
            println!("destroyed {}", path.display());
            Ok(())
        }
        Command::Import { path } => {
            let service = open_service(&config, cli.passphrase_file.as_deref())?;
            let bytes = read_input(Some(path.as_path()))?;
            for fingerprint in service.import_keys(&bytes)? {
                println!("imported {fingerprint}");
            }
            Ok(())
        }
        Command::ListKeys { secret } => {
            let service = open_service(&config, cli.passphrase_file.as_deref())?;
            let keys = service.list_keys(secret)?;
            if keys.is_empty() {
                println!("no keys found");
                return Ok(());
            }
            for key in keys {
                println!("{}", format_listing(&key));
            }
            Ok(())
        }
        Command::Show { key } => {
            let service = open_service(&config, cli.passphrase_file.as_deref())?;
            let record = service.lookup_key(&key)?;
            println!("{}", sanitize_for_terminal(record.describe()));
            Ok(())
        }
        Command::Encrypt {
            recipients,
            armor,
            input,
            output,
        } => {
            config.armor |= armor;
            let service = open_service(&config, cli.passphrase_file.as_deref())?;
            let records = recipients
                .iter()
                .map(|id| service.lookup_key(id))
                .collect::<Result<Vec<_>, _>>()?;
            let plaintext = read_input(input.as_deref())?;
            let mut ciphertext = Cursor::new(Vec::new());
            service.encrypt(&mut Cursor::new(plaintext), &mut ciphertext, &records)?;
            write_output(output.as_deref(), ciphertext.get_ref())
        }
        Command::Decrypt { input, output } => {
            let service = open_service(&config, cli.passphrase_file.as_deref())?;
            let ciphertext = read_input(input.as_deref())?;
            let mut plaintext = Cursor::new(Vec::new());
            service.decrypt(&mut Cursor::new(ciphertext), &mut plaintext)?;
            let plaintext = Zeroizing::new(plaintext.into_inner());
            write_output(output.as_deref(), &plaintext)
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn open_service(
    config: &ServiceConfig,
    passphrase_file: Option<&Path>,
) -> Result<EncryptionService<NativeEngine>> {
    let secrets = match passphrase_file {
        Some(path) => Secrets::File(
            PassphraseFile::open(path)
                .with_context(|| format!("passphrase file {}", path.display()))?,
        ),
        None => Secrets::Prompt(InteractivePrompt),
    };
    Ok(EncryptionService::with_config(config, secrets)?)
}

/// `kind | fingerprint | user id | status`
fn format_listing(key: &EngineKey) -> String {
    let kind = if key.secret { "sec" } else { "pub" };
    let user = key
        .user_ids
        .first()
        .map(|uid| sanitize_for_terminal(&uid.uid))
        .unwrap_or_else(|| "(no user id)".to_string());
    let status = match KeyRecord::validate(key.clone()) {
        Ok(_) => "usable".to_string(),
        Err(P3Error::InvalidKey { reason, .. }) => reason.to_string(),
        Err(err) => err.to_string(),
    };
    format!("{kind} | {} | {user} | {status}", key.fingerprint)
}

fn read_passphrase_file(path: &Path) -> Result<Zeroizing<String>> {
    use std::os::unix::fs::{MetadataExt, OpenOptionsExt};

    let link_meta = fs::symlink_metadata(path)?;
    if link_meta.file_type().is_symlink() {
        return Err(anyhow!("passphrase file must not be a symlink"));
    }

    // O_NOFOLLOW + fstat so the checks apply to the file actually read.
    let file = fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
        .open(path)?;
    let meta = file.metadata()?;
    if !meta.is_file() {
        return Err(anyhow!("passphrase file must be a regular file"));
    }
    if meta.len() > MAX_PASSPHRASE_FILE_BYTES {
        return Err(anyhow!(
            "passphrase file exceeds size limit ({} bytes; max {MAX_PASSPHRASE_FILE_BYTES} bytes)",
            meta.len()
        ));
    }
    let mode = meta.mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(anyhow!(
            "passphrase file permissions too broad (mode {mode:04o}); require 0400/0600"
        ));
    }
    let uid = meta.uid();
    // Safety: geteuid cannot fail.
    let euid = unsafe { libc::geteuid() };
    if uid != euid {
        return Err(anyhow!(
            "passphrase file must be owned by the current user (uid {uid}, expected {euid})"
        ));
    }

    let bytes = Zeroizing::new(read_to_end_limited(
        file,
        MAX_PASSPHRASE_FILE_BYTES as usize,
    )?);
    let text = std::str::from_utf8(&bytes)
        .map_err(|err| anyhow!("passphrase file must be valid UTF-8: {err}"))?;
    Ok(Zeroizing::new(
        text.trim_end_matches(['\n', '\r']).to_string(),
    ))
}

fn read_input(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) if path.as_os_str() == "-" => read_to_end_limited(io::stdin(), MAX_INPUT_BYTES),
        Some(path) => read_to_end_limited(fs::File::open(path)?, MAX_INPUT_BYTES),
        None => read_to_end_limited(io::stdin(), MAX_INPUT_BYTES),
    }
}

fn read_to_end_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        if buf.len() + read > limit {
            return Err(anyhow!("input exceeds size limit ({limit} bytes)"));
        }
        buf.extend_from_slice(&chunk[..read]);
    }
    Ok(buf)
}

/// Writes to `path` (created owner-only, never through a symlink) or to
/// stdout.
fn write_output(path: Option<&Path>, bytes: &[u8]) -> Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    match path {
        Some(path) => {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
                .open(path)
                .map_err(|err| anyhow!("cannot write {}: {err}", path.display()))?;
            let meta = file.metadata()?;
            if !meta.is_file() {
                bail!("refusing to write to non-regular file {}", path.display());
            }
            // `mode` only applies on creation; an existing file keeps its
            // old bits unless narrowed here, before any byte is written.
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
            file.write_all(bytes)?;
            file.sync_all()?;
            Ok(())
        }
        None => {
            let mut stdout = io::stdout();
            stdout.write_all(bytes)?;
            stdout.flush()?;
            Ok(())
        }
    }
}
