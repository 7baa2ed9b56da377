use openpgp::cert::prelude::*;
use openpgp::crypto::Password;
use openpgp::serialize::SerializeInto;
use sequoia_openpgp as openpgp;
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use tempfile::TempDir;

const PASSWORD: &str = "walter2";

/// Binary TSK of an RSA-2048 key protected with "walter2".
fn walter_tsk() -> &'static [u8] {
    static TSK: OnceLock<Vec<u8>> = OnceLock::new();
    TSK.get_or_init(|| {
        let (cert, _rev) =
            CertBuilder::general_purpose(Some("Walter Example <walter-rsa-rsa@example.com>"))
                .set_cipher_suite(CipherSuite::RSA2k)
                .set_password(Some(Password::from(PASSWORD)))
                .generate()
                .expect("generate key");
        cert.as_tsk().to_vec().expect("serialize tsk")
    })
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    fn home(&self) -> PathBuf {
        self.dir.path().join("gnupg")
    }

    fn file(&self, name: &str, contents: &[u8], mode: u32) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).expect("write fixture");
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).expect("chmod fixture");
        path
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> (i32, String, String) {
        run_cli(&self.home(), args, stdin)
    }

    fn import_walter(&self) {
        let key = self.file("walter.pgp", walter_tsk(), 0o600);
        let (code, stdout, stderr) = self.run(&["import", path_str(&key)], None);
        assert_eq!(code, 0, "import failed: {stderr}");
        assert!(stdout.starts_with("imported "), "{stdout}");
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

fn run_cli(home: &Path, args: &[&str], stdin: Option<&[u8]>) -> (i32, String, String) {
    let bin = env!("CARGO_BIN_EXE_p3store");
    let mut cmd = Command::new(bin);
    cmd.arg("--home")
        .arg(home)
        .args(args)
        .env_remove("P3STORE_GPG_HOME")
        .env_remove("P3STORE_ARMOR")
        .env("RUST_BACKTRACE", "0")
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().expect("spawn p3store");
    if let Some(input) = stdin {
        let mut handle = child.stdin.take().expect("stdin handle");
        // The child may exit on bad arguments before reading stdin.
        match handle.write_all(input) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {}
            Err(err) => panic!("write stdin: {err}"),
        }
    }
    let output = child.wait_with_output().expect("wait output");
    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

fn mode_of(path: &Path) -> u32 {
    fs::metadata(path).expect("stat").permissions().mode() & 0o7777
}

#[test]
fn home_creates_private_directory() {
    let fx = Fixture::new();
    let (code, stdout, stderr) = fx.run(&["home"], None);
    assert_eq!(code, 0, "{stderr}");
    assert_eq!(stdout.trim(), path_str(&fx.home()));
    assert_eq!(mode_of(&fx.home()), 0o700);
}

#[test]
fn home_with_loose_mode_is_refused() {
    let fx = Fixture::new();
    fs::create_dir(fx.home()).expect("mkdir");
    fs::set_permissions(fx.home(), fs::Permissions::from_mode(0o755)).expect("chmod");

    let (code, _stdout, stderr) = fx.run(&["list-keys"], None);
    assert_ne!(code, 0);
    assert!(stderr.contains("expected 0700"), "{stderr}");
    assert_eq!(mode_of(&fx.home()), 0o755);
}

#[test]
fn destroy_requires_confirmation() {
    let fx = Fixture::new();
    assert_eq!(fx.run(&["home"], None).0, 0);

    let (code, _stdout, stderr) = fx.run(&["destroy"], None);
    assert_ne!(code, 0);
    assert!(stderr.contains("--yes"), "{stderr}");
    assert!(fx.home().exists());

    let (code, stdout, stderr) = fx.run(&["destroy", "--yes"], None);
    assert_eq!(code, 0, "{stderr}");
    assert!(stdout.starts_with("destroyed "), "{stdout}");
    assert!(!fx.home().exists());
}

#[test]
fn empty_keyring_lists_nothing() {
    let fx = Fixture::new();
    let (code, stdout, stderr) = fx.run(&["list-keys"], None);
    assert_eq!(code, 0, "{stderr}");
    assert_eq!(stdout.trim(), "no keys found");
}

#[test]
fn import_list_and_show() {
    let fx = Fixture::new();
    fx.import_walter();

    let (code, stdout, stderr) = fx.run(&["list-keys", "--secret"], None);
    assert_eq!(code, 0, "{stderr}");
    assert!(stdout.starts_with("sec | "), "{stdout}");
    assert!(stdout.contains("walter-rsa-rsa@example.com"), "{stdout}");
    assert!(stdout.trim_end().ends_with("| usable"), "{stdout}");

    let (code, stdout, stderr) = fx.run(&["show", "walter"], None);
    assert_eq!(code, 0, "{stderr}");
    assert!(stdout.contains("<walter-rsa-rsa@example.com>"), "{stdout}");
    assert!(stdout.contains("(RSA,enc,secret)"), "{stdout}");
}

#[test]
fn show_unknown_key_fails() {
    let fx = Fixture::new();
    let (code, _stdout, stderr) = fx.run(&["show", "nobody@example.com"], None);
    assert_ne!(code, 0);
    assert!(stderr.contains("key not found: nobody@example.com"), "{stderr}");
}

#[test]
fn encrypt_requires_recipient() {
    let fx = Fixture::new();
    let (code, _stdout, stderr) = fx.run(&["encrypt"], Some(b"data"));
    assert_ne!(code, 0);
    assert!(stderr.contains("--recipient"), "{stderr}");
}

#[test]
fn encrypt_decrypt_round_trip_with_passphrase_file() {
    let fx = Fixture::new();
    fx.import_walter();
    let pass = fx.file("pass", format!("{PASSWORD}\n").as_bytes(), 0o600);
    let plain = fx.file("plain.txt", b"Hello World!\n", 0o600);
    let cipher = fx.path("cipher.pgp");
    let decrypted = fx.path("plain.out");

    let (code, _stdout, stderr) = fx.run(
        &[
            "encrypt",
            "-r",
            "walter-rsa-rsa@example.com",
            "--in",
            path_str(&plain),
            "-o",
            path_str(&cipher),
        ],
        None,
    );
    assert_eq!(code, 0, "{stderr}");
    assert_eq!(mode_of(&cipher), 0o600);
    let ciphertext = fs::read(&cipher).expect("read ciphertext");
    assert!(!ciphertext.windows(5).any(|w| w == b"Hello"));

    let (code, _stdout, stderr) = fx.run(
        &[
            "--passphrase-file",
            path_str(&pass),
            "decrypt",
            "--in",
            path_str(&cipher),
            "-o",
            path_str(&decrypted),
        ],
        None,
    );
    assert_eq!(code, 0, "{stderr}");
    assert_eq!(fs::read(&decrypted).expect("read plaintext"), b"Hello World!\n");
}

#[test]
fn armored_encrypt_through_stdio() {
    let fx = Fixture::new();
    fx.import_walter();
    let pass = fx.file("pass", PASSWORD.as_bytes(), 0o400);

    let (code, armored, stderr) = fx.run(
        &["encrypt", "-a", "-r", "walter"],
        Some(b"stdin secret"),
    );
    assert_eq!(code, 0, "{stderr}");
    assert!(armored.starts_with("-----BEGIN PGP MESSAGE-----"), "{armored}");

    let (code, stdout, stderr) = fx.run(
        &["--passphrase-file", path_str(&pass), "decrypt"],
        Some(armored.as_bytes()),
    );
    assert_eq!(code, 0, "{stderr}");
    assert_eq!(stdout, "stdin secret");
}

#[test]
fn wrong_passphrase_fails_without_output() {
    let fx = Fixture::new();
    fx.import_walter();
    let pass = fx.file("pass", b"wrong\n", 0o600);
    let out = fx.path("plain.out");

    let (code, ciphertext, stderr) = fx.run(&["encrypt", "-a", "-r", "walter"], Some(b"data"));
    assert_eq!(code, 0, "{stderr}");
    let cipher = fx.file("cipher.pgp", ciphertext.as_bytes(), 0o600);

    let (code, _stdout, stderr) = fx.run(
        &[
            "--passphrase-file",
            path_str(&pass),
            "decrypt",
            "--in",
            path_str(&cipher),
            "-o",
            path_str(&out),
        ],
        None,
    );
    assert_ne!(code, 0);
    assert!(stderr.contains("bad password"), "{stderr}");
    assert!(!out.exists());
}

#[test]
fn passphrase_file_must_be_private() {
    let fx = Fixture::new();
    let pass = fx.file("pass", b"walter2\n", 0o644);
    let (code, _stdout, stderr) = fx.run(
        &["--passphrase-file", path_str(&pass), "decrypt"],
        Some(b"irrelevant"),
    );
    assert_ne!(code, 0);
    assert!(stderr.contains("too broad"), "{stderr}");
}

#[test]
fn destroy_does_not_create_a_missing_home() {
    let fx = Fixture::new();
    let (code, _stdout, stderr) = fx.run(&["destroy", "--yes"], None);
    assert_ne!(code, 0);
    assert!(stderr.contains("filesystem error"), "{stderr}");
    assert!(!fx.home().exists());
}

#[test]
fn destroy_removes_home_with_loose_mode() {
    let fx = Fixture::new();
    fs::create_dir(fx.home()).expect("mkdir");
    fs::set_permissions(fx.home(), fs::Permissions::from_mode(0o750)).expect("chmod");

    let (code, stdout, stderr) = fx.run(&["destroy", "--yes"], None);
    assert_eq!(code, 0, "{stderr}");
    assert!(stdout.starts_with("destroyed "), "{stdout}");
    assert!(!fx.home().exists());
}
