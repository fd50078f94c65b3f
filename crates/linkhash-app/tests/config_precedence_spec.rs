use std::{
    env,
    ffi::{OsStr, OsString},
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, OnceLock},
};

use linkhash_app::config::{self, AppConfigError};
use tempfile::TempDir;

const TRACKED_VARS: [&str; 7] = [
    "HOME",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
    "LINKHASH_ETC_CONFIG_DIR",
    "LINKHASH_CONFIG_FILE",
    "LINKHASH__SERVER__LISTEN_ADDR",
    "LINKHASH__WORKERS__CHUNK_SIZE",
];

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Isolated process environment for one test: a scratch HOME/XDG tree and
/// cwd, restored on drop.
struct ConfigSandbox {
    _lock: MutexGuard<'static, ()>,
    saved: Vec<(&'static str, Option<OsString>)>,
    original_dir: PathBuf,
    root: TempDir,
}

impl ConfigSandbox {
    fn new() -> Self {
        let lock = ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let saved = TRACKED_VARS
            .iter()
            .map(|&name| (name, env::var_os(name)))
            .collect();
        let original_dir = env::current_dir().expect("current dir");
        let root = TempDir::new().expect("temp root");

        for name in TRACKED_VARS {
            remove_var(name);
        }
        set_var("HOME", root.path());
        set_var("XDG_CONFIG_HOME", root.path().join("xdg_config"));
        set_var("XDG_DATA_HOME", root.path().join("xdg_data"));
        set_var("LINKHASH_ETC_CONFIG_DIR", root.path().join("etc"));
        env::set_current_dir(root.path()).expect("enter sandbox");

        Self {
            _lock: lock,
            saved,
            original_dir,
            root,
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }
}

impl Drop for ConfigSandbox {
    fn drop(&mut self) {
        let _ = env::set_current_dir(&self.original_dir);
        for (name, value) in self.saved.drain(..) {
            match value {
                Some(value) => set_var(name, value),
                None => remove_var(name),
            }
        }
    }
}

fn write_toml(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create config dir");
    }
    fs::write(path, contents).expect("write config file");
}

fn listen_addr(addr: &str) -> String {
    format!("[server]\nlisten_addr = \"{addr}\"\n")
}

fn set_var(name: &str, value: impl AsRef<OsStr>) {
    unsafe { env::set_var(name, value) }
}

fn remove_var(name: &str) {
    unsafe { env::remove_var(name) }
}

#[test]
fn later_sources_override_earlier_ones() {
    let sandbox = ConfigSandbox::new();
    let etc = sandbox.path("etc/linkhash/settings.toml");
    let xdg = sandbox.path("xdg_config/linkhash/settings.toml");
    let local = sandbox.path("config/settings.toml");
    let explicit = sandbox.path("explicit.toml");

    write_toml(&etc, &listen_addr("127.0.0.1:9101"));
    write_toml(&xdg, &listen_addr("127.0.0.1:9102"));
    write_toml(&local, &listen_addr("127.0.0.1:9103"));
    write_toml(&explicit, &listen_addr("127.0.0.1:9104"));
    set_var("LINKHASH_CONFIG_FILE", &explicit);
    set_var("LINKHASH__SERVER__LISTEN_ADDR", "127.0.0.1:9105");

    let expected = [
        "127.0.0.1:9105",
        "127.0.0.1:9104",
        "127.0.0.1:9103",
        "127.0.0.1:9102",
        "127.0.0.1:9101",
        "127.0.0.1:8080",
    ];
    for (step, addr) in expected.iter().enumerate() {
        let cfg = config::load().expect("load config");
        assert_eq!(cfg.server.listen_addr, *addr, "step {step}");
        match step {
            0 => remove_var("LINKHASH__SERVER__LISTEN_ADDR"),
            1 => remove_var("LINKHASH_CONFIG_FILE"),
            2 => fs::remove_file(&local).expect("remove local"),
            3 => fs::remove_file(&xdg).expect("remove xdg"),
            4 => fs::remove_file(&etc).expect("remove etc"),
            _ => {}
        }
    }
}

#[test]
fn defaults_cover_workers_and_storage() {
    let _sandbox = ConfigSandbox::new();
    let cfg = config::load().expect("load defaults");
    assert_eq!(cfg.workers.chunk_size, 1_000);
    assert!(cfg.workers.concurrency >= 1);
    assert!(cfg.storage.map_size_bytes > 0);
    assert!(cfg.storage.path.is_absolute());
}

#[test]
fn env_values_are_parsed_and_validated() {
    let _sandbox = ConfigSandbox::new();
    set_var("LINKHASH__WORKERS__CHUNK_SIZE", "250");
    let cfg = config::load().expect("numeric override");
    assert_eq!(cfg.workers.chunk_size, 250);

    set_var("LINKHASH__WORKERS__CHUNK_SIZE", "0");
    assert!(matches!(config::load(), Err(AppConfigError::Invalid(_))));
}

#[test]
fn missing_explicit_file_is_an_error() {
    let sandbox = ConfigSandbox::new();
    set_var("LINKHASH_CONFIG_FILE", sandbox.path("absent.toml"));
    assert!(matches!(config::load(), Err(AppConfigError::Build(_))));
}
