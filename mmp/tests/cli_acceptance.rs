use mmp_core::{Database, MessageKind};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

// Nothing listens on the discard port, so every delivery fails fast
const CONFIG: &str = r#"
[api]
base_url = "http://127.0.0.1:9"
flush_interval_secs = 3600
timeout_secs = 2
disable_decide = true

[tracking]
track_automatic_events = false
"#;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(xdg_config.join("mmp")).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");
        fs::write(xdg_config.join("mmp/config.toml"), CONFIG).expect("failed to write config");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("mmp/mmp.db")
    }

    fn pending(&self, token: &str) -> Vec<String> {
        let db = Database::open(&self.db_path()).expect("failed to open db");
        db.migrate().expect("failed to migrate db");
        db.select_records(token, MessageKind::Events, 100)
            .expect("failed to read queue")
            .into_iter()
            .map(|r| {
                let msg: serde_json::Value = serde_json::from_str(&r.payload).unwrap();
                msg["event"].as_str().unwrap_or_default().to_string()
            })
            .collect()
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("mmp"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute mmp: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "mmp {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn run_ok(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run_bin(env, args);
    assert_success(args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn track_queues_event_in_database() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["track", "tok", "Signed Up", "-p", "plan=pro", "-p", "seats=3"]);
    assert!(
        stdout.contains("Queued \"Signed Up\" for tok"),
        "unexpected track output:\n{stdout}"
    );
    assert!(env.db_path().exists(), "database should exist at {}", env.db_path().display());

    let db = Database::open(&env.db_path()).expect("failed to open db");
    let records = db
        .select_records("tok", MessageKind::Events, 10)
        .expect("failed to read queue");
    assert_eq!(records.len(), 1);
    let msg: serde_json::Value = serde_json::from_str(&records[0].payload).unwrap();
    assert_eq!(msg["event"], "Signed Up");
    assert_eq!(msg["properties"]["plan"], "pro");
    assert_eq!(msg["properties"]["seats"], 3);
}

#[test]
fn status_lists_pending_records_per_token() {
    let env = CliTestEnv::new();
    run_ok(&env, &["track", "tok", "one"]);
    run_ok(&env, &["track", "tok", "two", "--distinct-id", "user-7"]);

    let stdout = run_ok(&env, &["status", "tok"]);
    assert!(stdout.contains("http://127.0.0.1:9"), "endpoint missing:\n{stdout}");
    assert!(stdout.contains("Distinct ID:   user-7"), "identity missing:\n{stdout}");
    assert!(stdout.contains("Opted out:     false"));
    // one, $identify, two
    assert!(stdout.contains("Pending:       3"), "pending count missing:\n{stdout}");
    assert_eq!(env.pending("tok"), vec!["one", "$identify", "two"]);
}

#[test]
fn flush_against_unreachable_server_keeps_records() {
    let env = CliTestEnv::new();
    run_ok(&env, &["track", "tok", "kept"]);

    let stdout = run_ok(&env, &["flush", "tok", "--timeout-secs", "10"]);
    assert!(
        stdout.contains("records stay queued"),
        "flush should report that records stay queued:\n{stdout}"
    );
    assert_eq!(env.pending("tok"), vec!["kept"]);
}

#[test]
fn flush_with_empty_queue_is_a_no_op() {
    let env = CliTestEnv::new();
    let stdout = run_ok(&env, &["flush", "tok"]);
    assert!(stdout.contains("Nothing queued for tok"));
}

#[test]
fn opt_out_drops_queue_and_blocks_tracking() {
    let env = CliTestEnv::new();
    run_ok(&env, &["track", "tok", "before"]);

    let stdout = run_ok(&env, &["opt-out", "tok"]);
    assert!(stdout.contains("Opted out tok; dropped 1 queued records"), "got:\n{stdout}");

    let stdout = run_ok(&env, &["track", "tok", "after"]);
    assert!(stdout.contains("opted out"), "got:\n{stdout}");
    assert!(env.pending("tok").is_empty());

    run_ok(&env, &["opt-in", "tok"]);
    assert_eq!(env.pending("tok"), vec!["$opt_in"]);
}

#[test]
fn people_set_queues_profile_update() {
    let env = CliTestEnv::new();
    let stdout = run_ok(&env, &["people-set", "tok", "user-3", "-p", "name=Ada"]);
    assert!(stdout.contains("Queued profile update for user-3"), "got:\n{stdout}");

    let db = Database::open(&env.db_path()).expect("failed to open db");
    let records = db
        .select_records("tok", MessageKind::People, 10)
        .expect("failed to read queue");
    assert_eq!(records.len(), 1);
    let msg: serde_json::Value = serde_json::from_str(&records[0].payload).unwrap();
    assert_eq!(msg["$distinct_id"], "user-3");
    assert_eq!(msg["$set"]["name"], "Ada");
}

#[test]
fn malformed_property_fails() {
    let env = CliTestEnv::new();
    let output = run_bin(&env, &["track", "tok", "x", "-p", "novalue"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("key=value"), "got:\n{stderr}");
}

#[test]
fn explicit_config_path_overrides_default() {
    let env = CliTestEnv::new();
    let path = env.home.join("alt.toml");
    fs::write(
        &path,
        CONFIG.replace("http://127.0.0.1:9", "http://127.0.0.1:10"),
    )
    .expect("failed to write alt config");

    let path_arg = path.to_string_lossy().into_owned();
    let stdout = run_ok(&env, &["--config", &path_arg, "status"]);
    assert!(stdout.contains("http://127.0.0.1:10"), "got:\n{stdout}");
}
