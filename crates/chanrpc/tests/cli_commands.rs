#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/chanrpc-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() >= timeout {
            panic!("socket {} never appeared", path.display());
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn start_server(path: &Path) -> Child {
    let child = Command::new(env!("CARGO_BIN_EXE_chanrpc"))
        .arg("--log-level")
        .arg("error")
        .arg("serve")
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("serve command should start");
    wait_for_socket(path, Duration::from_secs(3));
    child
}

fn call(path: &Path, method: &str, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_chanrpc"));
    command
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("json")
        .arg("call")
        .arg(path)
        .arg(method)
        .arg("--timeout")
        .arg("3s");
    for arg in args {
        command.arg("--arg").arg(arg);
    }
    command.output().expect("call should run")
}

#[test]
fn call_against_demo_server_returns_result() {
    let dir = unique_temp_dir("call");
    let sock_path = dir.join("demo.sock");
    let mut child = start_server(&sock_path);

    let output = call(&sock_path, "demo/$add", &["1", "2"]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"status\":\"ok\""), "stdout: {stdout}");
    assert!(stdout.contains("\"result\":3"), "stdout: {stdout}");

    let streamed = call(&sock_path, "demo/$ticks", &["2"]);
    assert!(streamed.status.success());
    let stdout = String::from_utf8_lossy(&streamed.stdout);
    assert!(stdout.contains("\"status\":\"streamed\""), "stdout: {stdout}");
    assert!(stdout.contains("tick 2"), "stdout: {stdout}");

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unknown_method_is_reported_not_failed() {
    let dir = unique_temp_dir("missing-method");
    let sock_path = dir.join("demo.sock");
    let mut child = start_server(&sock_path);

    let output = call(&sock_path, "demo/$nope", &[]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"status\":\"not_registered\""), "stdout: {stdout}");

    let failed = call(&sock_path, "demo/$fail", &[]);
    assert_eq!(failed.status.code(), Some(1));

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_socket_is_a_transport_error() {
    let dir = unique_temp_dir("no-socket");
    let output = call(&dir.join("absent.sock"), "demo/$echo", &[]);
    assert_eq!(output.status.code(), Some(3));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn invalid_json_arg_is_a_usage_error() {
    let dir = unique_temp_dir("bad-arg");
    let output = call(&dir.join("absent.sock"), "demo/$echo", &["not json"]);
    assert_eq!(output.status.code(), Some(64));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_prints_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_chanrpc"))
        .arg("version")
        .output()
        .expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("chanrpc {}", env!("CARGO_PKG_VERSION"))
    );
}
