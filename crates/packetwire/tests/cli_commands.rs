#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/pwcli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn spawn_serve(path: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_packetwire"))
        .arg("--log-level")
        .arg("error")
        .arg("serve")
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("serve command should start")
}

fn request(path: &Path, extra: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_packetwire"))
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("json")
        .arg("request")
        .arg(path)
        .args(extra)
        .output()
        .expect("request command should run")
}

fn request_until_ready(path: &Path, extra: &[&str], timeout: Duration) -> Output {
    let start = Instant::now();
    loop {
        let output = request(path, extra);
        if output.status.success() || start.elapsed() >= timeout {
            return output;
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn stop(mut child: Child, dir: &Path) {
    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn request_against_echo_server_prints_response() {
    let dir = unique_temp_dir("echo");
    let sock_path = dir.join("echo.sock");
    let child = spawn_serve(&sock_path);

    let output = request_until_ready(
        &sock_path,
        &["--data", "hello", "-H", "trace=abc"],
        Duration::from_secs(5),
    );
    stop(child, &dir);

    assert!(
        output.status.success(),
        "request failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    let line: serde_json::Value =
        serde_json::from_str(stdout.trim()).expect("json output should parse");
    assert_eq!(line["payload"], "hello");
    assert_eq!(line["headers"]["trace"], "abc");
}

#[test]
fn request_without_stream_ids_uses_next_packet() {
    let dir = unique_temp_dir("plain");
    let sock_path = dir.join("plain.sock");
    let child = Command::new(env!("CARGO_BIN_EXE_packetwire"))
        .arg("--log-level")
        .arg("error")
        .arg("--no-stream-ids")
        .arg("serve")
        .arg(&sock_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("serve command should start");

    let output = request_until_ready(
        &sock_path,
        &["--no-stream-ids", "--json", "{\"n\":1}"],
        Duration::from_secs(5),
    );
    stop(child, &dir);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("{\\\"n\\\":1}"), "unexpected output: {stdout}");
}

#[test]
fn request_to_missing_socket_is_transport_error() {
    let dir = unique_temp_dir("missing");
    let output = request(&dir.join("absent.sock"), &["--data", "x", "--timeout", "500ms"]);
    let _ = std::fs::remove_dir_all(&dir);

    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("connect failed"), "unexpected stderr: {stderr}");
}

#[test]
fn invalid_delimiter_is_usage_error() {
    let dir = unique_temp_dir("delim");
    let output = Command::new(env!("CARGO_BIN_EXE_packetwire"))
        .arg("--delimiter")
        .arg("\\x02")
        .arg("serve")
        .arg(dir.join("never.sock"))
        .output()
        .expect("serve command should run");
    let _ = std::fs::remove_dir_all(&dir);

    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn version_prints_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_packetwire"))
        .arg("version")
        .output()
        .expect("version command should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}
