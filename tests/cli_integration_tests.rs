/// Integration tests for the CLI interface
use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command as StdCommand, Stdio};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

/// Helper function to create a command for testing
fn bridge_cmd() -> Command {
    Command::cargo_bin("pcsc-bridge").expect("Failed to find pcsc-bridge binary")
}

/// A `serve --mock` process, killed on drop
struct MockServer {
    child: Child,
    addr: String,
}

impl MockServer {
    fn start() -> Self {
        let port = TcpListener::bind("127.0.0.1:0")
            .and_then(|listener| listener.local_addr())
            .expect("Failed to pick a port")
            .port();
        let addr = format!("127.0.0.1:{port}");

        let child = StdCommand::new(assert_cmd::cargo::cargo_bin("pcsc-bridge"))
            .args(["serve", "--mock", "--listen", &addr])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to start pcsc-bridge serve");

        let deadline = Instant::now() + Duration::from_secs(10);
        while TcpStream::connect(&addr).is_err() {
            assert!(Instant::now() < deadline, "server did not come up on {addr}");
            std::thread::sleep(Duration::from_millis(50));
        }

        Self { child, addr }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn test_help_command() {
    let mut cmd = bridge_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Remote smart card bridge"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("transmit"))
        .stdout(predicate::str::contains("watch"));
}

#[test]
fn test_version_command() {
    let mut cmd = bridge_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pcsc-bridge"));
}

#[test]
fn test_invalid_command() {
    let mut cmd = bridge_cmd();
    cmd.arg("invalid-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_transmit_without_args() {
    let mut cmd = bridge_cmd();
    cmd.arg("transmit")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_transmit_invalid_hex() {
    let mut cmd = bridge_cmd();
    cmd.arg("transmit")
        .arg("0")
        .arg("invalid_hex")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse APDU"));
}

#[test]
fn test_transmit_invalid_format() {
    let mut cmd = bridge_cmd();
    cmd.args(["transmit", "0", "00A40400", "--format", "binary"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid format"));
}

#[test]
fn test_script_nonexistent_file() {
    let mut cmd = bridge_cmd();
    cmd.arg("script")
        .arg("/nonexistent/file.txt")
        .arg("0")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to open script file"));
}

#[test]
fn test_connect_refused() {
    let port = TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .unwrap()
        .port();

    let mut cmd = bridge_cmd();
    cmd.args(["list", "--connect", &format!("127.0.0.1:{port}")])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to connect to bridge"));
}

#[test]
#[serial]
fn test_list_against_mock_server() {
    let server = MockServer::start();

    let mut cmd = bridge_cmd();
    cmd.args(["list", "--connect", &server.addr])
        .assert()
        .success()
        .stdout(predicate::str::contains("[0] Mock Reader 1"))
        .stdout(predicate::str::contains("[2] Mock Reader 3"));

    let mut cmd = bridge_cmd();
    cmd.args(["list", "--detailed", "--connect", &server.addr])
        .assert()
        .success()
        .stdout(predicate::str::contains("Card present"))
        .stdout(predicate::str::contains("No card"))
        .stdout(predicate::str::contains("ATR: 3B AC 00 40"));
}

#[test]
#[serial]
fn test_transmit_against_mock_server() {
    let server = MockServer::start();

    let mut cmd = bridge_cmd();
    cmd.args(["transmit", "0", "00B0000005", "--connect", &server.addr])
        .assert()
        .success()
        .stdout(predicate::str::contains("APDU: 00 B0 00 00 05"))
        .stdout(predicate::str::contains("Response: 48 65 6C 6C 6F 90 00"))
        .stdout(predicate::str::contains("Status: 90 00 (Success)"));

    let mut cmd = bridge_cmd();
    cmd.args(["transmit", "0", "00B0000005", "--format", "ascii", "--connect", &server.addr])
        .assert()
        .success()
        .stdout(predicate::str::contains("Response (ASCII): Hello"));
}

#[test]
#[serial]
fn test_transmit_to_empty_reader_fails() {
    let server = MockServer::start();

    let mut cmd = bridge_cmd();
    cmd.args(["transmit", "1", "00A40400", "--connect", &server.addr])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to connect to reader: Mock Reader 2"));
}

#[test]
#[serial]
fn test_atr_against_mock_server() {
    let server = MockServer::start();

    let mut cmd = bridge_cmd();
    cmd.args(["atr", "Mock Reader 3", "--connect", &server.addr])
        .assert()
        .success()
        .stdout(predicate::str::contains("ATR: 3B 75 13 00 00 47 09 EA 90 00"));
}

#[test]
#[serial]
fn test_script_against_mock_server() {
    let server = MockServer::start();

    let mut script = NamedTempFile::new().unwrap();
    writeln!(script, "# Select then read").unwrap();
    writeln!(script, "transmit 00A40400").unwrap();
    writeln!(script).unwrap();
    writeln!(script, "// comment").unwrap();
    writeln!(script, "transmit 00B0000005").unwrap();
    writeln!(script, "atr").unwrap();
    writeln!(script, "reset").unwrap();
    script.flush().unwrap();

    let mut cmd = bridge_cmd();
    cmd.arg("script")
        .arg(script.path())
        .arg("0")
        .args(["--connect", &server.addr])
        .assert()
        .success()
        .stdout(predicate::str::contains("Response: 48 65 6C 6C 6F 90 00"))
        .stdout(predicate::str::contains("Script execution completed."))
        .stdout(predicate::str::contains("Errors encountered").not());
}

#[test]
#[serial]
fn test_script_stops_on_error() {
    let server = MockServer::start();

    let mut script = NamedTempFile::new().unwrap();
    writeln!(script, "bogus 1234").unwrap();
    writeln!(script, "transmit 00A40400").unwrap();
    script.flush().unwrap();

    let mut cmd = bridge_cmd();
    cmd.arg("script")
        .arg(script.path())
        .arg("0")
        .args(["--connect", &server.addr])
        .assert()
        .failure()
        .stdout(predicate::str::contains("ERROR: Unknown command: bogus"))
        .stderr(predicate::str::contains("stopped due to error on line 1"));

    let mut cmd = bridge_cmd();
    cmd.arg("script")
        .arg(script.path())
        .arg("0")
        .args(["--connect", &server.addr, "--continue-on-error"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Errors encountered: 1"));
}
