//! Stdio contract of the engine binary: framing, method set, EOF exit,
//! and the CLI surface.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Duration;

use predicates::prelude::*;
use serde_json::Value;

struct Engine {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<std::process::ChildStdout>,
    _dir: tempfile::TempDir,
}

fn spawn_engine() -> Engine {
    let dir = tempfile::tempdir().unwrap();
    let mut child = Command::new(assert_cmd::cargo::cargo_bin("fetchd"))
        .arg("--download-dir")
        .arg(dir.path())
        .arg("--database-path")
        .arg(dir.path().join("engine.db"))
        .arg("--log-level")
        .arg("error")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let stdin = child.stdin.take().unwrap();
    let stdout = BufReader::new(child.stdout.take().unwrap());
    Engine { child, stdin, stdout, _dir: dir }
}

impl Engine {
    fn send(&mut self, line: &str) {
        writeln!(self.stdin, "{line}").unwrap();
        self.stdin.flush().unwrap();
    }

    /// Reads lines until the response with the given id arrives, skipping
    /// interleaved events.
    fn read_response(&mut self, id: i64) -> Value {
        for _ in 0..200 {
            let mut line = String::new();
            let n = self.stdout.read_line(&mut line).unwrap();
            assert!(n > 0, "engine closed stdout before responding to {id}");
            let value: Value = serde_json::from_str(line.trim()).unwrap();
            if value.get("id").and_then(Value::as_i64) == Some(id) {
                return value;
            }
            assert!(value.get("event").is_some(), "non-event, non-matching line: {line}");
        }
        panic!("no response for id {id}");
    }
}

#[test]
fn version_unknown_method_and_clean_eof() {
    let mut engine = spawn_engine();

    engine.send(r#"{"id":1,"method":"get_engine_version","params":{}}"#);
    let response = engine.read_response(1);
    assert_eq!(
        response["result"]["version"].as_str().unwrap(),
        env!("CARGO_PKG_VERSION")
    );

    // Blank lines are tolerated.
    engine.send("");
    engine.send("   ");

    engine.send(r#"{"id":2,"method":"frobnicate","params":{}}"#);
    let response = engine.read_response(2);
    assert_eq!(response["error"]["code"].as_i64(), Some(-32601));

    engine.send(r#"{"id":3,"method":"get_all_downloads"}"#);
    let response = engine.read_response(3);
    assert!(response["result"].is_array());

    engine.send(r#"{"id":4,"method":"get_default_download_path","params":{}}"#);
    let response = engine.read_response(4);
    assert!(response["result"]["path"].as_str().is_some());

    // db_* passthroughs round-trip.
    engine.send(r#"{"id":5,"method":"db_set","params":{"key":"k1","value":"v1"}}"#);
    assert_eq!(engine.read_response(5)["result"]["ok"], true);
    engine.send(r#"{"id":6,"method":"db_get","params":{"key":"k1"}}"#);
    assert_eq!(engine.read_response(6)["result"]["value"], "v1");

    // Malformed params: pause_download without a gid.
    engine.send(r#"{"id":7,"method":"pause_download","params":{}}"#);
    let response = engine.read_response(7);
    assert_eq!(response["error"]["code"].as_i64(), Some(-32602));

    // Unknown gid: application error code for not_found.
    engine.send(r#"{"id":8,"method":"get_download_status","params":{"gid":"0123456789abcdef"}}"#);
    let response = engine.read_response(8);
    assert_eq!(response["error"]["code"].as_i64(), Some(-32002));

    // Closing stdin is the quit signal; the engine exits 0.
    drop(engine.stdin);
    let status = wait_with_timeout(&mut engine.child, Duration::from_secs(15));
    assert!(status.success(), "engine exited with {status:?}");
}

#[test]
fn cli_surface_is_flags_only() {
    // The engine has no subcommand grammar: --help documents the three
    // accepted long flags and nothing resembling a command verb.
    assert_cmd::Command::cargo_bin("fetchd")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--log-level"))
        .stdout(predicate::str::contains("--database-path"))
        .stdout(predicate::str::contains("--stop-with-process"))
        .stdout(predicate::str::contains("Commands:").not());

    assert_cmd::Command::cargo_bin("fetchd")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn unknown_flag_fails_before_startup() {
    assert_cmd::Command::cargo_bin("fetchd")
        .unwrap()
        .arg("--frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--frobnicate"));
}

#[test]
fn parse_magnet_round_trip_over_rpc() {
    let mut engine = spawn_engine();
    let hash = "0123456789abcdef0123456789abcdef01234567";
    engine.send(&format!(
        r#"{{"id":1,"method":"parse_magnet_uri","params":{{"uri":"magnet:?xt=urn:btih:{hash}&dn=Test&tr=udp%3A%2F%2Ft%3A6969%2Fann"}}}}"#
    ));
    let response = engine.read_response(1);
    assert_eq!(response["result"]["infoHash"], hash);
    assert_eq!(response["result"]["name"], "Test");
    assert_eq!(response["result"]["trackers"][0], "udp://t:6969/ann");

    drop(engine.stdin);
    let status = wait_with_timeout(&mut engine.child, Duration::from_secs(15));
    assert!(status.success());
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::process::ExitStatus {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if std::time::Instant::now() > deadline {
            let _ = child.kill();
            panic!("engine did not exit after stdin EOF");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
