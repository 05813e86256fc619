use std::io::Read;
use std::path::Path;
use std::time::Duration;

use assert_cmd::Command;
use predicates::str::contains;
use tiny_http::{Response, Server};

use upkeep::journal;
use upkeep_store::{FileStore, Store};

fn write_config(dir: &Path, server_url: &str) -> std::path::PathBuf {
    let config_path = dir.join("upkeep.toml");
    std::fs::write(dir.join("device_type"), "device_type=test-box\n").expect("write");
    std::fs::create_dir_all(dir.join("modules")).expect("mkdir");
    std::fs::create_dir_all(dir.join("scripts")).expect("mkdir");
    std::fs::create_dir_all(dir.join("inventory")).expect("mkdir");

    std::fs::write(
        &config_path,
        format!(
            r#"
server_url = "{server_url}"
device_type_file = "{device_type}"
data_dir = "{data}"
module_dir = "{modules}"
inventory_scripts_dir = "{inventory}"
update_poll_interval = "1h"
inventory_poll_interval = "1h"
http_timeout = "5s"

[scripts]
rootfs_dir = "{scripts}"
artifact_dir = "{artifact_scripts}"
"#,
            device_type = dir.join("device_type").display(),
            data = dir.join("data").display(),
            modules = dir.join("modules").display(),
            inventory = dir.join("inventory").display(),
            scripts = dir.join("scripts").display(),
            artifact_scripts = dir.join("artifact-scripts").display(),
        ),
    )
    .expect("write config");
    config_path
}

fn upkeepd() -> Command {
    Command::cargo_bin("upkeepd").expect("binary")
}

#[test]
fn help_lists_subcommands() {
    upkeepd()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("daemon"))
        .stdout(contains("check-update"))
        .stdout(contains("send-inventory"))
        .stdout(contains("show-artifact"))
        .stdout(contains("show-provides"));
}

#[test]
fn show_artifact_prints_installed_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(dir.path(), "http://localhost:1");

    {
        let store = FileStore::open(&dir.path().join("data/store")).expect("open");
        store
            .write(journal::KEY_ARTIFACT_NAME, b"release-42")
            .expect("write");
    }

    upkeepd()
        .arg("--config")
        .arg(&config)
        .arg("show-artifact")
        .assert()
        .success()
        .stdout(contains("release-42"));
}

#[test]
fn show_artifact_without_store_prints_unknown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(dir.path(), "http://localhost:1");

    upkeepd()
        .arg("--config")
        .arg(&config)
        .arg("show-artifact")
        .assert()
        .success()
        .stdout(contains("unknown"));
}

#[test]
fn show_provides_prints_full_map_as_json() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(dir.path(), "http://localhost:1");

    {
        let store = FileStore::open(&dir.path().join("data/store")).expect("open");
        store
            .write(journal::KEY_ARTIFACT_NAME, b"release-42")
            .expect("write");
        store
            .write(journal::KEY_ARTIFACT_PROVIDES, br#"{"rootfs-image.version": "42"}"#)
            .expect("write");
    }

    upkeepd()
        .arg("--config")
        .arg(&config)
        .arg("show-provides")
        .assert()
        .success()
        .stdout(contains("\"artifact_name\": \"release-42\""))
        .stdout(contains("\"rootfs-image.version\": \"42\""));
}

#[test]
fn malformed_config_exits_with_code_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("upkeep.toml");
    std::fs::write(&config, "server_url = [broken").expect("write");

    upkeepd()
        .arg("--config")
        .arg(&config)
        .arg("show-artifact")
        .assert()
        .code(1)
        .stderr(contains("config"));
}

#[test]
fn invalid_interval_flag_exits_with_code_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(dir.path(), "http://localhost:1");

    upkeepd()
        .arg("--config")
        .arg(&config)
        .arg("--update-poll-interval")
        .arg("not-a-duration")
        .arg("check-update")
        .assert()
        .code(1)
        .stderr(contains("--update-poll-interval"));
}

#[test]
fn check_update_with_no_deployment_exits_cleanly() {
    // Minimal device API: 204 on the poll, 200 elsewhere.
    let server = Server::http("127.0.0.1:0").expect("bind");
    let base = format!("http://{}", server.server_addr());
    let handle = std::thread::spawn(move || {
        let deadline = std::time::Instant::now() + Duration::from_secs(20);
        while std::time::Instant::now() < deadline {
            let Ok(Some(mut request)) = server.recv_timeout(Duration::from_millis(50)) else {
                continue;
            };
            let mut body = String::new();
            let _ = request.as_reader().read_to_string(&mut body);
            let code = if request.url().contains("/deployments/next") {
                204
            } else {
                200
            };
            let _ = request.respond(Response::from_string("").with_status_code(code));
        }
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(dir.path(), &base);

    upkeepd()
        .arg("--config")
        .arg(&config)
        .arg("check-update")
        .assert()
        .success();

    drop(handle);
}
