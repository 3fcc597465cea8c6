//! Integration tests for serialbus

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// Run against a config file that does not exist so defaults apply
    fn serialbus(temp: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("serialbus");
        cmd.arg("-c").arg(temp.path().join("config.toml"));
        cmd
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("serialbus")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("RFCOMM serial port registry"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("serialbus")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("serialbus"));
    }

    #[test]
    fn interface_lists_port_methods() {
        let temp = TempDir::new().unwrap();
        serialbus(&temp)
            .args(["interface", "--format", "plain"])
            .assert()
            .success()
            .stdout(
                predicate::str::contains("GetAddress")
                    .and(predicate::str::contains("GetServiceName"))
                    .and(predicate::str::contains("GetInfo")),
            );
    }

    #[test]
    fn interface_json() {
        let temp = TempDir::new().unwrap();
        serialbus(&temp)
            .args(["interface", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"org.bluez.serial.Port\""));
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        serialbus(&temp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        serialbus(&temp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[serial]").and(predicate::str::contains("[bus]")));
    }

    #[test]
    fn config_init_then_exists() {
        let temp = TempDir::new().unwrap();
        serialbus(&temp)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));
        assert!(temp.path().join("config.toml").exists());

        serialbus(&temp)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn invalid_config_fails() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.toml"), "[serial\n").unwrap();
        serialbus(&temp)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn serve_obex_session() {
        let temp = TempDir::new().unwrap();
        let input = [
            r#"{"op":"bind","device":"/dev/rfcomm0","id":0,"service":"OBEX"}"#,
            r#"{"op":"connect","device":"/dev/rfcomm0","owner":"org.client.Z"}"#,
            r#"{"op":"disconnect","owner":"org.client.Y","device":"/dev/rfcomm0"}"#,
            r#"{"op":"disconnect","owner":"org.client.Z","device":"/dev/rfcomm0"}"#,
        ]
        .join("\n");

        serialbus(&temp)
            .arg("serve")
            .write_stdin(input)
            .assert()
            .success()
            .stdout(
                predicate::str::contains("/org/bluez/serial/rfcomm0")
                    .and(predicate::str::contains("\"forbidden\""))
                    .and(predicate::str::contains("ServiceDisconnected")),
            );
    }

    #[test]
    fn serve_rejects_malformed_request() {
        let temp = TempDir::new().unwrap();
        serialbus(&temp)
            .arg("serve")
            .write_stdin("not json\n{\"op\":\"list\"}\n")
            .assert()
            .success()
            .stdout(
                predicate::str::contains("invalid-request")
                    .and(predicate::str::contains("\"ok\":true")),
            );
    }

    #[test]
    fn serve_releases_connected_ports_at_eof() {
        let temp = TempDir::new().unwrap();
        serialbus(&temp)
            .arg("serve")
            .write_stdin("{\"op\":\"connect\",\"owner\":\"org.client.A\"}\n")
            .assert()
            .success()
            .stdout(predicate::str::contains("ServiceDisconnected"));
    }

    #[test]
    fn serve_permissive_allows_duplicate_device() {
        let temp = TempDir::new().unwrap();
        let input = [
            r#"{"op":"bind","id":0,"device":"/dev/rfcomm0"}"#,
            r#"{"op":"bind","id":1,"device":"/dev/rfcomm0"}"#,
        ]
        .join("\n");

        serialbus(&temp)
            .args(["serve", "--permissive"])
            .write_stdin(input.clone())
            .assert()
            .success()
            .stdout(predicate::str::contains("device-in-use").not());

        serialbus(&temp)
            .arg("serve")
            .write_stdin(input)
            .assert()
            .success()
            .stdout(predicate::str::contains("device-in-use"));
    }
}
