use assert_cmd::Command;
use tempfile::TempDir;

fn sshtunnel(config_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("sshtunnel").unwrap();
    cmd.arg("--config").arg(config_dir.path().join("absent.toml"));
    cmd.env_remove("RUST_LOG");
    cmd
}

fn stderr_of(cmd: &mut Command) -> String {
    let output = cmd.output().unwrap();
    assert!(!output.status.success());
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn help_lists_arguments() {
    let output = Command::cargo_bin("sshtunnel").unwrap().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("DESTINATION"));
    assert!(stdout.contains("--local-port"));
    assert!(stdout.contains("--insecure-accept-any-host"));
}

#[test]
fn missing_gateway_is_reported() {
    let dir = TempDir::new().unwrap();
    let stderr = stderr_of(&mut sshtunnel(&dir));
    assert!(stderr.contains("no gateway"), "stderr: {stderr}");
}

#[test]
fn invalid_local_port_is_reported() {
    let dir = TempDir::new().unwrap();
    let stderr = stderr_of(sshtunnel(&dir).args(["bastion", "db:5432", "-l", "http"]));
    assert!(stderr.contains("invalid local port"), "stderr: {stderr}");
}

#[test]
fn destination_without_port_is_reported() {
    let dir = TempDir::new().unwrap();
    let stderr = stderr_of(sshtunnel(&dir).args(["bastion", "db"]));
    assert!(stderr.contains("destination"), "stderr: {stderr}");
}

#[test]
fn insecure_conflicts_with_fingerprint() {
    let dir = TempDir::new().unwrap();
    let output = sshtunnel(&dir)
        .args(["bastion", "db:5432", "--insecure-accept-any-host", "--fingerprint", "SHA256:abc"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn config_file_supplies_arguments() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[tunnel]\ngateway = \"bastion\"\ndestination = \"db:5432\"\nlocal_port = \"not-a-port\"\n",
    )
    .unwrap();

    let output = Command::cargo_bin("sshtunnel")
        .unwrap()
        .arg("--config")
        .arg(&path)
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid local port 'not-a-port'"), "stderr: {stderr}");
}
